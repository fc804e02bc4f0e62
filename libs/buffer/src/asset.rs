//! The asset buffer
//!
//! Bounded keyed storage for assets with secondary indexes by type and by
//! owning device. Removal tombstones an asset instead of erasing it: the
//! entry stays in the indexes and the per-index removal counters keep the
//! active counts cheap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use types::{Asset, Timestamp};

#[derive(Debug, Default)]
struct Inner {
    max_assets: usize,
    /// Insertion-or-update order, oldest first
    order: VecDeque<String>,
    by_id: HashMap<String, Arc<Asset>>,
    type_index: HashMap<String, HashSet<String>>,
    device_index: HashMap<String, HashSet<String>>,
    removed_count: usize,
    type_removed: HashMap<String, usize>,
    device_removed: HashMap<String, usize>,
}

impl Inner {
    fn index(&mut self, asset: &Asset) {
        self.type_index
            .entry(asset.asset_type.clone())
            .or_default()
            .insert(asset.asset_id.clone());
        if let Some(uuid) = &asset.device_uuid {
            self.device_index
                .entry(uuid.clone())
                .or_default()
                .insert(asset.asset_id.clone());
        }
    }

    fn unindex(&mut self, asset: &Asset) {
        if let Some(ids) = self.type_index.get_mut(&asset.asset_type) {
            ids.remove(&asset.asset_id);
            if ids.is_empty() {
                self.type_index.remove(&asset.asset_type);
            }
        }
        if let Some(uuid) = &asset.device_uuid {
            if let Some(ids) = self.device_index.get_mut(uuid) {
                ids.remove(&asset.asset_id);
                if ids.is_empty() {
                    self.device_index.remove(uuid);
                }
            }
        }
        if asset.removed {
            self.removed_count -= 1;
            decrement(&mut self.type_removed, &asset.asset_type);
            if let Some(uuid) = &asset.device_uuid {
                decrement(&mut self.device_removed, uuid);
            }
        }
    }

    fn mark_removed(&mut self, asset: &Asset) {
        self.removed_count += 1;
        *self.type_removed.entry(asset.asset_type.clone()).or_default() += 1;
        if let Some(uuid) = &asset.device_uuid {
            *self.device_removed.entry(uuid.clone()).or_default() += 1;
        }
    }

    fn erase(&mut self, id: &str) -> Option<Arc<Asset>> {
        let asset = self.by_id.remove(id)?;
        self.unindex(&asset);
        self.order.retain(|other| other != id);
        Some(asset)
    }
}

fn decrement(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Bounded keyed asset store with LRU-by-insertion eviction
pub struct AssetBuffer {
    inner: Mutex<Inner>,
}

impl AssetBuffer {
    pub fn new(max_assets: usize) -> Self {
        assert!(max_assets > 0, "asset buffer capacity must be nonzero");
        Self {
            inner: Mutex::new(Inner {
                max_assets,
                ..Inner::default()
            }),
        }
    }

    pub fn max_assets(&self) -> usize {
        self.inner.lock().unwrap().max_assets
    }

    /// Insert or replace by asset id. A replaced asset moves to the newest
    /// position. When the buffer overflows, the least-recently-added active
    /// asset is evicted. Returns the stored asset and, when an overflow
    /// happened, the evicted one.
    pub fn add(&self, asset: Asset) -> (Arc<Asset>, Option<Arc<Asset>>) {
        let mut inner = self.inner.lock().unwrap();
        let id = asset.asset_id.clone();

        if let Some(old) = inner.by_id.remove(&id) {
            inner.unindex(&old);
            inner.order.retain(|other| *other != id);
        }

        let stored = Arc::new(asset);
        inner.index(&stored);
        inner.by_id.insert(id.clone(), Arc::clone(&stored));
        inner.order.push_back(id);

        let mut evicted = None;
        if inner.by_id.len() > inner.max_assets {
            let victim = inner
                .order
                .iter()
                .find(|id| inner.by_id.get(*id).is_some_and(|a| !a.removed))
                .or_else(|| inner.order.front())
                .cloned();
            if let Some(victim) = victim {
                debug!(asset_id = %victim, "evicting asset at capacity");
                evicted = inner.erase(&victim);
            }
        }

        (stored, evicted)
    }

    /// Tombstone an asset. It stays indexed and queryable with
    /// `removed = true`; counts move from active to total-only.
    pub fn remove(&self, id: &str, timestamp: Option<Timestamp>) -> Option<Arc<Asset>> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.by_id.get(id)?;
        if current.removed {
            return Some(Arc::clone(current));
        }

        let mut marked = (**current).clone();
        marked.removed = true;
        if let Some(ts) = timestamp {
            marked.timestamp = ts;
        }
        let marked = Arc::new(marked);
        inner.by_id.insert(id.to_string(), Arc::clone(&marked));
        inner.mark_removed(&marked);
        Some(marked)
    }

    /// Tombstone every asset matching the type/device filters. Returns the
    /// marked assets, most recent first.
    pub fn remove_all(
        &self,
        asset_type: Option<&str>,
        device_uuid: Option<&str>,
        timestamp: Option<Timestamp>,
    ) -> Vec<Arc<Asset>> {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .order
                .iter()
                .rev()
                .filter(|id| {
                    inner.by_id.get(*id).is_some_and(|a| {
                        !a.removed
                            && asset_type.map_or(true, |t| a.asset_type == t)
                            && device_uuid
                                .map_or(true, |d| a.device_uuid.as_deref() == Some(d))
                    })
                })
                .cloned()
                .collect()
        };
        ids.iter()
            .filter_map(|id| self.remove(id, timestamp))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Asset>> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    /// Walk most-recent-first, applying type/device filters. Tombstoned
    /// assets are skipped unless `include_removed`.
    pub fn query(
        &self,
        asset_type: Option<&str>,
        device_uuid: Option<&str>,
        include_removed: bool,
        count: usize,
    ) -> Vec<Arc<Asset>> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|asset| {
                (include_removed || !asset.removed)
                    && asset_type.map_or(true, |t| asset.asset_type == t)
                    && device_uuid.map_or(true, |d| asset.device_uuid.as_deref() == Some(d))
            })
            .take(count)
            .cloned()
            .collect()
    }

    pub fn count(&self, active: bool) -> usize {
        let inner = self.inner.lock().unwrap();
        if active {
            inner.by_id.len() - inner.removed_count
        } else {
            inner.by_id.len()
        }
    }

    pub fn count_for_type(&self, asset_type: &str, active: bool) -> usize {
        let inner = self.inner.lock().unwrap();
        let total = inner.type_index.get(asset_type).map_or(0, HashSet::len);
        if active {
            total - inner.type_removed.get(asset_type).copied().unwrap_or(0)
        } else {
            total
        }
    }

    pub fn count_for_device(&self, device_uuid: &str, active: bool) -> usize {
        let inner = self.inner.lock().unwrap();
        let total = inner.device_index.get(device_uuid).map_or(0, HashSet::len);
        if active {
            total - inner.device_removed.get(device_uuid).copied().unwrap_or(0)
        } else {
            total
        }
    }

    /// Types present in the buffer with their active counts
    pub fn counts_by_type(&self, active: bool) -> HashMap<String, usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .type_index
            .iter()
            .map(|(type_, ids)| {
                let removed = if active {
                    inner.type_removed.get(type_).copied().unwrap_or(0)
                } else {
                    0
                };
                (type_.clone(), ids.len() - removed)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn asset(id: &str, type_: &str, device: Option<&str>) -> Asset {
        let mut asset = Asset::new(id, type_, Utc::now(), serde_json::json!({"id": id}));
        if let Some(device) = device {
            asset = asset.for_device(device);
        }
        asset
    }

    #[test]
    fn same_id_replaces_and_moves_to_newest() {
        let buffer = AssetBuffer::new(4);
        buffer.add(asset("T1", "CuttingTool", None));
        buffer.add(asset("T2", "CuttingTool", None));
        buffer.add(asset("T1", "CuttingTool", None));

        assert_eq!(2, buffer.count(true));
        let newest_first = buffer.query(None, None, false, 10);
        assert_eq!(
            vec!["T1", "T2"],
            newest_first.iter().map(|a| a.asset_id.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn overflow_evicts_least_recently_added_active() {
        let buffer = AssetBuffer::new(2);
        buffer.add(asset("T1", "CuttingTool", None));
        buffer.add(asset("T2", "CuttingTool", None));
        let (_, evicted) = buffer.add(asset("T3", "CuttingTool", None));

        assert_eq!("T1", evicted.unwrap().asset_id);
        assert!(buffer.get("T1").is_none());
        assert_eq!(2, buffer.count(false));
    }

    #[test]
    fn removal_tombstones_but_keeps_indexes() {
        let buffer = AssetBuffer::new(4);
        buffer.add(asset("T1", "CuttingTool", Some("dev-1")));
        buffer.add(asset("T2", "CuttingTool", Some("dev-1")));
        buffer.remove("T1", None);

        assert_eq!(1, buffer.count(true));
        assert_eq!(2, buffer.count(false));
        assert_eq!(1, buffer.count_for_type("CuttingTool", true));
        assert_eq!(2, buffer.count_for_type("CuttingTool", false));
        assert_eq!(1, buffer.count_for_device("dev-1", true));

        // Tombstoned asset is hidden unless asked for
        assert_eq!(1, buffer.query(None, None, false, 10).len());
        let with_removed = buffer.query(None, None, true, 10);
        assert_eq!(2, with_removed.len());
        assert!(buffer.get("T1").unwrap().removed);
    }

    #[test]
    fn replacing_a_tombstoned_asset_revives_it() {
        let buffer = AssetBuffer::new(4);
        buffer.add(asset("T1", "CuttingTool", None));
        buffer.remove("T1", None);
        assert_eq!(0, buffer.count(true));

        buffer.add(asset("T1", "CuttingTool", None));
        assert_eq!(1, buffer.count(true));
        assert!(!buffer.get("T1").unwrap().removed);
    }

    #[test]
    fn remove_all_by_type() {
        let buffer = AssetBuffer::new(8);
        buffer.add(asset("T1", "CuttingTool", None));
        buffer.add(asset("F1", "Fixture", None));
        buffer.add(asset("T2", "CuttingTool", None));

        let marked = buffer.remove_all(Some("CuttingTool"), None, None);
        assert_eq!(2, marked.len());
        assert_eq!("T2", marked[0].asset_id);
        assert_eq!(0, buffer.count_for_type("CuttingTool", true));
        assert_eq!(1, buffer.count(true));
    }

    #[test]
    fn query_filters_by_device() {
        let buffer = AssetBuffer::new(8);
        buffer.add(asset("T1", "CuttingTool", Some("dev-1")));
        buffer.add(asset("T2", "CuttingTool", Some("dev-2")));

        let for_dev1 = buffer.query(None, Some("dev-1"), false, 10);
        assert_eq!(1, for_dev1.len());
        assert_eq!("T1", for_dev1[0].asset_id);
    }
}
