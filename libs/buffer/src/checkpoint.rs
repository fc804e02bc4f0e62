//! Latest-per-item views
//!
//! A [`Checkpoint`] is the materialized "latest observation per data item"
//! map that Current is served from. Conditions keep their active set rather
//! than a single latest value, and data-set updates merge into the
//! accumulated set unless a reset was triggered.

use std::collections::BTreeMap;
use std::sync::Arc;

use types::{ConditionSet, ObservedValue, Observation};

#[derive(Debug, Clone)]
enum Entry {
    Latest(Arc<Observation>),
    Conditions(ConditionSet),
}

/// Snapshot of the newest state of every data item seen so far
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    entries: BTreeMap<String, Entry>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation into the view.
    pub fn add(&mut self, obs: &Arc<Observation>) {
        match &obs.value {
            ObservedValue::Condition(_) => {
                let entry = self
                    .entries
                    .entry(obs.data_item_id.clone())
                    .or_insert_with(|| Entry::Conditions(ConditionSet::new()));
                match entry {
                    Entry::Conditions(set) => set.apply(obs),
                    Entry::Latest(_) => {
                        let mut set = ConditionSet::new();
                        set.apply(obs);
                        *entry = Entry::Conditions(set);
                    }
                }
            }
            ObservedValue::DataSet(update) if obs.reset_triggered.is_none() => {
                let merged = match self.entries.get(&obs.data_item_id) {
                    Some(Entry::Latest(prev)) => match &prev.value {
                        ObservedValue::DataSet(base) => {
                            Some(merge_data_set(base, update, obs))
                        }
                        _ => None,
                    },
                    _ => None,
                };
                let latest = merged.unwrap_or_else(|| Arc::clone(obs));
                self.entries
                    .insert(obs.data_item_id.clone(), Entry::Latest(latest));
            }
            _ => {
                self.entries
                    .insert(obs.data_item_id.clone(), Entry::Latest(Arc::clone(obs)));
            }
        }
    }

    /// Latest observations for one data item: a single value, or the active
    /// condition entries newest first.
    pub fn get(&self, data_item_id: &str) -> Vec<Arc<Observation>> {
        match self.entries.get(data_item_id) {
            Some(Entry::Latest(obs)) => vec![Arc::clone(obs)],
            Some(Entry::Conditions(set)) => set.active().to_vec(),
            None => Vec::new(),
        }
    }

    /// Flatten the view in data-item order, optionally restricted to a
    /// filter set. Deterministic: two calls with no intervening `add`
    /// return identical output.
    pub fn observations(&self, filter: Option<&std::collections::HashSet<String>>) -> Vec<Arc<Observation>> {
        let mut out = Vec::new();
        for (id, entry) in &self.entries {
            if let Some(filter) = filter {
                if !filter.contains(id) {
                    continue;
                }
            }
            match entry {
                Entry::Latest(obs) => out.push(Arc::clone(obs)),
                Entry::Conditions(set) => out.extend(set.active().iter().cloned()),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Apply a partial data-set update on top of the accumulated set. Entries
/// flagged `removed` delete their key; the rest overwrite. The merged
/// observation keeps the update's identity and timestamp.
fn merge_data_set(
    base: &types::DataSet,
    update: &types::DataSet,
    obs: &Arc<Observation>,
) -> Arc<Observation> {
    let mut merged = base.clone();
    merged.retain(|_, entry| !entry.removed);
    for (key, entry) in update {
        if entry.removed {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), entry.clone());
        }
    }
    let mut combined = (**obs).clone();
    combined.value = ObservedValue::DataSet(merged);
    Arc::new(combined)
}
