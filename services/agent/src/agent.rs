//! The agent core
//!
//! Owns the device registry and both buffers, and implements the pipeline
//! contract every source delivers through. Startup seeds every data item
//! with UNAVAILABLE so Current is complete before the first frame arrives;
//! source disconnects return the affected device to that state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tracing::{debug, info, warn};

use buffer::{AssetBuffer, ChangeSignaler, CircularBuffer};
use codec::ProtocolCommand;
use pipeline::PipelineContract;
use types::{
    AssetCommand, AssetEvent, Condition, ConditionLevel, DataItem, DataItemRegistry, Device,
    Observation, ObservedValue, Scalar, SequenceNumber, Timestamp,
};

use crate::error::ServiceError;
use crate::Result;

/// Long-lived agent state shared by every source and server surface
pub struct Agent {
    registry: Arc<DataItemRegistry>,
    buffer: Arc<CircularBuffer>,
    assets: Arc<AssetBuffer>,
    /// Changes when the agent restarts; consumers detect it and re-seed
    instance_id: u64,
    sender: String,
    allow_put: bool,
}

impl Agent {
    pub fn new(
        registry: Arc<DataItemRegistry>,
        buffer_size: usize,
        checkpoint_frequency: u64,
        max_assets: usize,
        sender: impl Into<String>,
        allow_put: bool,
    ) -> Arc<Self> {
        let instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Arc::new(Self {
            registry,
            buffer: Arc::new(CircularBuffer::new(buffer_size, checkpoint_frequency)),
            assets: Arc::new(AssetBuffer::new(max_assets)),
            instance_id,
            sender: sender.into(),
            allow_put,
        })
    }

    pub fn registry(&self) -> &Arc<DataItemRegistry> {
        &self.registry
    }

    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buffer
    }

    pub fn assets(&self) -> &Arc<AssetBuffer> {
        &self.assets
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn allow_put(&self) -> bool {
        self.allow_put
    }

    /// Seed every data item with UNAVAILABLE so Current is complete before
    /// any source connects.
    pub fn seed_unavailable(&self) {
        let now = Utc::now();
        let mut seeded = 0usize;
        self.registry.each_data_item(&mut |item: &Arc<DataItem>| {
            self.buffer.add(unavailable_for(item, now));
            seeded += 1;
        });
        info!(data_items = seeded, "seeded initial unavailable observations");
    }

    /// Signaler for one data item, used by streaming observers
    pub fn signaler(&self, data_item_id: &str) -> Arc<ChangeSignaler> {
        self.buffer.signaler(data_item_id)
    }

    /// Header fields for a served document, snapshotting the buffers
    pub fn document_meta(&self) -> crate::formatter::DocumentMeta {
        let first = self.buffer.first_sequence();
        let next = self.buffer.next_sequence();
        crate::formatter::DocumentMeta {
            sender: self.sender.clone(),
            instance_id: self.instance_id,
            buffer_size: self.buffer.capacity(),
            first_sequence: first,
            next_sequence: next,
            last_sequence: next.saturating_sub(1),
            asset_buffer_size: self.assets.max_assets(),
            asset_count: self.assets.count(true),
        }
    }

    /// The data-item filter for a request: scoped to a device when named,
    /// narrowed by the path expression when present.
    pub fn filter_for(
        &self,
        device: Option<&str>,
        path: Option<&str>,
    ) -> Result<HashSet<String>> {
        let mut items = Vec::new();
        match device {
            Some(name) => {
                let device = self
                    .registry
                    .find_device(name)
                    .ok_or_else(|| ServiceError::UnknownDevice { device: name.to_string() })?;
                items.extend(device.data_items.iter().map(|di| di.id.clone()));
            }
            None => {
                self.registry
                    .each_data_item(&mut |di: &Arc<DataItem>| items.push(di.id.clone()));
            }
        }

        if let Some(path) = path {
            let terms: HashSet<String> = path
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .filter(|t| !t.is_empty())
                .map(str::to_lowercase)
                .collect();
            items.retain(|id| {
                let Some(di) = self.registry.find_data_item(None, id) else {
                    return false;
                };
                let mut keys = vec![di.id.to_lowercase(), di.type_.to_lowercase()];
                if let Some(name) = &di.name {
                    keys.push(name.to_lowercase());
                }
                keys.iter().any(|k| terms.contains(k))
            });
        }

        Ok(items.into_iter().collect())
    }

    /// A source established its connection: assert availability when the
    /// device model advertises it.
    pub fn source_connected(&self, device: Option<&str>, auto_available: bool) {
        if !auto_available {
            return;
        }
        let now = Utc::now();
        for item in self.availability_items(device) {
            self.buffer.add(Observation::new(
                item.id.clone(),
                now,
                ObservedValue::Scalar(Scalar::Text("AVAILABLE".to_string())),
            ));
        }
    }

    /// A source went away: everything it fed returns to UNAVAILABLE.
    pub fn source_disconnected(&self, device: Option<&str>) {
        let now = Utc::now();
        let mut marked = 0usize;
        self.for_device_items(device, &mut |item| {
            self.buffer.add(unavailable_for(item, now));
            marked += 1;
        });
        debug!(device = device.unwrap_or("*"), data_items = marked, "marked unavailable");
    }

    fn availability_items(&self, device: Option<&str>) -> Vec<Arc<DataItem>> {
        let mut found = Vec::new();
        self.for_device_items(device, &mut |item| {
            if item.type_.eq_ignore_ascii_case("AVAILABILITY") {
                found.push(Arc::clone(item));
            }
        });
        found
    }

    fn for_device_items(&self, device: Option<&str>, f: &mut dyn FnMut(&Arc<DataItem>)) {
        match device.and_then(|d| self.registry.find_device(d)) {
            Some(device) => {
                for di in &device.data_items {
                    if let Some(item) = self.registry.find_data_item(None, &di.id) {
                        f(&item);
                    }
                }
            }
            None => self.registry.each_data_item(f),
        }
    }

    fn apply_asset_command(&self, command: AssetCommand, default_device: Option<&str>) {
        match command {
            AssetCommand::Upsert(mut asset) => {
                if asset.device_uuid.is_none() {
                    asset.device_uuid = default_device
                        .and_then(|d| self.registry.find_device(d))
                        .or_else(|| self.registry.default_device())
                        .map(|d| d.uuid.clone());
                }
                let timestamp = asset.timestamp;
                let device_uuid = asset.device_uuid.clone();
                let asset_id = asset.asset_id.clone();
                let (stored, evicted) = self.assets.add(asset);
                if let Some(evicted) = evicted {
                    debug!(asset_id = %evicted.asset_id, "asset evicted at capacity");
                }
                self.emit_asset_marker(
                    "ASSET_CHANGED",
                    device_uuid.as_deref(),
                    &asset_id,
                    timestamp,
                );
                debug!(asset_id = %stored.asset_id, asset_type = %stored.asset_type, "asset stored");
            }
            AssetCommand::Remove { asset_id, timestamp } => {
                match self.assets.remove(&asset_id, Some(timestamp)) {
                    Some(removed) => {
                        self.emit_asset_marker(
                            "ASSET_REMOVED",
                            removed.device_uuid.as_deref(),
                            &asset_id,
                            timestamp,
                        );
                    }
                    None => warn!(asset_id = %asset_id, "remove for unknown asset"),
                }
            }
            AssetCommand::RemoveAll { asset_type, device_uuid, timestamp } => {
                let removed = self.assets.remove_all(
                    asset_type.as_deref(),
                    device_uuid.as_deref(),
                    Some(timestamp),
                );
                for asset in removed {
                    self.emit_asset_marker(
                        "ASSET_REMOVED",
                        asset.device_uuid.as_deref(),
                        &asset.asset_id,
                        timestamp,
                    );
                }
            }
        }
    }

    /// Observe ASSET_CHANGED/ASSET_REMOVED on the owning device, when its
    /// model carries such an item.
    fn emit_asset_marker(
        &self,
        marker_type: &str,
        device_uuid: Option<&str>,
        asset_id: &str,
        timestamp: Timestamp,
    ) {
        let device = device_uuid
            .and_then(|uuid| self.registry.find_device(uuid))
            .or_else(|| self.registry.default_device());
        let Some(device) = device else {
            return;
        };
        if let Some(item) = self.registry.find_by_type(&device.uuid, marker_type) {
            self.buffer.add(Observation::new(
                item.id.clone(),
                timestamp,
                ObservedValue::Scalar(Scalar::Text(asset_id.to_string())),
            ));
        }
    }
}

/// Default observation for an item with no live value. Conditions become
/// UNAVAILABLE condition entries rather than bare markers.
fn unavailable_for(item: &Arc<DataItem>, timestamp: Timestamp) -> Observation {
    let value = if item.is_condition() {
        ObservedValue::Condition(Condition {
            level: ConditionLevel::Unavailable,
            native_code: None,
            native_severity: None,
            qualifier: None,
            message: None,
        })
    } else {
        ObservedValue::Unavailable
    };
    Observation::new(item.id.clone(), timestamp, value)
}

/// Per-source view of the agent: delegates the contract to the agent while
/// scoping asset defaults to the source's device and capturing upstream
/// asset events for the source driver to act on.
pub struct SourceContract {
    agent: Arc<Agent>,
    device: std::sync::Mutex<Option<String>>,
    pending_asset_events: std::sync::Mutex<Vec<AssetEvent>>,
}

impl SourceContract {
    pub fn new(agent: Arc<Agent>, device: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            device: std::sync::Mutex::new(device),
            pending_asset_events: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// The adapter's `* device:` command retargets the source
    pub fn set_device(&self, device: Option<String>) {
        *self.device.lock().unwrap() = device;
    }

    /// Asset notifications accumulated since the last drain
    pub fn take_asset_events(&self) -> Vec<AssetEvent> {
        std::mem::take(&mut self.pending_asset_events.lock().unwrap())
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

impl PipelineContract for SourceContract {
    fn find_device(&self, key: &str) -> Option<Arc<Device>> {
        self.agent.registry.find_device(key).cloned()
    }

    fn find_data_item(&self, device: Option<&str>, key: &str) -> Option<Arc<DataItem>> {
        self.agent.registry.find_data_item(device, key)
    }

    fn each_data_item(&self, f: &mut dyn FnMut(&Arc<DataItem>)) {
        self.agent.registry.each_data_item(|item| f(item));
    }

    fn deliver_observation(&self, observation: Observation) -> SequenceNumber {
        self.agent.buffer.add(observation)
    }

    fn deliver_asset_command(&self, command: AssetCommand) {
        let device = self.device.lock().unwrap().clone();
        self.agent.apply_asset_command(command, device.as_deref());
    }

    fn deliver_asset_event(&self, event: AssetEvent) {
        self.pending_asset_events.lock().unwrap().push(event);
    }

    fn deliver_command(&self, command: ProtocolCommand, source: &str) {
        // Device metadata updates require a writable device model, which an
        // external loader owns; record them for the operator.
        info!(source, key = %command.key, value = %command.value, "adapter command");
    }
}
