//! Shared pipeline state
//!
//! The context joins a pipeline to the rest of the agent (the contract) and
//! carries the shared state arena: typed cells keyed by a small string, each
//! self-synchronized. The context outlives pipeline rebuilds, so filter
//! state and relative-time baselines survive adapter option changes.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use codec::ProtocolCommand;
use types::{AssetCommand, AssetEvent, DataItem, Device, Observation, SequenceNumber};

/// Sinks and lookups the pipeline needs from its owner
pub trait PipelineContract: Send + Sync {
    fn find_device(&self, key: &str) -> Option<Arc<Device>>;

    /// Resolve a data item by id, name, or source, optionally scoped to a
    /// device named in the frame.
    fn find_data_item(&self, device: Option<&str>, key: &str) -> Option<Arc<DataItem>>;

    fn each_data_item(&self, f: &mut dyn FnMut(&Arc<DataItem>));

    /// Deliver one finished observation; returns its assigned sequence.
    fn deliver_observation(&self, observation: Observation) -> SequenceNumber;

    fn deliver_asset_command(&self, command: AssetCommand);

    /// Asset notification from an upstream agent stream
    fn deliver_asset_event(&self, event: AssetEvent);

    /// A protocol command the pipeline does not interpret itself
    fn deliver_command(&self, command: ProtocolCommand, source: &str);
}

/// Shared state across the transforms of one source
pub struct PipelineContext {
    source: String,
    pub contract: Arc<dyn PipelineContract>,
    shared: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PipelineContext {
    pub fn new(source: impl Into<String>, contract: Arc<dyn PipelineContract>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            contract,
            shared: DashMap::new(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fetch the shared cell under `key`, creating it from `Default` on
    /// first use. The cell type provides its own locking.
    pub fn shared_cell<T>(&self, key: &str) -> Arc<T>
    where
        T: Any + Send + Sync + Default,
    {
        let entry = self
            .shared
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(T::default()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(&entry)
            .downcast::<T>()
            .expect("shared cell type is stable per key")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Contract that swallows everything; used by transform unit tests
    pub struct NullContract;

    impl PipelineContract for NullContract {
        fn find_device(&self, _: &str) -> Option<Arc<Device>> {
            None
        }
        fn find_data_item(&self, _: Option<&str>, _: &str) -> Option<Arc<DataItem>> {
            None
        }
        fn each_data_item(&self, _: &mut dyn FnMut(&Arc<DataItem>)) {}
        fn deliver_observation(&self, _: Observation) -> SequenceNumber {
            0
        }
        fn deliver_asset_command(&self, _: AssetCommand) {}
        fn deliver_asset_event(&self, _: AssetEvent) {}
        fn deliver_command(&self, _: ProtocolCommand, _: &str) {}
    }

    #[test]
    fn shared_cells_are_stable_across_fetches() {
        let context = PipelineContext::new("s", Arc::new(NullContract));
        let cell: Arc<Mutex<Vec<u64>>> = context.shared_cell("numbers");
        cell.lock().unwrap().push(7);

        let again: Arc<Mutex<Vec<u64>>> = context.shared_cell("numbers");
        assert_eq!(vec![7], *again.lock().unwrap());
    }
}
