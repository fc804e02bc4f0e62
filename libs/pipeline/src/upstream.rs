//! Upstream agent ingestion
//!
//! Transforms Streams documents fetched from a peer agent into local
//! observations, tracking the peer's `nextSequence` cursor and its
//! `instanceId`. An instance change means the peer restarted and its
//! sequence space reset; the transform fails the document so the source
//! refetches Current to re-seed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use codec::response::{ResponseDocument, UpstreamSample};
use types::{Observation, ObservedValue};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::shdr::{data_set_value, scalar_value};
use crate::{Entity, Result, Transform};

/// Cursor and identity of the upstream peer, shared with the source driver
#[derive(Debug, Default)]
pub struct UpstreamState {
    inner: Mutex<UpstreamStateInner>,
}

#[derive(Debug, Default)]
struct UpstreamStateInner {
    instance_id: Option<u64>,
    next: Option<u64>,
}

impl UpstreamState {
    pub fn cell(context: &PipelineContext) -> Arc<UpstreamState> {
        context.shared_cell("upstream_state")
    }

    /// The `from` cursor for the next sample fetch
    pub fn next(&self) -> Option<u64> {
        self.inner.lock().unwrap().next
    }

    pub fn instance_id(&self) -> Option<u64> {
        self.inner.lock().unwrap().instance_id
    }

    /// Forget the cursor after an instance change; the caller refetches
    /// Current to re-seed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.instance_id = None;
        inner.next = None;
    }

    fn record(&self, instance_id: u64, next: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.instance_id {
            if previous != instance_id {
                return Err(PipelineError::InstanceChanged {
                    previous,
                    current: instance_id,
                });
            }
        }
        inner.instance_id = Some(instance_id);
        if next.is_some() {
            inner.next = next;
        }
        Ok(())
    }
}

/// Parses a peer agent's XML documents into observations and asset events
pub struct MTConnectXmlTransform;

impl Transform for MTConnectXmlTransform {
    fn name(&self) -> &'static str {
        "MTConnectXmlTransform"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Raw { .. })
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Raw { line } = entity else {
            return Ok(vec![]);
        };

        let document = ResponseDocument::parse(&line)?;
        let state = UpstreamState::cell(context);

        match document {
            ResponseDocument::Errors { header, errors } => {
                // Instance bookkeeping still applies: an error document from
                // a restarted peer must not keep the stale cursor.
                state.record(header.instance_id, None)?;
                Err(PipelineError::UpstreamErrors(errors))
            }
            ResponseDocument::Assets { header, assets } => {
                state.record(header.instance_id, None)?;
                Ok(vec![Entity::AssetCommands(
                    assets
                        .into_iter()
                        .map(types::AssetCommand::Upsert)
                        .collect(),
                )])
            }
            ResponseDocument::Streams { header, samples, asset_events } => {
                state.record(header.instance_id, header.next_sequence)?;

                let mut observations = Vec::with_capacity(samples.len());
                for sample in samples {
                    if let Some(obs) = self.map_sample(context, sample) {
                        observations.push(obs);
                    }
                }

                let mut out = Vec::new();
                if !observations.is_empty() {
                    out.push(Entity::Observations(observations));
                }
                if !asset_events.is_empty() {
                    out.push(Entity::AssetEvents(asset_events));
                }
                Ok(out)
            }
        }
    }
}

impl MTConnectXmlTransform {
    fn map_sample(
        &self,
        context: &PipelineContext,
        sample: UpstreamSample,
    ) -> Option<Observation> {
        let item = context
            .contract
            .find_data_item(sample.device_uuid.as_deref(), &sample.data_item_id)
            .or_else(|| context.contract.find_data_item(None, &sample.data_item_id));
        let Some(item) = item else {
            let seen: Arc<Mutex<HashSet<String>>> = context.shared_cell("unknown_data_items");
            if seen.lock().unwrap().insert(sample.data_item_id.clone()) {
                warn!(
                    source = context.source(),
                    data_item = %sample.data_item_id,
                    "upstream observation for unknown data item"
                );
            }
            return None;
        };

        let mut obs = Observation::new(item.id.clone(), sample.timestamp, ObservedValue::Unavailable)
            .with_duration(sample.duration);
        obs.reset_triggered = sample.reset_triggered;

        obs.value = if let Some(condition) = sample.condition {
            ObservedValue::Condition(condition)
        } else if item.is_time_series() {
            let values: Option<Vec<f64>> = sample
                .value
                .split_whitespace()
                .map(|v| v.parse().ok())
                .collect();
            match values {
                Some(values) if !values.is_empty() => ObservedValue::TimeSeries {
                    values,
                    sample_rate: sample.sample_rate.or(item.sample_rate),
                },
                _ => ObservedValue::Unavailable,
            }
        } else if item.is_data_set() {
            data_set_value(&item, &sample.value).ok()?
        } else {
            scalar_value(&item, &sample.value, false)
        };

        Some(obs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContract;
    use types::{
        AssetCommand, AssetEvent, DataItem, Device, SequenceNumber,
    };

    struct RecordingContract {
        items: Vec<Arc<DataItem>>,
        delivered: Mutex<Vec<Observation>>,
        events: Mutex<Vec<AssetEvent>>,
    }

    impl PipelineContract for RecordingContract {
        fn find_device(&self, _: &str) -> Option<Arc<Device>> {
            None
        }
        fn find_data_item(&self, _: Option<&str>, key: &str) -> Option<Arc<DataItem>> {
            self.items.iter().find(|di| di.id == key).cloned()
        }
        fn each_data_item(&self, f: &mut dyn FnMut(&Arc<DataItem>)) {
            for item in &self.items {
                f(item);
            }
        }
        fn deliver_observation(&self, obs: Observation) -> SequenceNumber {
            self.delivered.lock().unwrap().push(obs);
            0
        }
        fn deliver_asset_command(&self, _: AssetCommand) {}
        fn deliver_asset_event(&self, event: AssetEvent) {
            self.events.lock().unwrap().push(event);
        }
        fn deliver_command(&self, _: codec::ProtocolCommand, _: &str) {}
    }

    fn context() -> Arc<PipelineContext> {
        PipelineContext::new(
            "upstream",
            Arc::new(RecordingContract {
                items: vec![
                    Arc::new(DataItem::event("exec", "EXECUTION")),
                    Arc::new(DataItem::event("prog", "PROGRAM")),
                    Arc::new(DataItem::event("mode", "CONTROLLER_MODE")),
                ],
                delivered: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            }),
        )
    }

    fn streams(instance: u64, next: u64, events: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<MTConnectStreams xmlns="urn:mtconnect.org:MTConnectStreams:1.7">
  <Header creationTime="2022-04-21T05:54:56Z" instanceId="{instance}" nextSequence="{next}"/>
  <Streams>
    <DeviceStream name="M" uuid="u-1">
      <ComponentStream component="Path" componentId="p1">
        <Events>{events}</Events>
      </ComponentStream>
    </DeviceStream>
  </Streams>
</MTConnectStreams>"#
        )
    }

    #[test]
    fn tracks_next_and_maps_events_in_order() {
        let context = context();
        let transform = MTConnectXmlTransform;

        let body = streams(
            1_649_989_201,
            4_992_049,
            r#"<Execution dataItemId="exec" timestamp="2022-04-21T05:54:56Z">ACTIVE</Execution>
               <Program dataItemId="prog" timestamp="2022-04-21T05:54:56Z">O123</Program>
               <ControllerMode dataItemId="mode" timestamp="2022-04-21T05:54:56Z">AUTOMATIC</ControllerMode>"#,
        );
        let out = transform
            .apply(Entity::Raw { line: body }, &context)
            .unwrap();

        let state = UpstreamState::cell(&context);
        assert_eq!(Some(1_649_989_201), state.instance_id());
        assert_eq!(Some(4_992_049), state.next());

        match &out[0] {
            Entity::Observations(obs) => {
                assert_eq!(
                    vec!["exec", "prog", "mode"],
                    obs.iter().map(|o| o.data_item_id.as_str()).collect::<Vec<_>>()
                );
            }
            other => panic!("expected observations, got {other:?}"),
        }
    }

    #[test]
    fn instance_change_fails_and_keeps_previous_state() {
        let context = context();
        let transform = MTConnectXmlTransform;

        transform
            .apply(Entity::Raw { line: streams(1_649_989_201, 4_992_049, "") }, &context)
            .unwrap();

        let err = transform
            .apply(Entity::Raw { line: streams(1_649_989_202, 12, "") }, &context)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InstanceChanged { previous: 1_649_989_201, current: 1_649_989_202 }));
        assert!(err.requires_reseed());

        let state = UpstreamState::cell(&context);
        assert_eq!(Some(1_649_989_201), state.instance_id());
        assert_eq!(Some(4_992_049), state.next());
    }

    #[test]
    fn after_reset_the_new_instance_is_adopted() {
        let context = context();
        let transform = MTConnectXmlTransform;

        transform
            .apply(Entity::Raw { line: streams(1, 100, "") }, &context)
            .unwrap();
        let state = UpstreamState::cell(&context);
        state.reset();

        transform
            .apply(Entity::Raw { line: streams(2, 5, "") }, &context)
            .unwrap();
        assert_eq!(Some(2), state.instance_id());
        assert_eq!(Some(5), state.next());
    }

    #[test]
    fn error_documents_surface_their_errors() {
        let context = context();
        let transform = MTConnectXmlTransform;

        let body = r#"<?xml version="1.0"?>
<MTConnectError xmlns="urn:mtconnect.org:MTConnectError:1.7">
  <Header instanceId="9"/>
  <Errors><Error errorCode="OUT_OF_RANGE">'from' too old</Error></Errors>
</MTConnectError>"#;
        let err = transform
            .apply(Entity::Raw { line: body.to_string() }, &context)
            .unwrap_err();
        match &err {
            PipelineError::UpstreamErrors(errors) => {
                assert_eq!("OUT_OF_RANGE", errors[0].code);
            }
            other => panic!("expected upstream errors, got {other:?}"),
        }
        assert!(err.requires_reseed());
    }
}
