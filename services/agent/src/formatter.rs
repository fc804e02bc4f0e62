//! Document formatting seam
//!
//! The core hands formatters the in-memory model; everything about the
//! output representation lives behind [`Formatter`]. The JSON
//! implementation ships here; an XML printer plugs into the same trait.

use std::sync::Arc;

use serde_json::{json, Value};

use types::{format_timestamp, Asset, Device, Observation};

/// Header fields common to every served document
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub sender: String,
    pub instance_id: u64,
    pub buffer_size: usize,
    pub first_sequence: u64,
    pub next_sequence: u64,
    /// Highest sequence currently in the buffer
    pub last_sequence: u64,
    pub asset_buffer_size: usize,
    pub asset_count: usize,
}

/// Renders in-memory state into response documents
pub trait Formatter: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn format_probe(&self, meta: &DocumentMeta, devices: &[Arc<Device>]) -> String;

    /// Current and Sample share the streams document shape
    fn format_streams(&self, meta: &DocumentMeta, observations: &[Arc<Observation>]) -> String;

    fn format_assets(&self, meta: &DocumentMeta, assets: &[Arc<Asset>]) -> String;

    fn format_error(&self, meta: &DocumentMeta, code: &str, message: &str) -> String;
}

/// JSON rendition of the MTConnect response documents
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl JsonFormatter {
    fn header(&self, meta: &DocumentMeta) -> Value {
        json!({
            "sender": meta.sender,
            "instanceId": meta.instance_id,
            "bufferSize": meta.buffer_size,
            "firstSequence": meta.first_sequence,
            "nextSequence": meta.next_sequence,
            "lastSequence": meta.last_sequence,
            "assetBufferSize": meta.asset_buffer_size,
            "assetCount": meta.asset_count,
            "creationTime": format_timestamp(&chrono::Utc::now()),
        })
    }

    fn observation(obs: &Observation) -> Value {
        let mut entry = json!({
            "dataItemId": obs.data_item_id,
            "sequence": obs.sequence,
            "timestamp": format_timestamp(&obs.timestamp),
            "value": obs.value,
        });
        if let Some(duration) = obs.duration {
            entry["duration"] = json!(duration);
        }
        if let Some(reset) = &obs.reset_triggered {
            entry["resetTriggered"] = json!(reset);
        }
        entry
    }
}

impl Formatter for JsonFormatter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn format_probe(&self, meta: &DocumentMeta, devices: &[Arc<Device>]) -> String {
        json!({
            "MTConnectDevices": {
                "Header": self.header(meta),
                "Devices": devices.iter().map(|d| json!({
                    "id": d.id,
                    "uuid": d.uuid,
                    "name": d.name,
                    "dataItems": d.data_items,
                })).collect::<Vec<_>>(),
            }
        })
        .to_string()
    }

    fn format_streams(&self, meta: &DocumentMeta, observations: &[Arc<Observation>]) -> String {
        json!({
            "MTConnectStreams": {
                "Header": self.header(meta),
                "Streams": observations
                    .iter()
                    .map(|o| Self::observation(o))
                    .collect::<Vec<_>>(),
            }
        })
        .to_string()
    }

    fn format_assets(&self, meta: &DocumentMeta, assets: &[Arc<Asset>]) -> String {
        json!({
            "MTConnectAssets": {
                "Header": self.header(meta),
                "Assets": assets.iter().map(|a| json!({
                    "assetId": a.asset_id,
                    "assetType": a.asset_type,
                    "deviceUuid": a.device_uuid,
                    "timestamp": format_timestamp(&a.timestamp),
                    "removed": a.removed,
                    "body": a.body,
                })).collect::<Vec<_>>(),
            }
        })
        .to_string()
    }

    fn format_error(&self, meta: &DocumentMeta, code: &str, message: &str) -> String {
        json!({
            "MTConnectError": {
                "Header": self.header(meta),
                "Errors": [{"errorCode": code, "error": message}],
            }
        })
        .to_string()
    }
}
