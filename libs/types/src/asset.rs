//! Asset model and asset-directed commands

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// A long-lived artifact referenced by machines (cutting tool, fixture, …).
///
/// Identity is `asset_id`; a later asset with the same id replaces the
/// earlier one. The body is kept structured but opaque: the agent stores
/// and republishes it without interpreting its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub asset_id: String,
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub removed: bool,
    pub body: serde_json::Value,
}

impl Asset {
    pub fn new(
        asset_id: impl Into<String>,
        asset_type: impl Into<String>,
        timestamp: Timestamp,
        body: serde_json::Value,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_type: asset_type.into(),
            device_uuid: None,
            timestamp,
            removed: false,
            body,
        }
    }

    pub fn for_device(mut self, device_uuid: impl Into<String>) -> Self {
        self.device_uuid = Some(device_uuid.into());
        self
    }
}

/// Asset-directed action produced by the ingest pipeline
/// (`@ASSET@`, `@REMOVE_ASSET@`, `@REMOVE_ALL_ASSETS@`, REST PUT/DELETE)
#[derive(Debug, Clone, PartialEq)]
pub enum AssetCommand {
    Upsert(Asset),
    Remove {
        asset_id: String,
        timestamp: Timestamp,
    },
    RemoveAll {
        asset_type: Option<String>,
        device_uuid: Option<String>,
        timestamp: Timestamp,
    },
}

/// Kind of asset notification observed in an upstream agent's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetEventKind {
    Changed,
    Removed,
}

/// AssetChanged/AssetRemoved notification from an upstream agent; the
/// consumer decides whether to refetch the asset body.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEvent {
    pub kind: AssetEventKind,
    pub asset_id: String,
    pub device_uuid: Option<String>,
    pub timestamp: Timestamp,
}
