//! Upstream MTConnect response documents
//!
//! Parses the Streams, Assets, and Errors documents served by a peer agent
//! into flat entity lists the upstream transform can resolve against the
//! local device model. Only the pieces the ingest path needs are read;
//! anything else in the document is skipped.

use chrono::Utc;
use roxmltree::{Document, Node};
use tracing::debug;

use types::{
    Asset, AssetEvent, AssetEventKind, Condition, ConditionLevel, Timestamp,
};

use crate::error::ParseError;
use crate::timestamp::parse_instant;
use crate::Result;

/// Header fields common to every MTConnect document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHeader {
    pub instance_id: u64,
    pub next_sequence: Option<u64>,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub sender: Option<String>,
}

/// One observation element lifted out of a Streams document
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSample {
    pub data_item_id: String,
    /// Element tag, e.g. `Position` or `Execution`; the condition level tag
    /// for condition entries
    pub element: String,
    pub device_uuid: Option<String>,
    pub timestamp: Timestamp,
    pub sequence: Option<u64>,
    pub value: String,
    pub condition: Option<Condition>,
    pub sample_rate: Option<f64>,
    pub duration: Option<f64>,
    pub reset_triggered: Option<String>,
}

/// Error entry from an MTConnectError document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentError {
    pub code: String,
    pub message: String,
}

/// A parsed upstream document
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseDocument {
    Streams {
        header: DocumentHeader,
        samples: Vec<UpstreamSample>,
        asset_events: Vec<AssetEvent>,
    },
    Assets {
        header: DocumentHeader,
        assets: Vec<Asset>,
    },
    Errors {
        header: DocumentHeader,
        errors: Vec<DocumentError>,
    },
}

impl ResponseDocument {
    pub fn header(&self) -> &DocumentHeader {
        match self {
            ResponseDocument::Streams { header, .. }
            | ResponseDocument::Assets { header, .. }
            | ResponseDocument::Errors { header, .. } => header,
        }
    }

    /// Parse one document, dispatching on the root element.
    pub fn parse(data: &str) -> Result<ResponseDocument> {
        let doc = Document::parse(data)?;
        let root = doc.root_element();
        let header = parse_header(&root)?;

        match root.tag_name().name() {
            "MTConnectStreams" => {
                let mut samples = Vec::new();
                let mut asset_events = Vec::new();
                if let Some(streams) = child(&root, "Streams") {
                    for device in named_children(&streams, "DeviceStream") {
                        let uuid = device.attribute("uuid").map(str::to_string);
                        for component in named_children(&device, "ComponentStream") {
                            collect_observations(
                                &component,
                                uuid.as_deref(),
                                &mut samples,
                                &mut asset_events,
                            );
                        }
                    }
                }
                Ok(ResponseDocument::Streams { header, samples, asset_events })
            }
            "MTConnectAssets" => {
                let mut assets = Vec::new();
                if let Some(container) = child(&root, "Assets") {
                    for node in container.children().filter(Node::is_element) {
                        assets.push(parse_asset(&node)?);
                    }
                }
                Ok(ResponseDocument::Assets { header, assets })
            }
            "MTConnectError" => {
                let mut errors = Vec::new();
                if let Some(container) = child(&root, "Errors") {
                    for node in named_children(&container, "Error") {
                        errors.push(parse_error(&node));
                    }
                } else if let Some(node) = child(&root, "Error") {
                    errors.push(parse_error(&node));
                }
                Ok(ResponseDocument::Errors { header, errors })
            }
            other => Err(ParseError::UnexpectedRoot { root: other.to_string() }),
        }
    }
}

fn parse_header(root: &Node) -> Result<DocumentHeader> {
    let header = child(root, "Header").ok_or_else(|| ParseError::MissingAttribute {
        element: root.tag_name().name().to_string(),
        attribute: "Header".to_string(),
    })?;

    let instance_id = required_u64(&header, "instanceId")?;
    Ok(DocumentHeader {
        instance_id,
        next_sequence: attr_u64(&header, "nextSequence"),
        first_sequence: attr_u64(&header, "firstSequence"),
        last_sequence: attr_u64(&header, "lastSequence"),
        sender: header.attribute("sender").map(str::to_string),
    })
}

fn collect_observations(
    component: &Node,
    device_uuid: Option<&str>,
    samples: &mut Vec<UpstreamSample>,
    asset_events: &mut Vec<AssetEvent>,
) {
    for category in component.children().filter(Node::is_element) {
        let is_condition = category.tag_name().name() == "Condition";
        for node in category.children().filter(Node::is_element) {
            let tag = node.tag_name().name();
            let timestamp = node
                .attribute("timestamp")
                .and_then(parse_instant)
                .unwrap_or_else(Utc::now);
            // Data-set entries arrive as Entry children; re-encode them in
            // the `k=v` form the set parser understands
            let entries: Vec<String> = named_children(&node, "Entry")
                .map(|entry| {
                    let key = entry.attribute("key").unwrap_or("");
                    if entry.attribute("removed") == Some("true") {
                        key.to_string()
                    } else {
                        format!("{}={}", key, entry.text().unwrap_or("").trim())
                    }
                })
                .collect();
            let value = if entries.is_empty() {
                node.text().unwrap_or("").trim().to_string()
            } else {
                entries.join(" ")
            };

            if tag == "AssetChanged" || tag == "AssetRemoved" {
                if value.is_empty() || value.eq_ignore_ascii_case("UNAVAILABLE") {
                    continue;
                }
                asset_events.push(AssetEvent {
                    kind: if tag == "AssetChanged" {
                        AssetEventKind::Changed
                    } else {
                        AssetEventKind::Removed
                    },
                    asset_id: value,
                    device_uuid: device_uuid.map(str::to_string),
                    timestamp,
                });
                continue;
            }

            let data_item_id = match node.attribute("dataItemId") {
                Some(id) => id.to_string(),
                None => {
                    debug!(element = tag, "skipping observation without dataItemId");
                    continue;
                }
            };

            let condition = if is_condition {
                Some(Condition {
                    level: ConditionLevel::parse(tag).unwrap_or(ConditionLevel::Unavailable),
                    native_code: node.attribute("nativeCode").map(str::to_string),
                    native_severity: node.attribute("nativeSeverity").map(str::to_string),
                    qualifier: node.attribute("qualifier").map(str::to_string),
                    message: if value.is_empty() { None } else { Some(value.clone()) },
                })
            } else {
                None
            };

            samples.push(UpstreamSample {
                data_item_id,
                element: tag.to_string(),
                device_uuid: device_uuid.map(str::to_string),
                timestamp,
                sequence: attr_u64(&node, "sequence"),
                value,
                condition,
                sample_rate: node
                    .attribute("sampleRate")
                    .and_then(|v| v.parse().ok()),
                duration: node.attribute("duration").and_then(|v| v.parse().ok()),
                reset_triggered: node.attribute("resetTriggered").map(str::to_string),
            });
        }
    }
}

fn parse_asset(node: &Node) -> Result<Asset> {
    let asset_id = node
        .attribute("assetId")
        .ok_or_else(|| ParseError::MissingAttribute {
            element: node.tag_name().name().to_string(),
            attribute: "assetId".to_string(),
        })?;
    let timestamp = node
        .attribute("timestamp")
        .and_then(parse_instant)
        .unwrap_or_else(Utc::now);

    let mut asset = Asset::new(
        asset_id,
        node.tag_name().name(),
        timestamp,
        serde_json::Value::String(node.text().unwrap_or("").trim().to_string()),
    );
    if let Some(uuid) = node.attribute("deviceUuid") {
        asset = asset.for_device(uuid);
    }
    asset.removed = node.attribute("removed") == Some("true");
    Ok(asset)
}

fn parse_error(node: &Node) -> DocumentError {
    DocumentError {
        code: node.attribute("errorCode").unwrap_or("UNKNOWN").to_string(),
        message: node.text().unwrap_or("").trim().to_string(),
    }
}

fn child<'a, 'input>(node: &Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn named_children<'a, 'input>(
    node: &Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn attr_u64(node: &Node, name: &str) -> Option<u64> {
    node.attribute(name).and_then(|v| v.parse().ok())
}

fn required_u64(node: &Node, name: &str) -> Result<u64> {
    let raw = node
        .attribute(name)
        .ok_or_else(|| ParseError::MissingAttribute {
            element: node.tag_name().name().to_string(),
            attribute: name.to_string(),
        })?;
    raw.parse().map_err(|_| ParseError::InvalidNumeric {
        value: raw.to_string(),
    })
}
