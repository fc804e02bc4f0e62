//! Typed observation values
//!
//! One [`Observation`] is one value for one data item at one instant. The
//! value variants cover every MTConnect representation the ingest pipeline
//! can produce: scalars, fixed-size vectors, data sets, tables, conditions,
//! and waveform time series.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;
use crate::SequenceNumber;

/// A scalar observation value: numeric when it parses as one, text otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Parse a raw token: numbers become `Number`, everything else `Text`.
    pub fn parse(raw: &str) -> Scalar {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Scalar::Number(n),
            _ => Scalar::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// One entry of a data set. `removed` marks a tombstoned key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetEntry {
    pub value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

impl DataSetEntry {
    pub fn value(value: Scalar) -> Self {
        Self { value: Some(value), removed: false }
    }

    pub fn removed() -> Self {
        Self { value: None, removed: true }
    }
}

/// Key-ordered data set; BTreeMap keeps document output deterministic
pub type DataSet = BTreeMap<String, DataSetEntry>;

/// Severity of a condition activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionLevel {
    Normal,
    Warning,
    Fault,
    Unavailable,
}

impl ConditionLevel {
    pub fn parse(token: &str) -> Option<ConditionLevel> {
        match token.to_ascii_uppercase().as_str() {
            "NORMAL" => Some(ConditionLevel::Normal),
            "WARNING" => Some(ConditionLevel::Warning),
            "FAULT" => Some(ConditionLevel::Fault),
            "UNAVAILABLE" => Some(ConditionLevel::Unavailable),
            _ => None,
        }
    }
}

/// One condition activation or clear
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub level: ConditionLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn normal() -> Self {
        Self {
            level: ConditionLevel::Normal,
            native_code: None,
            native_severity: None,
            qualifier: None,
            message: None,
        }
    }

    /// A NORMAL with no native code clears every active condition for the item.
    pub fn is_clear_all(&self) -> bool {
        self.level == ConditionLevel::Normal && self.native_code.is_none()
    }
}

/// The value carried by an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind", content = "value")]
pub enum ObservedValue {
    Unavailable,
    Scalar(Scalar),
    /// Fixed-size 2- or 3-axis coordinate value
    Vector(Vec<f64>),
    TimeSeries {
        values: Vec<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sample_rate: Option<f64>,
    },
    DataSet(DataSet),
    Table(BTreeMap<String, DataSet>),
    Condition(Condition),
}

impl ObservedValue {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ObservedValue::Unavailable)
            || matches!(
                self,
                ObservedValue::Condition(c) if c.level == ConditionLevel::Unavailable
            )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ObservedValue::Scalar(s) => s.as_f64(),
            _ => None,
        }
    }

    /// Canonical equality used by duplicate suppression.
    ///
    /// Scalars compare numerically when both sides are numbers; strings
    /// byte-equal. Data sets compare by their active (non-removed) entries.
    /// Conditions compare by level and native code.
    pub fn canonically_eq(&self, other: &ObservedValue) -> bool {
        use ObservedValue::*;
        match (self, other) {
            (Unavailable, Unavailable) => true,
            (Scalar(a), Scalar(b)) => a == b,
            (Vector(a), Vector(b)) => a == b,
            (DataSet(a), DataSet(b)) => active_entries(a).eq(active_entries(b)),
            (Table(a), Table(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                        ka == kb && active_entries(va).eq(active_entries(vb))
                    })
            }
            (Condition(a), Condition(b)) => {
                a.level == b.level && a.native_code == b.native_code
            }
            (TimeSeries { values: a, .. }, TimeSeries { values: b, .. }) => a == b,
            _ => false,
        }
    }
}

fn active_entries(set: &DataSet) -> impl Iterator<Item = (&String, &DataSetEntry)> {
    set.iter().filter(|(_, e)| !e.removed)
}

/// One value for one data item at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub data_item_id: String,
    /// Assigned by the circular buffer at delivery; 0 until then
    pub sequence: SequenceNumber,
    pub timestamp: Timestamp,
    pub value: ObservedValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_triggered: Option<String>,
}

impl Observation {
    pub fn new(data_item_id: impl Into<String>, timestamp: Timestamp, value: ObservedValue) -> Self {
        Self {
            data_item_id: data_item_id.into(),
            sequence: 0,
            timestamp,
            value,
            duration: None,
            reset_triggered: None,
        }
    }

    pub fn unavailable(data_item_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self::new(data_item_id, timestamp, ObservedValue::Unavailable)
    }

    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_unavailable(&self) -> bool {
        self.value.is_unavailable()
    }
}
