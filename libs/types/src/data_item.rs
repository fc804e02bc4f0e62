//! Data-item metadata consumed from the device model
//!
//! The device model loader supplies these read-only records; the ingest
//! pipeline uses them to interpret value syntax, select filters, and decide
//! unit conversion.

use serde::{Deserialize, Serialize};

/// MTConnect data-item category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Sample,
    Event,
    Condition,
}

/// How the item's value is represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Representation {
    #[default]
    Value,
    TimeSeries,
    DataSet,
    Table,
    Discrete,
}

/// Filter kind attached to a data item by the device model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterKind {
    MinimumDelta,
    Period,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItemFilter {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    pub value: f64,
}

/// Immutable metadata for one recognized datum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source channel name when it differs from `name` (e.g. SHDR key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub representation: Representation,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<DataItemFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl DataItem {
    /// Minimal constructor used widely in tests and synthetic items
    pub fn event(id: impl Into<String>, type_: impl Into<String>) -> Self {
        Self::with_category(id, type_, Category::Event)
    }

    pub fn sample(id: impl Into<String>, type_: impl Into<String>) -> Self {
        Self::with_category(id, type_, Category::Sample)
    }

    pub fn condition(id: impl Into<String>, type_: impl Into<String>) -> Self {
        Self::with_category(id, type_, Category::Condition)
    }

    fn with_category(id: impl Into<String>, type_: impl Into<String>, category: Category) -> Self {
        Self {
            id: id.into(),
            name: None,
            source: None,
            category,
            representation: Representation::Value,
            type_: type_.into(),
            sub_type: None,
            units: None,
            native_units: None,
            native_scale: None,
            sample_rate: None,
            filters: Vec::new(),
            default_value: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_native_units(mut self, native: impl Into<String>) -> Self {
        self.native_units = Some(native.into());
        self
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = representation;
        self
    }

    pub fn with_filter(mut self, kind: FilterKind, value: f64) -> Self {
        self.filters.push(DataItemFilter { kind, value });
        self
    }

    pub fn is_sample(&self) -> bool {
        self.category == Category::Sample
    }

    pub fn is_condition(&self) -> bool {
        self.category == Category::Condition
    }

    /// MESSAGE events carry `native_code|text` on the wire
    pub fn is_message(&self) -> bool {
        self.category == Category::Event && self.type_.eq_ignore_ascii_case("MESSAGE")
    }

    pub fn is_time_series(&self) -> bool {
        self.representation == Representation::TimeSeries
    }

    pub fn is_data_set(&self) -> bool {
        matches!(self.representation, Representation::DataSet | Representation::Table)
    }

    pub fn is_discrete(&self) -> bool {
        self.representation == Representation::Discrete
    }

    fn filter_value(&self, kind: FilterKind) -> Option<f64> {
        self.filters.iter().find(|f| f.kind == kind).map(|f| f.value)
    }

    pub fn minimum_delta(&self) -> Option<f64> {
        self.filter_value(FilterKind::MinimumDelta)
    }

    /// Period filter value in seconds
    pub fn period(&self) -> Option<f64> {
        self.filter_value(FilterKind::Period)
    }

    /// True when native units differ from reporting units or a native scale
    /// is declared, so the unit converter has work to do.
    pub fn conversion_required(&self) -> bool {
        self.native_scale.is_some()
            || match (&self.native_units, &self.units) {
                (Some(native), Some(units)) => native != units,
                (Some(_), None) => true,
                _ => false,
            }
    }
}
