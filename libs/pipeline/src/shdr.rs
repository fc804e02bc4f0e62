//! SHDR transforms
//!
//! The adapter-facing front of the pipeline: tokenize the raw line, resolve
//! its timestamp, then fold the remaining tokens into observations and
//! asset commands against the data-item registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use codec::{ShdrTokenizer, TimestampExtractor, Timestamped, Tokens};
use types::{
    Asset, AssetCommand, Condition, ConditionLevel, DataItem, DataSet, DataSetEntry,
    Observation, ObservedValue, Scalar, Timestamp,
};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::{Entity, Result, Transform};

const ASSET_TOKEN: &str = "@ASSET@";
const REMOVE_ASSET_TOKEN: &str = "@REMOVE_ASSET@";
const REMOVE_ALL_ASSETS_TOKEN: &str = "@REMOVE_ALL_ASSETS@";

const RESET_TRIGGERS: &[&str] = &[
    "ACTION_COMPLETE",
    "ANNUAL",
    "DAY",
    "HOUR",
    "MAINTENANCE",
    "MANUAL",
    "MONTH",
    "POWER_ON",
    "SHIFT",
    "WEEK",
];

/// Options the token mapper honors; derived from adapter configuration and
/// runtime protocol commands.
#[derive(Debug, Clone, Default)]
pub struct MapperOptions {
    /// Device the source is bound to, scoping bare data-item keys
    pub device: Option<String>,
    /// Uppercase event values (UpcaseDataItemValue)
    pub upcase_values: bool,
}

/// Splits raw lines into tokens, handling multiline capture. The capture
/// state lives in the context so it survives pipeline rebuilds.
pub struct TokenizerTransform;

impl Transform for TokenizerTransform {
    fn name(&self) -> &'static str {
        "ShdrTokenizer"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Raw { .. })
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Raw { line } = entity else {
            return Ok(vec![]);
        };
        let tokenizer: Arc<Mutex<ShdrTokenizer>> = context.shared_cell("shdr_tokenizer");
        let mut tokenizer = tokenizer.lock().unwrap();
        Ok(match tokenizer.feed_line(&line) {
            Some(tokens) => vec![Entity::Tokens(tokens)],
            None => vec![],
        })
    }
}

/// Consumes the leading timestamp token
pub struct TimestampTransform {
    now: fn() -> Timestamp,
    real_time: bool,
}

impl TimestampTransform {
    pub fn new() -> Self {
        Self { now: Utc::now, real_time: false }
    }

    /// In real-time mode the agent clock overrides adapter timestamps.
    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    /// Shared extractor cell so relative-time baselines survive rebuilds
    pub fn extractor(context: &PipelineContext) -> Arc<Mutex<TimestampExtractor>> {
        context.shared_cell("timestamp_extractor")
    }
}

impl Default for TimestampTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for TimestampTransform {
    fn name(&self) -> &'static str {
        "ExtractTimestamp"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Tokens(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Tokens(Tokens { mut values }) = entity else {
            return Ok(vec![]);
        };
        if values.is_empty() {
            return Ok(vec![]);
        }
        let first = values.remove(0);
        let now = (self.now)();
        let extractor = Self::extractor(context);
        let (timestamp, duration) = extractor.lock().unwrap().extract(&first, now)?;
        Ok(vec![Entity::Timestamped(Timestamped {
            timestamp: if self.real_time { now } else { timestamp },
            duration,
            tokens: values,
        })])
    }
}

/// Folds timestamped tokens into observations and asset commands
pub struct ShdrTokenMapper {
    options: MapperOptions,
}

impl ShdrTokenMapper {
    pub fn new(options: MapperOptions) -> Self {
        Self { options }
    }

    fn resolve(
        &self,
        context: &PipelineContext,
        device: Option<&str>,
        key: &str,
    ) -> Option<Arc<DataItem>> {
        let scope = device.or(self.options.device.as_deref());
        context
            .contract
            .find_data_item(scope, key)
            .or_else(|| context.contract.find_data_item(None, key))
    }

    fn map_tokens(
        &self,
        timestamp: Timestamp,
        duration: Option<f64>,
        tokens: &[String],
        context: &PipelineContext,
    ) -> Result<Vec<Observation>> {
        let mut observations = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let key = tokens[i].as_str();
            i += 1;
            if key.is_empty() {
                continue;
            }

            let (device, name, reset_triggered) = split_key(key);
            let Some(item) = self.resolve(context, device, name) else {
                self.warn_unknown(context, name);
                i += 1; // value token of the unrecognized item
                continue;
            };

            let mut obs = Observation::new(item.id.clone(), timestamp, ObservedValue::Unavailable)
                .with_duration(duration);
            obs.reset_triggered = reset_triggered.map(str::to_string);

            if item.is_condition() {
                // LEVEL|CODE|SEVERITY|QUALIFIER|MESSAGE; short frames leave
                // trailing fields empty
                let fields: Vec<&str> = (0..5)
                    .map(|n| tokens.get(i + n).map_or("", |t| t.as_str()))
                    .collect();
                i += (tokens.len() - i).min(5);
                obs.value = condition_value(&fields)?;
            } else if item.is_message() {
                // native code token is positional; the text is the payload
                let text = tokens.get(i + 1).cloned().unwrap_or_default();
                debug!(code = %tokens.get(i).map_or("", |t| t.as_str()), "message native code");
                i += 2;
                obs.value = ObservedValue::Scalar(Scalar::Text(text));
            } else if item.is_time_series() {
                let count = tokens.get(i).map_or("", |t| t.as_str());
                let rate = tokens.get(i + 1).map_or("", |t| t.as_str());
                let values = tokens.get(i + 2).map_or("", |t| t.as_str());
                i += 3;
                obs.value = time_series_value(&item, count, rate, values)?;
            } else if item.is_data_set() {
                let payload = tokens.get(i).map_or("", |t| t.as_str());
                i += 1;
                obs.value = data_set_value(&item, payload)?;
            } else {
                let raw = tokens.get(i).map_or("", |t| t.as_str());
                i += 1;
                obs.value = scalar_value(&item, raw, self.options.upcase_values);
            }

            observations.push(obs);
        }

        Ok(observations)
    }

    fn warn_unknown(&self, context: &PipelineContext, name: &str) {
        let seen: Arc<Mutex<HashSet<String>>> = context.shared_cell("unknown_data_items");
        let mut seen = seen.lock().unwrap();
        if seen.insert(name.to_string()) {
            warn!(source = context.source(), data_item = name, "unknown data item, dropping");
        }
    }

    fn asset_command(
        &self,
        timestamp: Timestamp,
        tokens: &[String],
    ) -> Option<AssetCommand> {
        let token = |n: usize| tokens.get(n).map(|t| t.trim()).filter(|t| !t.is_empty());
        match tokens[0].as_str() {
            ASSET_TOKEN => {
                let id = token(1)?;
                let asset_type = token(2)?;
                let raw_body = tokens.get(3).cloned().unwrap_or_default();
                let body = serde_json::from_str(&raw_body)
                    .unwrap_or(serde_json::Value::String(raw_body));
                Some(AssetCommand::Upsert(Asset::new(id, asset_type, timestamp, body)))
            }
            REMOVE_ASSET_TOKEN => Some(AssetCommand::Remove {
                asset_id: token(1)?.to_string(),
                timestamp,
            }),
            REMOVE_ALL_ASSETS_TOKEN => Some(AssetCommand::RemoveAll {
                asset_type: token(1).map(str::to_string),
                device_uuid: None,
                timestamp,
            }),
            _ => None,
        }
    }
}

impl Transform for ShdrTokenMapper {
    fn name(&self) -> &'static str {
        "ShdrTokenMapper"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Timestamped(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Timestamped(Timestamped { timestamp, duration, tokens }) = entity else {
            return Ok(vec![]);
        };
        if tokens.is_empty() {
            return Ok(vec![]);
        }

        if tokens[0].starts_with('@') {
            return Ok(match self.asset_command(timestamp, &tokens) {
                Some(command) => vec![Entity::AssetCommands(vec![command])],
                None => {
                    warn!(token = %tokens[0], "unrecognized asset directive");
                    vec![]
                }
            });
        }

        let observations = self.map_tokens(timestamp, duration, &tokens, context)?;
        Ok(if observations.is_empty() {
            vec![]
        } else {
            vec![Entity::Observations(observations)]
        })
    }
}

/// Split a data-item key into (device scope, name, reset trigger).
///
/// `dev:item` scopes the lookup; `item:DAY` carries a reset trigger. The
/// suffix is a trigger only when it matches the known trigger set.
fn split_key(key: &str) -> (Option<&str>, &str, Option<&str>) {
    match key.split_once(':') {
        Some((prefix, suffix)) => {
            if RESET_TRIGGERS.contains(&suffix) {
                (None, prefix, Some(suffix))
            } else {
                (Some(prefix), suffix, None)
            }
        }
        None => (None, key, None),
    }
}

fn condition_value(fields: &[&str]) -> Result<ObservedValue> {
    let level = fields[0];
    let Some(level) = ConditionLevel::parse(level) else {
        return Err(PipelineError::InvalidConditionLevel {
            level: level.to_string(),
        });
    };
    let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
    Ok(ObservedValue::Condition(Condition {
        level,
        native_code: opt(fields[1]),
        native_severity: opt(fields[2]),
        qualifier: opt(fields[3]),
        message: opt(fields[4]),
    }))
}

pub(crate) fn scalar_value(item: &DataItem, raw: &str, upcase: bool) -> ObservedValue {
    if raw.eq_ignore_ascii_case("UNAVAILABLE") || raw.is_empty() {
        return ObservedValue::Unavailable;
    }

    if item.is_sample() {
        // Multi-axis samples arrive space-separated
        if raw.contains(' ') {
            let axes: Option<Vec<f64>> =
                raw.split_whitespace().map(|p| p.parse().ok()).collect();
            if let Some(axes) = axes {
                return ObservedValue::Vector(axes);
            }
        }
        return ObservedValue::Scalar(Scalar::parse(raw));
    }

    match Scalar::parse(raw) {
        Scalar::Text(text) if upcase => {
            ObservedValue::Scalar(Scalar::Text(text.to_uppercase()))
        }
        scalar => ObservedValue::Scalar(scalar),
    }
}

fn time_series_value(
    item: &DataItem,
    count: &str,
    rate: &str,
    values: &str,
) -> Result<ObservedValue> {
    if values.eq_ignore_ascii_case("UNAVAILABLE") || count.eq_ignore_ascii_case("UNAVAILABLE") {
        return Ok(ObservedValue::Unavailable);
    }
    let expected: usize = count.parse().map_err(|_| {
        PipelineError::Parse(codec::ParseError::InvalidNumeric { value: count.to_string() })
    })?;
    let sample_rate = if rate.is_empty() {
        item.sample_rate
    } else {
        rate.parse().ok()
    };
    let parsed: std::result::Result<Vec<f64>, _> =
        values.split_whitespace().map(str::parse).collect();
    let parsed = parsed.map_err(|_| {
        PipelineError::Parse(codec::ParseError::InvalidNumeric { value: values.to_string() })
    })?;
    if parsed.len() != expected {
        return Err(PipelineError::Parse(codec::ParseError::TruncatedFrame {
            data_item: item.id.clone(),
            expected: expected.saturating_sub(parsed.len()),
        }));
    }
    Ok(ObservedValue::TimeSeries { values: parsed, sample_rate })
}

pub(crate) fn data_set_value(item: &DataItem, payload: &str) -> Result<ObservedValue> {
    if payload.eq_ignore_ascii_case("UNAVAILABLE") || payload.is_empty() {
        return Ok(ObservedValue::Unavailable);
    }

    if item.representation == types::Representation::Table {
        let mut table = std::collections::BTreeMap::new();
        for entry in split_entries(payload) {
            let (key, value) = split_entry(&entry);
            match value {
                Some(inner) => {
                    table.insert(key.to_string(), parse_data_set(strip_braces(inner))?);
                }
                None => {
                    // Removed row: an empty cell set
                    table.insert(key.to_string(), DataSet::new());
                }
            }
        }
        return Ok(ObservedValue::Table(table));
    }

    Ok(ObservedValue::DataSet(parse_data_set(payload)?))
}

fn parse_data_set(payload: &str) -> Result<DataSet> {
    let mut set = DataSet::new();
    for entry in split_entries(payload) {
        let (key, value) = split_entry(&entry);
        match value {
            Some(raw) => {
                let cleaned = strip_quotes(strip_braces(raw));
                if cleaned.is_empty() {
                    set.insert(key.to_string(), DataSetEntry::removed());
                } else {
                    set.insert(key.to_string(), DataSetEntry::value(Scalar::parse(cleaned)));
                }
            }
            None => {
                set.insert(key.to_string(), DataSetEntry::removed());
            }
        }
    }
    Ok(set)
}

/// Split `k=v k2='v 2' k3={a=1 b=2}` into entries at top-level whitespace.
fn split_entries(payload: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in payload.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    current.push(c);
                    quote = Some(c);
                }
                '{' => {
                    depth += 1;
                    current.push(c);
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c.is_whitespace() && depth == 0 => {
                    if !current.is_empty() {
                        entries.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

fn split_entry(entry: &str) -> (&str, Option<&str>) {
    match entry.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (entry, None),
    }
}

fn strip_braces(value: &str) -> &str {
    value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(value)
}

fn strip_quotes(value: &str) -> &str {
    for q in ['\'', '"'] {
        if let Some(stripped) = value
            .strip_prefix(q)
            .and_then(|v| v.strip_suffix(q))
        {
            return stripped;
        }
    }
    value
}
