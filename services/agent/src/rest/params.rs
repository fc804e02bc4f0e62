//! Typed query parameters
//!
//! Each endpoint declares its parameters with a type and an optional
//! default. Missing optional parameters take the default, typed conversion
//! failures surface as 400s, and unknown parameters are ignored.

use std::collections::HashMap;

use crate::error::ServiceError;
use crate::Result;

/// Query parameters of one request
pub struct QueryParams<'a> {
    raw: &'a HashMap<String, String>,
}

impl<'a> QueryParams<'a> {
    pub fn new(raw: &'a HashMap<String, String>) -> Self {
        Self { raw }
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.raw.get(name).cloned()
    }

    pub fn unsigned(&self, name: &str) -> Result<Option<u64>> {
        self.parse_with(name, |raw| raw.parse::<u64>().ok())
    }

    pub fn integer(&self, name: &str) -> Result<Option<i32>> {
        self.parse_with(name, |raw| raw.parse::<i32>().ok())
    }

    pub fn double(&self, name: &str) -> Result<Option<f64>> {
        self.parse_with(name, |raw| raw.parse::<f64>().ok().filter(|v| v.is_finite()))
    }

    pub fn boolean(&self, name: &str) -> Result<Option<bool>> {
        self.parse_with(name, |raw| match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        })
    }

    fn parse_with<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
        match self.raw.get(name) {
            None => Ok(None),
            Some(raw) => parse(raw).map(Some).ok_or_else(|| {
                ServiceError::parameter(name, format!("cannot convert '{raw}'"))
            }),
        }
    }

    /// `count` with its default and `[1, max]` range check
    pub fn count(&self, max: usize) -> Result<usize> {
        let count = self.integer("count")?.unwrap_or(100);
        if count < 1 || count as usize > max {
            return Err(ServiceError::parameter(
                "count",
                format!("must be between 1 and {max}, was {count}"),
            ));
        }
        Ok(count as usize)
    }

    /// Streaming interval in milliseconds; present only when streaming
    pub fn interval(&self) -> Result<Option<f64>> {
        match self.double("interval")? {
            None => self.double("frequency"),
            some => Ok(some),
        }
    }

    /// Streaming heartbeat, defaulted and clamped to [1 ms, 1 h]
    pub fn heartbeat(&self) -> Result<f64> {
        let heartbeat = self.double("heartbeat")?.unwrap_or(10_000.0);
        Ok(heartbeat.clamp(1.0, 3_600_000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_missing() {
        let raw = params(&[]);
        let q = QueryParams::new(&raw);
        assert_eq!(100, q.count(1000).unwrap());
        assert_eq!(10_000.0, q.heartbeat().unwrap());
        assert_eq!(None, q.unsigned("from").unwrap());
    }

    #[test]
    fn typed_values_parse() {
        let raw = params(&[("count", "1000"), ("from", "12345"), ("interval", "50.5")]);
        let q = QueryParams::new(&raw);
        assert_eq!(1000, q.count(10_000).unwrap());
        assert_eq!(Some(12_345), q.unsigned("from").unwrap());
        assert_eq!(Some(50.5), q.interval().unwrap());
    }

    #[test]
    fn conversion_failures_are_parameter_errors() {
        let raw = params(&[("count", "xxx")]);
        let q = QueryParams::new(&raw);
        assert!(matches!(
            q.count(1000),
            Err(ServiceError::Parameter { .. })
        ));

        let raw = params(&[("from", "-2")]);
        let q = QueryParams::new(&raw);
        assert!(q.unsigned("from").is_err());
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let raw = params(&[("dummy", "1"), ("count", "5")]);
        let q = QueryParams::new(&raw);
        assert_eq!(5, q.count(1000).unwrap());
    }

    #[test]
    fn count_range_is_enforced() {
        let raw = params(&[("count", "0")]);
        assert!(QueryParams::new(&raw).count(1000).is_err());
        let raw = params(&[("count", "2000")]);
        assert!(QueryParams::new(&raw).count(1000).is_err());
    }

    #[test]
    fn heartbeat_clamps() {
        let raw = params(&[("heartbeat", "0.0001")]);
        assert_eq!(1.0, QueryParams::new(&raw).heartbeat().unwrap());
        let raw = params(&[("heartbeat", "99999999")]);
        assert_eq!(3_600_000.0, QueryParams::new(&raw).heartbeat().unwrap());
    }

    #[test]
    fn frequency_is_an_interval_alias() {
        let raw = params(&[("frequency", "250")]);
        assert_eq!(Some(250.0), QueryParams::new(&raw).interval().unwrap());
    }
}
