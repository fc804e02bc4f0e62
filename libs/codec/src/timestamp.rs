//! Timestamp extraction from the leading SHDR token
//!
//! The first token of a frame carries an ISO 8601 instant, a numeric
//! relative offset, or nothing. An `@<seconds>` suffix carries a duration.
//! In relative-time mode the first frame establishes a base and every
//! later frame is shifted by the recorded offset.

use chrono::{DateTime, NaiveDateTime, Utc};

use types::Timestamp;

use crate::error::ParseError;
use crate::Result;

/// Frame tokens with the timestamp resolved and consumed
#[derive(Debug, Clone, PartialEq)]
pub struct Timestamped {
    pub timestamp: Timestamp,
    pub duration: Option<f64>,
    pub tokens: Vec<String>,
}

/// Per-connection timestamp state
#[derive(Debug, Default)]
pub struct TimestampExtractor {
    relative_time: bool,
    base: Option<Timestamp>,
    offset: Option<chrono::Duration>,
}

impl TimestampExtractor {
    pub fn new(relative_time: bool) -> Self {
        Self {
            relative_time,
            base: None,
            offset: None,
        }
    }

    pub fn set_relative_time(&mut self, relative: bool) {
        self.relative_time = relative;
        if !relative {
            self.reset();
        }
    }

    /// Forget the relative-time baseline (used on reconnect)
    pub fn reset(&mut self) {
        self.base = None;
        self.offset = None;
    }

    /// Resolve the timestamp token of one frame.
    pub fn extract(&mut self, token: &str, now: Timestamp) -> Result<(Timestamp, Option<f64>)> {
        let (stamp, duration) = split_duration(token);

        if stamp.is_empty() {
            return Ok((now, duration));
        }

        let has_t = stamp.contains('T');
        let parsed = if has_t {
            Some(parse_instant(stamp).unwrap_or(now))
        } else {
            None
        };

        if !self.relative_time {
            return match parsed {
                Some(ts) => Ok((ts, duration)),
                // A bare number with relative time off is not a timestamp we
                // can anchor; treat the frame as malformed.
                None => Err(ParseError::InvalidTimestamp {
                    token: token.to_string(),
                }),
            };
        }

        // Relative-time mode: numeric offsets are milliseconds.
        let offset_micros = if has_t {
            None
        } else {
            let millis: f64 = stamp.parse().map_err(|_| ParseError::InvalidTimestamp {
                token: token.to_string(),
            })?;
            Some((millis * 1000.0) as i64)
        };

        let timestamp = match self.base {
            None => {
                self.base = Some(now);
                self.offset = Some(match parsed {
                    Some(ts) => now - ts,
                    None => chrono::Duration::microseconds(offset_micros.unwrap()),
                });
                now
            }
            Some(base) => {
                let offset = self.offset.expect("offset set with base");
                match parsed {
                    Some(ts) => ts + offset,
                    None => base + chrono::Duration::microseconds(offset_micros.unwrap()) - offset,
                }
            }
        };

        Ok((timestamp, duration))
    }
}

/// Split an optional `@<seconds>` duration suffix off a timestamp token.
fn split_duration(token: &str) -> (&str, Option<f64>) {
    match token.split_once('@') {
        Some((stamp, dur)) => match dur.parse::<f64>() {
            Ok(seconds) => (stamp, Some(seconds)),
            Err(_) => (token, None),
        },
        None => (token, None),
    }
}

/// Parse an ISO 8601 instant, tolerating a missing timezone (read as UTC).
pub fn parse_instant(raw: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
