//! Timestamp alias and formatting helpers

use chrono::{DateTime, SecondsFormat, Utc};

/// UTC instant with microsecond resolution
pub type Timestamp = DateTime<Utc>;

/// Format a timestamp the way agent documents expect it: RFC 3339 with
/// microsecond precision and a `Z` suffix.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_with_microseconds_and_z() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 19, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_450);
        assert_eq!("2021-01-19T12:00:00.123450Z", format_timestamp(&ts));
    }
}
