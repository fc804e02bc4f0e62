//! Adapter protocol commands
//!
//! Lines of the form `* <key>: <value>` carry out-of-band instructions from
//! an adapter: heartbeat PONGs, runtime option changes, and device metadata
//! updates.

use once_cell::sync::Lazy;
use regex::Regex;

static COMMAND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*\s*([^:]+):\s*(.*)$").expect("valid command pattern"));

/// One parsed `* key: value` line. The key is lowercased for matching; the
/// raw line is retained for verbatim forwarding of unrecognized commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    pub key: String,
    pub value: String,
    pub raw: String,
}

impl ProtocolCommand {
    /// Parse a command line. Returns `None` when the line is not a command
    /// (including bare `* PONG` heartbeat responses, which carry no colon).
    pub fn parse(line: &str) -> Option<ProtocolCommand> {
        let caps = COMMAND_PATTERN.captures(line)?;
        Some(ProtocolCommand {
            key: caps[1].trim().to_ascii_lowercase(),
            value: caps[2].trim().to_string(),
            raw: line.to_string(),
        })
    }

    /// `yes`/`true` (case-insensitive) read as true, everything else false.
    pub fn bool_value(&self) -> bool {
        let v = self.value.to_ascii_lowercase();
        v == "yes" || v == "true"
    }
}

/// True for any `*`-prefixed out-of-band line
pub fn is_command_line(line: &str) -> bool {
    line.starts_with('*')
}

/// True for a heartbeat response line
pub fn is_pong(line: &str) -> bool {
    line.trim() == "* PONG" || line.trim().starts_with("* PONG ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value() {
        let cmd = ProtocolCommand::parse("* conversionRequired: yes").unwrap();
        assert_eq!("conversionrequired", cmd.key);
        assert_eq!("yes", cmd.value);
        assert!(cmd.bool_value());
    }

    #[test]
    fn tolerates_spacing() {
        let cmd = ProtocolCommand::parse("*   device:   LinuxCNC").unwrap();
        assert_eq!("device", cmd.key);
        assert_eq!("LinuxCNC", cmd.value);
    }

    #[test]
    fn non_commands_are_rejected() {
        assert!(ProtocolCommand::parse("2021-01-01T00:00:00Z|exec|ACTIVE").is_none());
        assert!(ProtocolCommand::parse("* PONG").is_none());
        assert!(is_pong("* PONG"));
        assert!(is_pong("* PONG 10000"));
    }

    #[test]
    fn false_values() {
        let cmd = ProtocolCommand::parse("* relativeTime: no").unwrap();
        assert!(!cmd.bool_value());
    }
}
