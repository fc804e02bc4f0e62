//! Error types for buffer operations

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A requested sequence lies outside `[first_sequence, next_sequence)`.
    /// Callers surface this as an OUT_OF_RANGE document rather than serving
    /// partial data silently.
    #[error("sequence {requested} is out of range [{first}, {next})")]
    OutOfRange {
        requested: u64,
        first: u64,
        next: u64,
    },
}
