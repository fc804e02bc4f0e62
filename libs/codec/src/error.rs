//! Error types for wire decoding

use thiserror::Error;

/// Malformed input frame or upstream document. Non-fatal: the offending
/// frame is dropped and logged by the caller.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Timestamp token could not be interpreted
    #[error("invalid timestamp token: {token}")]
    InvalidTimestamp { token: String },

    /// A frame referenced fewer value tokens than its data item requires
    #[error("truncated frame for data item {data_item}: expected {expected} more tokens")]
    TruncatedFrame { data_item: String, expected: usize },

    /// Upstream document was not well-formed XML
    #[error("malformed document: {0}")]
    MalformedDocument(#[from] roxmltree::Error),

    /// Upstream document was well-formed but not an MTConnect document
    #[error("unexpected document root: {root}")]
    UnexpectedRoot { root: String },

    /// A required attribute was missing from an upstream document
    #[error("missing attribute {attribute} on {element}")]
    MissingAttribute {
        element: String,
        attribute: String,
    },

    /// Numeric field failed conversion
    #[error("invalid numeric value: {value}")]
    InvalidNumeric { value: String },
}
