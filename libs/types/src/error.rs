//! Error types for the model and registry

use thiserror::Error;

/// Errors raised while building the device model or resolving against it
#[derive(Debug, Error)]
pub enum ModelError {
    /// Device model file could not be parsed
    #[error("invalid device model: {0}")]
    InvalidModel(#[from] serde_json::Error),

    /// Two devices or data items declared the same identifier
    #[error("duplicate identifier in device model: {id}")]
    DuplicateId { id: String },

    /// A device referenced by configuration does not exist in the model
    #[error("unknown device: {name}")]
    UnknownDevice { name: String },

    /// A data item value failed typed construction
    #[error("invalid value for data item {id}: {reason}")]
    InvalidValue { id: String, reason: String },
}
