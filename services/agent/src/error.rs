//! Error types for the agent service

use thiserror::Error;

/// Main error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection-level failure; the owning source reconnects
    #[error("transport failure for {source_name}: {reason}")]
    Transport { source_name: String, reason: String },

    /// REST query parameter type or range violation; surfaced as 400
    #[error("parameter {name}: {reason}")]
    Parameter { name: String, reason: String },

    /// A named device does not exist in the model
    #[error("unknown device: {device}")]
    UnknownDevice { device: String },

    /// A named asset does not exist in the buffer
    #[error("unknown asset: {asset_id}")]
    UnknownAsset { asset_id: String },

    /// Sequence outside the buffer range; surfaced as OUT_OF_RANGE
    #[error(transparent)]
    OutOfRange(#[from] buffer::BufferError),

    /// Device model problems at startup
    #[error(transparent)]
    Model(#[from] types::ModelError),

    /// Writes arrived while PUT is disabled
    #[error("PUT is not allowed on this agent")]
    PutNotAllowed,

    /// Malformed request body
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// MQTT publishing failure; the publisher reconnects
    #[error("mqtt: {0}")]
    Mqtt(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// MTConnect error code for error documents
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Parameter { .. } => "INVALID_REQUEST",
            ServiceError::OutOfRange(_) => "OUT_OF_RANGE",
            ServiceError::UnknownDevice { .. } => "NO_DEVICE",
            ServiceError::UnknownAsset { .. } => "ASSET_NOT_FOUND",
            ServiceError::PutNotAllowed => "UNSUPPORTED",
            ServiceError::InvalidBody(_) => "INVALID_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }
}
