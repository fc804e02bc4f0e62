//! Error types for pipeline transforms

use thiserror::Error;

use codec::response::DocumentError;

/// Errors raised inside a transform. Each one drops only the entity being
/// processed; the source decides whether recovery is needed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed frame or document
    #[error(transparent)]
    Parse(#[from] codec::ParseError),

    /// Unknown unit expression; the data item cannot be converted
    #[error("no conversion from {from} to {to}")]
    UnknownUnit { from: String, to: String },

    /// A condition frame carried an unrecognized level token
    #[error("invalid condition level: {level}")]
    InvalidConditionLevel { level: String },

    /// The upstream agent restarted; the caller must refetch Current
    #[error("upstream instance changed from {previous} to {current}")]
    InstanceChanged { previous: u64, current: u64 },

    /// The upstream agent answered with an error document
    #[error("upstream agent returned {} error(s): {:?}", .0.len(), .0)]
    UpstreamErrors(Vec<DocumentError>),
}

impl PipelineError {
    /// True when the upstream source must reseed its sequence cursor.
    pub fn requires_reseed(&self) -> bool {
        match self {
            PipelineError::InstanceChanged { .. } => true,
            PipelineError::UpstreamErrors(errors) => {
                errors.iter().any(|e| e.code == "OUT_OF_RANGE")
            }
            _ => false,
        }
    }
}
