//! Configuration errors

use std::path::PathBuf;

use thiserror::Error;

/// Missing or invalid configuration. Fatal: the process exits with the
/// configuration error code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Malformed(#[from] toml::de::Error),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
