use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort plan construction. Attribution misses and observer
/// failures are not represented here; they are logged and contained.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task not found in catalog: {0}")]
    Resolution(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code used by the CLI error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::Resolution(_) => "resolution_error",
            Error::Io { .. } => "io_error",
            Error::Yaml(_) | Error::Json(_) => "parse_error",
        }
    }
}
