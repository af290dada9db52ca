use std::path::Path;

use echobeats::error::{ConfigError, EchoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("no per-user config directory on this platform")]
    NoConfigDir,

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EchoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid request: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl DaemonError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
