use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("failed to read content index `{path}`: {message}")]
    ContentIndex { path: PathBuf, message: String },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn content_index(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ContentIndex {
            path: path.into(),
            message: message.into(),
        }
    }
}
