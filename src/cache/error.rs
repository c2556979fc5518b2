use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::keys::KeyError;

/// Failures raised by the snapshot engine.
///
/// Request-path callers turn these into reports and log them; operator
/// commands propagate them.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("failed to create cache directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove `{path}`: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {variant} snapshot: {source}")]
    Encode {
        variant: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to strip session markup: {0}")]
    Rewrite(String),
    #[error("content lookup failed: {0}")]
    Lookup(String),
}

impl CacheError {
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn remove(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Remove {
            path: path.into(),
            source,
        }
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::Lookup(message.into())
    }
}
