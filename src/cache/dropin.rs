//! Early-serve bootstrap manifest.
//!
//! The manifest is the only thing the early reader loads. It lives in the host
//! content directory and starts with an ownership marker, so a file written by
//! anything else is never overwritten or deleted. The outcome of the last
//! install is recorded next to it as JSON.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::config::CacheConfig;
use super::early::EarlySettings;
use super::keys::KEY_ALGORITHM_VERSION;

const TARGET: &str = "cache::dropin";

pub const MANIFEST_FILE: &str = "early-serve.toml";
pub const STATE_FILE: &str = ".snapcache-dropin.json";
pub const OWNERSHIP_MARKER: &str = "# snapcache early-serve manifest (managed by snapcache)";

/// How far into a file the marker is looked for.
const MARKER_WINDOW: usize = 256;

pub const REASON_FOREIGN: &str = "existing-foreign-dropin";
pub const REASON_WRITE_FAILED: &str = "write-failed";

#[derive(Debug, Error)]
pub enum DropinError {
    #[error("drop-in io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render manifest: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to parse manifest `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode install state: {0}")]
    State(#[from] serde_json::Error),
    #[error("`{0}` is not managed by snapcache")]
    Foreign(PathBuf),
}

impl DropinError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyServeManifest {
    pub base_directory: PathBuf,
    pub min_snapshot_bytes: u64,
    pub debug_headers: bool,
    #[serde(default)]
    pub session_cookie_prefixes: Vec<String>,
    pub key_algorithm: u32,
}

impl EarlyServeManifest {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            base_directory: config.base_directory.clone(),
            min_snapshot_bytes: config.min_snapshot_bytes,
            debug_headers: config.debug_headers,
            session_cookie_prefixes: config.session_cookie_prefixes.clone(),
            key_algorithm: KEY_ALGORITHM_VERSION,
        }
    }

    pub fn render(&self) -> Result<String, DropinError> {
        Ok(format!("{OWNERSHIP_MARKER}\n{}", toml::to_string(self)?))
    }

    /// Load the manifest from `content_dir`, refusing files without the marker.
    pub fn load(content_dir: &Path) -> Result<Self, DropinError> {
        let path = content_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|err| DropinError::io(&path, err))?;
        if !marker_in(raw.as_bytes()) {
            return Err(DropinError::Foreign(path));
        }
        toml::from_str(&raw).map_err(|source| DropinError::Parse { path, source })
    }
}

impl From<EarlyServeManifest> for EarlySettings {
    fn from(manifest: EarlyServeManifest) -> Self {
        let session_cookie_prefixes = if manifest.session_cookie_prefixes.is_empty() {
            super::config::DEFAULT_SESSION_COOKIE_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect()
        } else {
            manifest.session_cookie_prefixes
        };
        Self {
            base_directory: manifest.base_directory,
            min_snapshot_bytes: manifest.min_snapshot_bytes,
            debug_headers: manifest.debug_headers,
            session_cookie_prefixes,
            key_algorithm: manifest.key_algorithm,
        }
    }
}

/// Persisted outcome of the last install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropinState {
    pub installed: bool,
    pub ours: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DropinState {
    fn installed() -> Self {
        Self {
            installed: true,
            ours: true,
            reason: None,
        }
    }

    fn refused(reason: &str) -> Self {
        Self {
            installed: false,
            ours: false,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Ours,
    Foreign,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Absent => "absent",
            Presence::Ours => "ours",
            Presence::Foreign => "foreign",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropinStatus {
    pub presence: Presence,
    pub recorded: Option<DropinState>,
}

#[derive(Debug, Clone)]
pub struct DropinInstaller {
    content_dir: PathBuf,
}

impl DropinInstaller {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.content_dir.join(MANIFEST_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.content_dir.join(STATE_FILE)
    }

    /// Write the manifest unless a foreign file occupies its place.
    ///
    /// Refusals and write failures are recorded in the state and returned,
    /// not raised; only a failure to record the state is an error.
    pub fn install(&self, manifest: &EarlyServeManifest) -> Result<DropinState, DropinError> {
        let path = self.manifest_path();
        let state = match self.presence()? {
            Presence::Foreign => {
                warn!(
                    target = TARGET,
                    op = "install",
                    result = REASON_FOREIGN,
                    path = %path.display(),
                    "Foreign early-serve manifest left untouched"
                );
                DropinState::refused(REASON_FOREIGN)
            }
            Presence::Absent | Presence::Ours => match self.write_manifest(manifest) {
                Ok(()) => {
                    info!(
                        target = TARGET,
                        op = "install",
                        result = "ok",
                        path = %path.display(),
                        "Early-serve manifest installed"
                    );
                    DropinState::installed()
                }
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "install",
                        result = REASON_WRITE_FAILED,
                        path = %path.display(),
                        error = %err,
                        "Early-serve manifest could not be written"
                    );
                    DropinState::refused(REASON_WRITE_FAILED)
                }
            },
        };
        self.save_state(&state)?;
        Ok(state)
    }

    /// Remove the manifest if it is ours and forget the recorded state.
    ///
    /// Returns whether a file was deleted.
    pub fn uninstall(&self) -> Result<bool, DropinError> {
        let path = self.manifest_path();
        let removed = match self.presence()? {
            Presence::Ours => {
                fs::remove_file(&path).map_err(|err| DropinError::io(&path, err))?;
                true
            }
            Presence::Foreign | Presence::Absent => false,
        };

        let state_path = self.state_path();
        match fs::remove_file(&state_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(DropinError::io(&state_path, err)),
        }
        info!(
            target = TARGET,
            op = "uninstall",
            result = if removed { "removed" } else { "kept" },
            path = %path.display(),
            "Early-serve manifest uninstall finished"
        );
        Ok(removed)
    }

    pub fn status(&self) -> Result<DropinStatus, DropinError> {
        Ok(DropinStatus {
            presence: self.presence()?,
            recorded: self.load_state()?,
        })
    }

    fn presence(&self) -> Result<Presence, DropinError> {
        let path = self.manifest_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Presence::Absent),
            Err(err) => return Err(DropinError::io(&path, err)),
        };
        let mut head = Vec::with_capacity(MARKER_WINDOW);
        file.take(MARKER_WINDOW as u64)
            .read_to_end(&mut head)
            .map_err(|err| DropinError::io(&path, err))?;
        Ok(if marker_in(&head) {
            Presence::Ours
        } else {
            Presence::Foreign
        })
    }

    fn write_manifest(&self, manifest: &EarlyServeManifest) -> Result<(), DropinError> {
        let rendered = manifest.render()?;
        fs::create_dir_all(&self.content_dir)
            .map_err(|err| DropinError::io(&self.content_dir, err))?;
        write_atomic(&self.content_dir, &self.manifest_path(), rendered.as_bytes())
    }

    fn save_state(&self, state: &DropinState) -> Result<(), DropinError> {
        let encoded = serde_json::to_vec_pretty(state)?;
        fs::create_dir_all(&self.content_dir)
            .map_err(|err| DropinError::io(&self.content_dir, err))?;
        write_atomic(&self.content_dir, &self.state_path(), &encoded)
    }

    fn load_state(&self) -> Result<Option<DropinState>, DropinError> {
        let path = self.state_path();
        match fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DropinError::io(&path, err)),
        }
    }
}

fn marker_in(head: &[u8]) -> bool {
    let window = &head[..head.len().min(MARKER_WINDOW)];
    window
        .windows(OWNERSHIP_MARKER.len())
        .any(|candidate| candidate == OWNERSHIP_MARKER.as_bytes())
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), DropinError> {
    let mut temp = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| DropinError::io(dir, err))?;
    temp.write_all(bytes)
        .and_then(|()| temp.flush())
        .map_err(|err| DropinError::io(path, err))?;
    temp.persist(path)
        .map_err(|err| DropinError::io(path, err.error))?;
    Ok(())
}
