//! Filesystem snapshot store.
//!
//! Owns every mutation of the shard tree: directory creation, atomic
//! temp-then-rename writes, and variant-wide deletion. Reads live in
//! [`super::early`], which never takes a lock and never writes.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::CacheError;
use super::keys::{CacheKey, Variant};

const TARGET: &str = "cache::store";

/// Which directory level could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirFailure {
    Base,
    Shard,
}

impl DirFailure {
    pub fn header_value(self) -> &'static str {
        match self {
            DirFailure::Base => "mkdir-base-failed",
            DirFailure::Shard => "mkdir-shard-failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create the root and the shard directory for `key`.
    ///
    /// `create_dir_all` treats an existing directory as success, so concurrent
    /// first writers do not trip over each other.
    pub fn ensure_shard(&self, key: &CacheKey) -> Result<PathBuf, (DirFailure, CacheError)> {
        fs::create_dir_all(&self.base).map_err(|source| {
            (
                DirFailure::Base,
                CacheError::CreateDir {
                    path: self.base.clone(),
                    source,
                },
            )
        })?;
        let shard = key.shard_dir(&self.base);
        fs::create_dir_all(&shard).map_err(|source| {
            (
                DirFailure::Shard,
                CacheError::CreateDir {
                    path: shard.clone(),
                    source,
                },
            )
        })?;
        Ok(shard)
    }

    /// Write one variant atomically.
    ///
    /// The payload lands in a uniquely named sibling, is synced, then renamed
    /// over the final name. Dropping the temp file on any error removes it.
    pub fn write_variant(
        &self,
        key: &CacheKey,
        variant: Variant,
        payload: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let shard = key.shard_dir(&self.base);
        let final_path = key.snapshot_path(variant, &self.base);

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", key.as_str()))
            .suffix(".tmp")
            .tempfile_in(&shard)
            .map_err(|err| CacheError::write(&shard, err))?;
        temp.write_all(payload)
            .map_err(|err| CacheError::write(temp.path(), err))?;
        temp.flush()
            .map_err(|err| CacheError::write(temp.path(), err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| CacheError::write(temp.path(), err))?;

        temp.persist(&final_path)
            .map_err(|err| CacheError::write(&final_path, err.error))?;

        debug!(
            target = TARGET,
            op = "write_variant",
            result = "ok",
            variant = variant.as_str(),
            bytes = payload.len() as u64,
            path = %final_path.display(),
            "Snapshot variant persisted"
        );
        Ok(final_path)
    }

    /// Delete every variant of `key`. Missing files are not an error.
    ///
    /// Returns the number of files that were actually removed.
    pub fn remove_entry(&self, key: &CacheKey) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut first_error = None;
        for variant in Variant::ALL {
            let path = key.snapshot_path(variant, &self.base);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "remove_entry",
                        result = "error",
                        path = %path.display(),
                        error = %err,
                        "Failed to remove snapshot variant"
                    );
                    if first_error.is_none() {
                        first_error = Some(CacheError::remove(path, err));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Remove the whole tree and recreate an empty root.
    pub fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::remove(&self.base, err)),
        }
        fs::create_dir_all(&self.base).map_err(|source| CacheError::CreateDir {
            path: self.base.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::normalize_url;

    fn key(url: &str) -> CacheKey {
        CacheKey::derive(&normalize_url(url).unwrap())
    }

    #[test]
    fn write_creates_final_file_only() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let key = key("https://example.com/about-us/");

        let shard = store.ensure_shard(&key).unwrap();
        let path = store.write_variant(&key, Variant::Gzip, b"payload").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"payload");
        let names: Vec<_> = fs::read_dir(&shard)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "temp file must not survive: {names:?}");
    }

    #[test]
    fn rewrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = key("https://example.com/");
        store.ensure_shard(&key).unwrap();
        store.write_variant(&key, Variant::Raw, b"old").unwrap();
        let path = store.write_variant(&key, Variant::Raw, b"new").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"new");
    }

    #[test]
    fn remove_entry_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = key("https://example.com/x/");
        store.ensure_shard(&key).unwrap();
        store.write_variant(&key, Variant::Gzip, b"a").unwrap();
        store.write_variant(&key, Variant::Brotli, b"b").unwrap();

        assert_eq!(store.remove_entry(&key).unwrap(), 2);
        assert_eq!(store.remove_entry(&key).unwrap(), 0);
    }

    #[test]
    fn base_that_is_a_file_reports_base_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let store = SnapshotStore::new(&blocker);
        let (failure, _) = store.ensure_shard(&key("https://example.com/")).unwrap_err();
        assert_eq!(failure, DirFailure::Base);
        assert_eq!(failure.header_value(), "mkdir-base-failed");
    }

    #[test]
    fn clear_recreates_empty_root() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("root"));
        let key = key("https://example.com/");
        store.ensure_shard(&key).unwrap();
        store.write_variant(&key, Variant::Gzip, b"x").unwrap();

        store.clear().unwrap();
        assert!(store.base().is_dir());
        assert_eq!(fs::read_dir(store.base()).unwrap().count(), 0);
    }
}
