//! Quota sweep.
//!
//! Approximate LRU by modification time. The tree is streamed twice: once to
//! total it, once to pick the oldest files that cover the excess. Only that
//! prefix is held in memory, never the whole listing. Files that refuse to be
//! removed send the sweep back for another pick that leaves them out.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::CacheConfig;

const TARGET: &str = "cache::sweep";

pub const METRIC_SWEEP_EVICTED_TOTAL: &str = "snapcache_sweep_evicted_total";
pub const METRIC_SWEEP_MS: &str = "snapcache_sweep_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl Ord for SnapshotFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.modified
            .cmp(&other.modified)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for SnapshotFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazy walk over every regular file under a root.
///
/// Entries that vanish mid-walk or cannot be stat'ed are skipped. Each call
/// to [`SnapshotWalk::new`] restarts from the top.
pub struct SnapshotWalk {
    inner: walkdir::IntoIter,
}

impl SnapshotWalk {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: WalkDir::new(root).follow_links(false).into_iter(),
        }
    }
}

impl Iterator for SnapshotWalk {
    type Item = SnapshotFile;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        target = TARGET,
                        op = "walk",
                        result = "skipped",
                        error = %err,
                        "Unreadable cache entry skipped"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            return Some(SnapshotFile {
                path: entry.into_path(),
                size: metadata.len(),
                modified,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub total_before: u64,
    pub total_after: u64,
    pub evicted_files: usize,
    pub evicted_bytes: u64,
    pub failed: usize,
}

/// Sum of every file size under `root`.
pub fn total_size(root: &Path) -> u64 {
    SnapshotWalk::new(root).map(|file| file.size).sum()
}

/// Evict oldest files until the tree fits in `max_bytes`. Zero disables it.
///
/// A file that cannot be removed is skipped and the next-oldest one is tried
/// instead. The sweep only ends over budget once every remaining file failed.
pub fn sweep(root: &Path, max_bytes: u64) -> SweepReport {
    sweep_with(root, max_bytes, |path| fs::remove_file(path))
}

fn sweep_with(
    root: &Path,
    max_bytes: u64,
    mut remove: impl FnMut(&Path) -> io::Result<()>,
) -> SweepReport {
    let started_at = Instant::now();
    let total = total_size(root);
    let mut report = SweepReport {
        total_before: total,
        total_after: total,
        ..SweepReport::default()
    };
    if max_bytes == 0 || total <= max_bytes {
        debug!(
            target = TARGET,
            op = "sweep",
            result = "within_budget",
            total_bytes = total,
            max_bytes,
            "Sweep skipped"
        );
        return report;
    }

    let mut remaining = total;
    let mut stuck: HashSet<PathBuf> = HashSet::new();
    while remaining > max_bytes {
        let candidates = SnapshotWalk::new(root).filter(|file| !stuck.contains(&file.path));
        let victims = oldest_covering(candidates, remaining - max_bytes);
        if victims.is_empty() {
            break;
        }
        for file in victims {
            if remaining <= max_bytes {
                break;
            }
            match remove(&file.path) {
                Ok(()) => {
                    remaining = remaining.saturating_sub(file.size);
                    report.evicted_files += 1;
                    report.evicted_bytes += file.size;
                }
                // Someone else (a purge) already removed it; the bytes are gone.
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    remaining = remaining.saturating_sub(file.size);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = TARGET,
                        op = "sweep",
                        result = "unlink_error",
                        path = %file.path.display(),
                        error = %err,
                        "Failed to evict snapshot"
                    );
                    stuck.insert(file.path);
                }
            }
        }
    }
    report.total_after = remaining;

    let elapsed = started_at.elapsed();
    counter!(METRIC_SWEEP_EVICTED_TOTAL).increment(report.evicted_files as u64);
    histogram!(METRIC_SWEEP_MS).record(elapsed.as_secs_f64() * 1000.0);
    info!(
        target = TARGET,
        op = "sweep",
        result = if remaining <= max_bytes { "ok" } else { "over_budget" },
        total_before = report.total_before,
        total_after = report.total_after,
        evicted_files = report.evicted_files,
        failed = report.failed,
        elapsed_ms = elapsed.as_millis() as u64,
        "Quota sweep finished"
    );
    report
}

/// The shortest oldest-first prefix whose sizes add up to at least `excess`,
/// returned oldest first.
fn oldest_covering(files: impl Iterator<Item = SnapshotFile>, excess: u64) -> Vec<SnapshotFile> {
    let mut heap: BinaryHeap<SnapshotFile> = BinaryHeap::new();
    let mut held: u64 = 0;
    for file in files {
        held += file.size;
        heap.push(file);
        while let Some(newest) = heap.peek() {
            if held - newest.size >= excess {
                held -= newest.size;
                heap.pop();
            } else {
                break;
            }
        }
    }
    heap.into_sorted_vec()
}

/// Run [`sweep`] on a fixed cadence until the handle is aborted.
pub fn spawn_quota_sweeper(config: Arc<CacheConfig>) -> JoinHandle<()> {
    let period = if config.sweep_interval.is_zero() {
        Duration::from_secs(super::config::DEFAULT_SWEEP_INTERVAL_SECS)
    } else {
        config.sweep_interval
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            if !config.quota_enabled() {
                continue;
            }
            let root = config.base_directory.clone();
            let max_bytes = config.max_total_bytes;
            if let Err(err) = tokio::task::spawn_blocking(move || sweep(&root, max_bytes)).await {
                warn!(
                    target = TARGET,
                    op = "sweep",
                    result = "join_error",
                    error = %err,
                    "Quota sweep task failed"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;

    fn plant(root: &Path, name: &str, size: usize, age_secs: u64) -> PathBuf {
        let path = root.join(&name[..2]).join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'x'; size]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        path
    }

    #[test]
    fn within_budget_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        plant(dir.path(), "aa1.gz", 100, 10);
        plant(dir.path(), "bb1.gz", 100, 5);
        let report = sweep(dir.path(), 200);
        assert_eq!(report.evicted_files, 0);
        assert_eq!(report.total_after, 200);
    }

    #[test]
    fn zero_budget_disables_sweep() {
        let dir = TempDir::new().unwrap();
        let file = plant(dir.path(), "aa1.gz", 100, 10);
        let report = sweep(dir.path(), 0);
        assert_eq!(report.evicted_files, 0);
        assert!(file.exists());
    }

    #[test]
    fn evicts_strictly_oldest_first() {
        let dir = TempDir::new().unwrap();
        let oldest = plant(dir.path(), "aa1.gz", 100, 300);
        let older = plant(dir.path(), "bb1.gz", 100, 200);
        let newer = plant(dir.path(), "cc1.gz", 100, 100);
        let newest = plant(dir.path(), "dd1.br", 100, 1);

        let report = sweep(dir.path(), 250);
        assert_eq!(report.total_before, 400);
        assert_eq!(report.total_after, 200);
        assert_eq!(report.evicted_files, 2);
        assert!(!oldest.exists());
        assert!(!older.exists());
        assert!(newer.exists());
        assert!(newest.exists());
        assert!(total_size(dir.path()) <= 250);
    }

    #[test]
    fn undeletable_file_is_replaced_by_next_oldest() {
        let dir = TempDir::new().unwrap();
        let locked = plant(dir.path(), "aa1.gz", 100, 300);
        let older = plant(dir.path(), "bb1.gz", 100, 200);
        let newer = plant(dir.path(), "cc1.gz", 100, 100);

        let report = sweep_with(dir.path(), 250, |path| {
            if path == locked {
                Err(io::Error::new(ErrorKind::PermissionDenied, "read-only"))
            } else {
                fs::remove_file(path)
            }
        });

        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted_files, 1);
        assert_eq!(report.total_after, 200);
        assert!(locked.exists());
        assert!(!older.exists());
        assert!(newer.exists());
    }

    #[test]
    fn sweep_stops_when_nothing_can_be_removed() {
        let dir = TempDir::new().unwrap();
        plant(dir.path(), "aa1.gz", 100, 300);
        plant(dir.path(), "bb1.gz", 100, 200);

        let report = sweep_with(dir.path(), 50, |_| {
            Err(io::Error::new(ErrorKind::PermissionDenied, "read-only"))
        });

        assert_eq!(report.failed, 2);
        assert_eq!(report.evicted_files, 0);
        assert_eq!(report.total_after, 200);
    }

    #[test]
    fn covering_prefix_keeps_only_what_is_needed() {
        let now = SystemTime::now();
        let files = (0..5u64).map(|i| SnapshotFile {
            path: PathBuf::from(format!("f{i}")),
            size: 10,
            modified: now - Duration::from_secs(100 - i),
        });
        let picked = oldest_covering(files, 25);
        let names: Vec<_> = picked.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            names,
            vec![PathBuf::from("f0"), PathBuf::from("f1"), PathBuf::from("f2")]
        );
    }

    #[test]
    fn walk_yields_nested_files_only() {
        let dir = TempDir::new().unwrap();
        plant(dir.path(), "aa1.gz", 3, 1);
        plant(dir.path(), "ab2.br", 4, 1);
        let mut sizes: Vec<_> = SnapshotWalk::new(dir.path()).map(|f| f.size).collect();
        sizes.sort();
        assert_eq!(sizes, vec![3, 4]);
    }
}
