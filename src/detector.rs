//! Walks a folder and produces the current `FileState` map plus the
//! folder's `MerkleSummary` root (spec §4.6).

use crate::chunker::hash_file;
use crate::error::{Result, SyncError};
use crate::ignore::IgnoreSet;
use crate::merkle::MerkleSummary;
use crate::state::{FileMetadata, FileState};
use crate::vclock::VectorClock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

pub struct ScanResult {
    pub summary: MerkleSummary,
    pub states: HashMap<String, FileState>,
    pub file_count: usize,
    pub total_size: u64,
}

fn normalize_rel(p: &Path) -> String {
    p.to_string_lossy().replace('\\', "/")
}

/// `vc_lookup(path)` fetches the persisted vector clock for a path (or a
/// fresh empty one); `now` and `write_stability_delay` implement the
/// zero-byte write-stability gate; `yield_every` is the cooperative
/// scheduling batch size B (spec default 50).
pub async fn compute_full_state(
    root: &Path,
    ignores: &IgnoreSet,
    vc_lookup: impl Fn(&str) -> VectorClock,
    now: DateTime<Utc>,
    write_stability_delay: chrono::Duration,
    yield_every: usize,
) -> Result<ScanResult> {
    let mut summary = MerkleSummary::new();
    let mut states = HashMap::new();
    let mut file_count = 0usize;
    let mut total_size = 0u64;
    let mut scanned = 0usize;

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path();
        let rel = match abs.strip_prefix(root) {
            Ok(r) => normalize_rel(r),
            Err(_) => continue,
        };

        if IgnoreSet::is_hidden(&rel) || ignores.is_ignored(&rel) || crate::conflict::is_conflict_path(&rel) {
            continue;
        }

        let meta = match std::fs::metadata(abs) {
            Ok(m) => m,
            Err(_) => continue, // unreadable entries: log and continue (spec)
        };

        if meta.len() == 0 {
            let mtime: DateTime<Utc> = meta.modified().ok().map(DateTime::from).unwrap_or(now);
            if now - mtime < write_stability_delay {
                continue;
            }
        }

        let hash = match hash_file(abs) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let mtime: DateTime<Utc> = meta.modified().ok().map(DateTime::from).unwrap_or(now);
        let vc = vc_lookup(&rel);

        summary.insert(rel.clone(), hash);
        states.insert(rel, FileState::Exists(FileMetadata { content_hash: hash, mtime, vector_clock: vc, size: meta.len() }));
        file_count += 1;
        total_size += meta.len();

        scanned += 1;
        if scanned % yield_every.max(1) == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(ScanResult { summary, states, file_count, total_size })
}

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| SyncError::io(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_folder_has_no_root() {
        let dir = tempfile::tempdir().unwrap();
        let ignores = IgnoreSet::new();
        let result = compute_full_state(dir.path(), &ignores, |_| VectorClock::new(), Utc::now(), chrono::Duration::seconds(3), 50)
            .await
            .unwrap();
        assert_eq!(result.file_count, 0);
        assert!(result.summary.root().is_none());
    }

    #[tokio::test]
    async fn zero_byte_recent_file_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("new.txt"), b"").unwrap();
        let ignores = IgnoreSet::new();
        let result = compute_full_state(dir.path(), &ignores, |_| VectorClock::new(), Utc::now(), chrono::Duration::seconds(3), 50)
            .await
            .unwrap();
        assert_eq!(result.file_count, 0);
    }

    #[tokio::test]
    async fn hidden_and_ignored_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), b"ref").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"hello").unwrap();
        let ignores = IgnoreSet::new();
        let result = compute_full_state(dir.path(), &ignores, |_| VectorClock::new(), Utc::now(), chrono::Duration::seconds(3), 50)
            .await
            .unwrap();
        assert_eq!(result.file_count, 1);
        assert!(result.states.contains_key("visible.txt"));
    }

    #[tokio::test]
    async fn conflict_artifacts_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.conflict.12345678.42.txt"), b"x").unwrap();
        let ignores = IgnoreSet::new();
        let result = compute_full_state(dir.path(), &ignores, |_| VectorClock::new(), Utc::now(), chrono::Duration::seconds(3), 50)
            .await
            .unwrap();
        assert_eq!(result.file_count, 0);
    }
}
