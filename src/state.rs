//! Per-folder file state model (spec §3, §4.5): `FileStateStore`, the
//! `FileState` tagged union, and the persisted `FolderSnapshot`.
//!
//! Persisted as JSON under the state directory, written via
//! temp-file-then-rename for atomicity — the same pattern the teacher uses
//! for staged file bytes, applied here to state files (spec §3 Expansion).

use crate::error::Result;
use crate::vclock::VectorClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub content_hash: [u8; 32],
    pub mtime: DateTime<Utc>,
    pub vector_clock: VectorClock,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionRecord {
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub vector_clock: VectorClock,
}

/// Tagged union — never a nullable metadata plus an "is_deleted" flag
/// (spec §9 design note).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum FileState {
    Exists(FileMetadata),
    Deleted(DeletionRecord),
}

impl FileState {
    pub fn content_hash(&self) -> Option<[u8; 32]> {
        match self {
            FileState::Exists(m) => Some(m.content_hash),
            FileState::Deleted(_) => None,
        }
    }

    pub fn vector_clock(&self) -> &VectorClock {
        match self {
            FileState::Exists(m) => &m.vector_clock,
            FileState::Deleted(t) => &t.vector_clock,
        }
    }
}

/// Per-folder keyed store: `path -> FileState`, persisted to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStateStore {
    files: HashMap<String, FileState>,
}

impl FileStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path).map_err(|e| crate::error::SyncError::io(path.display().to_string(), e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::SyncError::io(parent.display().to_string(), e))?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| crate::error::SyncError::io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, path).map_err(|e| crate::error::SyncError::io(path.display().to_string(), e))?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileState> {
        self.files.get(path)
    }

    pub fn set_exists(&mut self, path: impl Into<String>, meta: FileMetadata) {
        self.files.insert(path.into(), FileState::Exists(meta));
    }

    pub fn set_deleted(&mut self, path: impl Into<String>, tombstone: DeletionRecord) {
        self.files.insert(path.into(), FileState::Deleted(tombstone));
    }

    pub fn remove(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileState)> {
        self.files.iter()
    }

    pub fn iter_deleted_paths(&self) -> impl Iterator<Item = &String> {
        self.files.iter().filter_map(|(p, s)| matches!(s, FileState::Deleted(_)).then_some(p))
    }

    pub fn iter_existing(&self) -> impl Iterator<Item = (&String, &FileMetadata)> {
        self.files.iter().filter_map(|(p, s)| match s {
            FileState::Exists(m) => Some((p, m)),
            FileState::Deleted(_) => None,
        })
    }

    /// Remove `Deleted` entries older than `ttl` for which `predicate`
    /// returns true. Default predicate policy is "true after TTL" (spec
    /// §4.5) — callers pass something stricter when other peers may not
    /// have observed the deletion yet.
    pub fn cleanup_expired<F>(&mut self, now: DateTime<Utc>, ttl: chrono::Duration, predicate: F)
    where
        F: Fn(&str, &DeletionRecord) -> bool,
    {
        let expired: Vec<String> = self
            .files
            .iter()
            .filter_map(|(p, s)| match s {
                FileState::Deleted(t) if now - t.deleted_at > ttl && predicate(p, t) => Some(p.clone()),
                _ => None,
            })
            .collect();
        for p in expired {
            self.files.remove(&p);
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A single path's persisted snapshot row (spec §3 `FolderSnapshot`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub hash: [u8; 32],
    pub mtime: DateTime<Utc>,
    pub vector_clock: VectorClock,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub sync_id: String,
    pub folder_id: uuid::Uuid,
    pub files: HashMap<String, SnapshotEntry>,
    pub taken_at: DateTime<Utc>,
}

impl FolderSnapshot {
    pub fn empty(sync_id: impl Into<String>, folder_id: uuid::Uuid) -> Self {
        Self { sync_id: sync_id.into(), folder_id, files: HashMap::new(), taken_at: Utc::now() }
    }

    pub fn path_for(state_dir: &Path, sync_id: &str) -> PathBuf {
        state_dir.join("sync").join(sync_id).join("snapshot.json")
    }

    pub fn load(state_dir: &Path, sync_id: &str) -> Result<Option<Self>> {
        let p = Self::path_for(state_dir, sync_id);
        if !p.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&p).map_err(|e| crate::error::SyncError::io(p.display().to_string(), e))?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let p = Self::path_for(state_dir, &self.sync_id);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::SyncError::io(parent.display().to_string(), e))?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = p.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| crate::error::SyncError::io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, &p).map_err(|e| crate::error::SyncError::io(p.display().to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(hash: u8) -> FileMetadata {
        FileMetadata { content_hash: [hash; 32], mtime: Utc::now(), vector_clock: VectorClock::new(), size: 10 }
    }

    #[test]
    fn exists_and_deleted_are_mutually_exclusive() {
        let mut store = FileStateStore::new();
        store.set_exists("a.txt", meta(1));
        assert!(matches!(store.get("a.txt"), Some(FileState::Exists(_))));
        store.set_deleted(
            "a.txt",
            DeletionRecord { deleted_at: Utc::now(), deleted_by: "pa".into(), vector_clock: VectorClock::new() },
        );
        assert!(matches!(store.get("a.txt"), Some(FileState::Deleted(_))));
    }

    #[test]
    fn cleanup_expired_respects_ttl() {
        let mut store = FileStateStore::new();
        let old = Utc::now() - chrono::Duration::days(10);
        store.set_deleted("old.txt", DeletionRecord { deleted_at: old, deleted_by: "pa".into(), vector_clock: VectorClock::new() });
        let recent = Utc::now() - chrono::Duration::seconds(5);
        store.set_deleted("recent.txt", DeletionRecord { deleted_at: recent, deleted_by: "pa".into(), vector_clock: VectorClock::new() });

        store.cleanup_expired(Utc::now(), chrono::Duration::days(7), |_, _| true);
        assert!(store.get("old.txt").is_none());
        assert!(store.get("recent.txt").is_some());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStateStore::new();
        store.set_exists("a.txt", meta(1));
        let path = dir.path().join("state.json");
        store.save(&path).unwrap();
        let loaded = FileStateStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
