//! Content-addressed blob cache (spec §4.2).
//!
//! Process-wide, concurrent-safe: `put` is idempotent under content
//! addressing so no locking beyond what the filesystem already gives us is
//! needed (spec §5 "Shared resources").

use crate::chunker::hash_bytes;
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

fn hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

impl BlockStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SyncError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &[u8; 32]) -> PathBuf {
        let h = hex(hash);
        self.root.join(&h[0..2]).join(&h[2..])
    }

    pub fn has(&self, hash: &[u8; 32]) -> bool {
        self.path_for(hash).exists()
    }

    pub fn has_many(&self, hashes: &[[u8; 32]]) -> HashMap<[u8; 32], bool> {
        hashes.iter().map(|h| (*h, self.has(h))).collect()
    }

    pub fn get(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        let p = self.path_for(hash);
        std::fs::read(&p).map_err(|e| SyncError::io(p.display().to_string(), e))
    }

    /// `put(h, bytes)` with an existing `h` is a no-op iff `hash(bytes) == h`
    /// (spec invariant 7); otherwise it's an invariant violation, never a
    /// silent overwrite.
    pub fn put(&self, hash: &[u8; 32], bytes: &[u8]) -> Result<()> {
        let actual = hash_bytes(bytes);
        if &actual != hash {
            return Err(SyncError::Invariant(format!(
                "blockstore put: hash mismatch, expected {}, got {}",
                hex(hash),
                hex(&actual)
            )));
        }
        let p = self.path_for(hash);
        if p.exists() {
            return Ok(());
        }
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent.display().to_string(), e))?;
        }
        let tmp = p.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| SyncError::io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, &p).map_err(|e| SyncError::io(p.display().to_string(), e))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let data = b"hello world".to_vec();
        let h = hash_bytes(&data);
        store.put(&h, &data).unwrap();
        assert!(store.has(&h));
        assert_eq!(store.get(&h).unwrap(), data);
    }

    #[test]
    fn put_rejects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let data = b"hello world".to_vec();
        let wrong = [0u8; 32];
        assert!(store.put(&wrong, &data).is_err());
    }

    #[test]
    fn put_is_idempotent_for_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let data = b"abc".to_vec();
        let h = hash_bytes(&data);
        store.put(&h, &data).unwrap();
        store.put(&h, &data).unwrap();
        assert_eq!(store.get(&h).unwrap(), data);
    }

    #[test]
    fn has_many_reports_presence_per_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let present = b"present".to_vec();
        let ph = hash_bytes(&present);
        store.put(&ph, &present).unwrap();
        let missing = [7u8; 32];
        let result = store.has_many(&[ph, missing]);
        assert_eq!(result[&ph], true);
        assert_eq!(result[&missing], false);
    }
}
