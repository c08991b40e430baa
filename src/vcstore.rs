//! Persisted per-path vector clocks, keyed `(sync_id, path)` (spec §6
//! "Persisted state layout"). Modeled on the teacher's `resume.rs` JSON
//! store, one file per sync id rather than one global file, so rename
//! migration (moving a key from the old path to the new) is a simple
//! remove+insert under a single lock.

use crate::error::Result;
use crate::vclock::VectorClock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct VcStoreFile {
    clocks: HashMap<String, VectorClock>,
}

#[derive(Debug)]
pub struct VcStore {
    path: PathBuf,
    data: VcStoreFile,
}

impl VcStore {
    pub fn path_for(state_dir: &Path, sync_id: &str) -> PathBuf {
        state_dir.join("sync").join(sync_id).join("vclocks.json")
    }

    pub fn load(state_dir: &Path, sync_id: &str) -> Result<Self> {
        let path = Self::path_for(state_dir, sync_id);
        let data = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| crate::error::SyncError::io(path.display().to_string(), e))?;
            serde_json::from_slice(&bytes)?
        } else {
            VcStoreFile::default()
        };
        Ok(Self { path, data })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::SyncError::io(parent.display().to_string(), e))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| crate::error::SyncError::io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| crate::error::SyncError::io(self.path.display().to_string(), e))?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> VectorClock {
        self.data.clocks.get(path).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, path: impl Into<String>, vc: VectorClock) {
        self.data.clocks.insert(path.into(), vc);
    }

    pub fn remove(&mut self, path: &str) -> Option<VectorClock> {
        self.data.clocks.remove(path)
    }

    /// Migrate a persisted vector clock from `old` to `new`, as required
    /// when `LocalChangeClassifier` detects a rename (spec §4.7 step 5,
    /// testable property 5).
    pub fn migrate(&mut self, old: &str, new: &str) {
        if let Some(vc) = self.data.clocks.remove(old) {
            self.data.clocks.insert(new.to_string(), vc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_moves_the_clock_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VcStore::load(dir.path(), "ab12").unwrap();
        store.set("foo.bin", VectorClock::new().increment("pa"));
        store.migrate("foo.bin", "bar.bin");
        assert!(store.get("foo.bin").is_empty());
        assert_eq!(store.get("bar.bin").get("pa"), 1);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VcStore::load(dir.path(), "ab12").unwrap();
        store.set("a.txt", VectorClock::new().increment("pa"));
        store.save().unwrap();
        let reloaded = VcStore::load(dir.path(), "ab12").unwrap();
        assert_eq!(reloaded.get("a.txt").get("pa"), 1);
    }
}
