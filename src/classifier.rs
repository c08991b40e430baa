//! Classifies disappeared/appeared paths into {deleted, created, renamed}
//! and migrates vector clocks across renames (spec §4.7).

use crate::state::{FileState, SnapshotEntry};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct ClassifyResult {
    pub renamed: HashMap<String, String>,
    pub locally_deleted: HashSet<String>,
}

/// `exists_on_disk` re-checks paths the walker may have raced with (spec
/// step 1). First-run behavior: when `last_known_paths` is empty, neither
/// deletion nor rename detection runs — every current file is new.
pub fn classify(
    root: &Path,
    current_states: &HashMap<String, FileState>,
    last_known_paths: &HashSet<String>,
    last_known_metadata: &HashMap<String, SnapshotEntry>,
    exists_on_disk: impl Fn(&Path) -> bool,
) -> ClassifyResult {
    if last_known_paths.is_empty() {
        return ClassifyResult::default();
    }

    let current_paths: HashSet<String> = current_states.keys().cloned().collect();

    let disappeared: HashSet<String> = last_known_paths
        .iter()
        .filter(|p| !current_paths.contains(*p) && !exists_on_disk(&root.join(p)))
        .cloned()
        .collect();

    let mut appeared: Vec<String> = current_paths.iter().filter(|p| !last_known_paths.contains(*p)).cloned().collect();
    appeared.sort();

    let mut renamed = HashMap::new();
    let mut matched_appeared: HashSet<String> = HashSet::new();

    let mut disappeared_sorted: Vec<String> = disappeared.iter().cloned().collect();
    disappeared_sorted.sort();

    for old in &disappeared_sorted {
        let Some(old_meta) = last_known_metadata.get(old) else { continue };
        let candidate = appeared.iter().find(|q| {
            !matched_appeared.contains(*q)
                && current_states.get(*q).and_then(|s| s.content_hash()) == Some(old_meta.hash)
        });
        if let Some(new_path) = candidate.cloned() {
            matched_appeared.insert(new_path.clone());
            renamed.insert(old.clone(), new_path);
        }
    }

    let locally_deleted: HashSet<String> = disappeared_sorted.into_iter().filter(|p| !renamed.contains_key(p)).collect();

    ClassifyResult { renamed, locally_deleted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileMetadata;
    use crate::vclock::VectorClock;
    use chrono::Utc;

    fn exists_meta(hash: u8) -> FileState {
        FileState::Exists(FileMetadata { content_hash: [hash; 32], mtime: Utc::now(), vector_clock: VectorClock::new(), size: 10 })
    }

    fn snap(hash: u8) -> SnapshotEntry {
        SnapshotEntry { hash: [hash; 32], mtime: Utc::now(), vector_clock: VectorClock::new(), size: 10 }
    }

    #[test]
    fn first_run_produces_no_deletions_or_renames() {
        let dir = tempfile::tempdir().unwrap();
        let mut current = HashMap::new();
        current.insert("a.txt".to_string(), exists_meta(1));
        let result = classify(dir.path(), &current, &HashSet::new(), &HashMap::new(), |_| false);
        assert!(result.renamed.is_empty());
        assert!(result.locally_deleted.is_empty());
    }

    #[test]
    fn detects_rename_by_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut current = HashMap::new();
        current.insert("bar.bin".to_string(), exists_meta(7));

        let mut last_paths = HashSet::new();
        last_paths.insert("foo.bin".to_string());

        let mut last_meta = HashMap::new();
        last_meta.insert("foo.bin".to_string(), snap(7));

        let result = classify(dir.path(), &current, &last_paths, &last_meta, |_| false);
        assert_eq!(result.renamed.get("foo.bin"), Some(&"bar.bin".to_string()));
        assert!(result.locally_deleted.is_empty());
    }

    #[test]
    fn disappeared_without_hash_match_is_a_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let current = HashMap::new();

        let mut last_paths = HashSet::new();
        last_paths.insert("gone.txt".to_string());
        let mut last_meta = HashMap::new();
        last_meta.insert("gone.txt".to_string(), snap(3));

        let result = classify(dir.path(), &current, &last_paths, &last_meta, |_| false);
        assert!(result.renamed.is_empty());
        assert!(result.locally_deleted.contains("gone.txt"));
    }

    #[test]
    fn path_still_on_disk_is_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("raced.txt"), b"x").unwrap();
        let current = HashMap::new(); // walker hasn't picked it up yet this round

        let mut last_paths = HashSet::new();
        last_paths.insert("raced.txt".to_string());
        let mut last_meta = HashMap::new();
        last_meta.insert("raced.txt".to_string(), snap(3));

        let result = classify(dir.path(), &current, &last_paths, &last_meta, |p| p.exists());
        assert!(result.locally_deleted.is_empty());
        assert!(result.renamed.is_empty());
    }
}
