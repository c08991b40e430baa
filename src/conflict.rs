//! Conflict artifact naming (spec §4.9).
//!
//! For `dir/name.ext`, the materialized conflict file at the keeping side is
//! `dir/name.conflict.<first-8-chars-of-peer-id>.<remote_mtime_unix_seconds>.ext`
//! (or no suffix if the original has no extension). Conflict files are
//! always excluded from subsequent reconciliation rounds.

const MARKER: &str = ".conflict.";

pub fn conflict_path(rel_path: &str, peer_id: &str, remote_mtime_unix: i64) -> String {
    let peer_short: String = peer_id.chars().take(8).collect();
    let (dir, filename) = match rel_path.rsplit_once('/') {
        Some((d, f)) => (format!("{d}/"), f),
        None => (String::new(), rel_path),
    };
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{dir}{stem}{MARKER}{peer_short}.{remote_mtime_unix}.{ext}")
        }
        _ => format!("{dir}{filename}{MARKER}{peer_short}.{remote_mtime_unix}"),
    }
}

/// Predicate used to exclude conflict artifacts from reconciliation.
pub fn is_conflict_path(rel_path: &str) -> bool {
    let filename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    filename.contains(MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_conflict_with_extension() {
        let p = conflict_path("dir/name.ext", "peeridlong1234", 1_700_000_000);
        assert_eq!(p, "dir/name.conflict.peeridlo.1700000000.ext");
        assert!(is_conflict_path(&p));
    }

    #[test]
    fn names_conflict_without_extension() {
        let p = conflict_path("noext", "abcdefgh1234", 42);
        assert_eq!(p, "noext.conflict.abcdefgh.42");
        assert!(is_conflict_path(&p));
    }

    #[test]
    fn non_conflict_paths_are_not_flagged() {
        assert!(!is_conflict_path("dir/name.ext"));
    }
}
