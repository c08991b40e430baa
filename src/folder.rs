//! Folder and peer identity types (spec §3 "Entities").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderMode {
    TwoWay,
    UploadOnly,
    DownloadOnly,
}

/// Identity = UUID; the core treats a folder's configuration as immutable
/// once constructed (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: uuid::Uuid,
    pub root: std::path::PathBuf,
    pub sync_id: String,
    pub mode: FolderMode,
    pub ignore_patterns: Vec<String>,
}

impl Folder {
    pub fn new(root: impl Into<std::path::PathBuf>, sync_id: impl Into<String>, mode: FolderMode) -> Self {
        Self { id: uuid::Uuid::new_v4(), root: root.into(), sync_id: sync_id.into(), mode, ignore_patterns: Vec::new() }
    }

    /// Sync identifiers are short alphanumeric tokens shared across devices
    /// intending to mirror the same folder (spec §3, GLOSSARY). Validity
    /// requires at least 4 alphanumeric characters.
    pub fn is_valid_sync_id(sync_id: &str) -> bool {
        sync_id.len() >= 4 && sync_id.chars().all(|c| c.is_ascii_alphanumeric())
    }

    pub fn allows_upload(&self) -> bool {
        matches!(self.mode, FolderMode::TwoWay | FolderMode::UploadOnly)
    }

    pub fn allows_download(&self) -> bool {
        matches!(self.mode, FolderMode::TwoWay | FolderMode::DownloadOnly)
    }
}

/// Opaque printable identifier; equality is string equality (spec §3).
pub type PeerId = String;

/// Read-only to the core — owned and updated by the (external) discovery
/// layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub network_addresses: Vec<String>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub announced_sync_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_id_validation() {
        assert!(Folder::is_valid_sync_id("ab12"));
        assert!(!Folder::is_valid_sync_id("ab1"));
        assert!(!Folder::is_valid_sync_id("ab-2"));
    }

    #[test]
    fn upload_only_never_downloads() {
        let f = Folder::new("/tmp/x", "ab12", FolderMode::UploadOnly);
        assert!(f.allows_upload());
        assert!(!f.allows_download());
    }
}
