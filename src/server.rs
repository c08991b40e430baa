//! `RequestHandler`: serves incoming `SyncRequest`s against a folder's
//! persisted state (spec §4.6 collaborator iv, §6).
//!
//! The QUIC accept loop below is the teacher's `run_server`/
//! `handle_connection_server` shape (`net.rs`), generalized from the old
//! per-message `Msg` control flow to a stateless-per-request dispatch over
//! the new `SyncRequest`/`SyncResponse` wire types.

use crate::blockstore::BlockStore;
use crate::chunker;
use crate::config::Config;
use crate::conflict;
use crate::error::SyncError;
use crate::folder::{Folder, FolderMode};
use crate::ignore::IgnoreSet;
use crate::protocol::{self, LegacyFileMetadata, SyncRequest, SyncResponse};
use crate::state::{DeletionRecord, FileMetadata, FileState, FileStateStore};
use crate::vclock::VectorClock;
use crate::vcstore::VcStore;
use chrono::Utc;
use quinn::{Endpoint, RecvStream, SendStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Per-folder runtime the server dispatches requests against.
pub struct FolderRuntime {
    pub folder: Folder,
    pub state_dir: PathBuf,
    pub state: Mutex<FileStateStore>,
    pub vclocks: Mutex<VcStore>,
    pub blockstore: BlockStore,
    pub ignores: IgnoreSet,
}

impl FolderRuntime {
    pub fn open(folder: Folder, state_dir: PathBuf) -> crate::error::Result<Self> {
        let state_path = state_dir.join("sync").join(&folder.sync_id).join("state.json");
        let state = FileStateStore::load(&state_path)?;
        let vclocks = VcStore::load(&state_dir, &folder.sync_id)?;
        let blockstore = BlockStore::open(state_dir.join("blocks"))?;
        let ignores = IgnoreSet::load(&folder.root);
        Ok(Self { folder, state_dir, state: Mutex::new(state), vclocks: Mutex::new(vclocks), blockstore, ignores })
    }

    pub(crate) fn state_path(&self) -> PathBuf {
        self.state_dir.join("sync").join(&self.folder.sync_id).join("state.json")
    }

    /// Also used by `coordinator`, which shares this runtime's state/vclock
    /// stores rather than keeping its own copies.
    pub(crate) async fn persist_state(&self) -> crate::error::Result<()> {
        self.state.lock().await.save(&self.state_path())
    }

    pub(crate) async fn persist_vclocks(&self) -> crate::error::Result<()> {
        self.vclocks.lock().await.save()
    }
}

/// Tracks paths this peer just wrote because a sync request told it to, so
/// `WatcherBridge` can suppress the filesystem event it would otherwise
/// raise for its own write (spec §4.11 "sync-write cooldown"). A plain
/// `std::sync::Mutex`, not `tokio::sync::Mutex`: `WatcherBridge` reads it
/// from inside `notify`'s synchronous callback, the same way the teacher's
/// `watch.rs` keeps its own debounce state in a plain `std::sync::Mutex`.
#[derive(Default)]
pub struct WriteCooldownTracker {
    last_write: std::sync::Mutex<HashMap<(String, String), chrono::DateTime<Utc>>>,
}

impl WriteCooldownTracker {
    pub fn mark(&self, sync_id: &str, path: &str) {
        self.last_write.lock().unwrap().insert((sync_id.to_string(), path.to_string()), Utc::now());
    }

    pub fn is_recent(&self, sync_id: &str, path: &str, cooldown: chrono::Duration) -> bool {
        match self.last_write.lock().unwrap().get(&(sync_id.to_string(), path.to_string())) {
            Some(t) => Utc::now() - *t < cooldown,
            None => false,
        }
    }
}

pub struct ServerState {
    pub my_peer_id: String,
    pub folders: Mutex<HashMap<String, Arc<FolderRuntime>>>,
    pub cooldown: Arc<WriteCooldownTracker>,
    pub config: Config,
}

impl ServerState {
    async fn folder(&self, sync_id: &str) -> Option<Arc<FolderRuntime>> {
        self.folders.lock().await.get(sync_id).cloned()
    }
}

/// Dispatches a single request to a response. No I/O beyond the folder's
/// own state/blockstore/filesystem — callers own framing and transport.
pub async fn handle_request(state: &ServerState, req: SyncRequest) -> SyncResponse {
    match dispatch(state, req).await {
        Ok(resp) => resp,
        Err(SyncError::PeerAbsent(sync_id)) => SyncResponse::FolderNotFound { sync_id },
        Err(e) => SyncResponse::Error { text: e.to_string() },
    }
}

async fn dispatch(state: &ServerState, req: SyncRequest) -> crate::error::Result<SyncResponse> {
    match req {
        SyncRequest::GetMST { sync_id } => {
            let rt = require_folder(state, &sync_id).await?;
            let vclocks_snapshot: HashMap<String, VectorClock> = {
                let guard = rt.vclocks.lock().await;
                // VcStore has no iterator; the scan only needs the handful of
                // paths it actually visits, so looking each one up against a
                // cloned store read once up front avoids holding the lock
                // across the (blocking) filesystem walk.
                let store = rt.state.lock().await;
                store.iter().map(|(p, _)| (p.clone(), guard.get(p))).collect()
            };
            let scan = crate::detector::compute_full_state(
                &rt.folder.root,
                &rt.ignores,
                |p| vclocks_snapshot.get(p).cloned().unwrap_or_default(),
                Utc::now(),
                chrono::Duration::seconds(state.config.write_stability_delay_secs as i64),
                state.config.walk_yield_every,
            )
            .await?;
            Ok(SyncResponse::MstRoot { sync_id, digest: scan.summary.root() })
        }

        SyncRequest::GetFiles { sync_id } => {
            let rt = require_folder(state, &sync_id).await?;
            let store = rt.state.lock().await;
            let files: HashMap<String, FileState> = store.iter().map(|(p, s)| (p.clone(), s.clone())).collect();
            Ok(SyncResponse::FilesV2 { sync_id, files })
        }

        SyncRequest::GetFileData { sync_id, relative_path } => {
            let rt = require_folder(state, &sync_id).await?;
            let abs = rt.folder.root.join(&relative_path);
            let bytes = tokio::fs::read(&abs).await.map_err(|e| SyncError::io(abs.display().to_string(), e))?;
            Ok(SyncResponse::FileData { sync_id, path: relative_path, bytes })
        }

        SyncRequest::PutFileData { sync_id, relative_path, bytes, vector_clock } => {
            let rt = require_folder(state, &sync_id).await?;
            if !rt.folder.allows_download() {
                return Err(SyncError::Protocol(format!("folder {sync_id} is upload-only")));
            }
            put_file_bytes(state, &rt, &relative_path, &bytes, vector_clock).await?;
            Ok(SyncResponse::PutAck { sync_id, path: relative_path })
        }

        SyncRequest::DeleteFiles { sync_id, deletions } => {
            let rt = require_folder(state, &sync_id).await?;
            if !rt.folder.allows_download() {
                return Err(SyncError::Protocol(format!("folder {sync_id} is upload-only")));
            }
            for (path, vc) in deletions {
                apply_deletion(state, &rt, &path, vc).await?;
            }
            Ok(SyncResponse::DeleteAck { sync_id })
        }

        SyncRequest::GetFileChunks { sync_id, relative_path } => {
            let rt = require_folder(state, &sync_id).await?;
            let abs = rt.folder.root.join(&relative_path);
            let chunks = chunker::chunk_file(&abs, state.config.chunk_min_size, state.config.chunk_avg_size, state.config.chunk_max_size)?;
            let chunk_hashes: Vec<[u8; 32]> = chunks.iter().map(|c| c.hash).collect();
            for c in &chunks {
                rt.blockstore.put(&c.hash, &c.bytes)?;
            }
            Ok(SyncResponse::FileChunks { sync_id, path: relative_path, chunk_hashes })
        }

        SyncRequest::GetChunkData { sync_id, chunk_hash } => {
            let rt = require_folder(state, &sync_id).await?;
            let bytes = rt.blockstore.get(&chunk_hash)?;
            Ok(SyncResponse::ChunkData { sync_id, chunk_hash, bytes })
        }

        SyncRequest::PutFileChunks { sync_id, relative_path, chunk_hashes, vector_clock } => {
            let rt = require_folder(state, &sync_id).await?;
            if !rt.folder.allows_download() {
                return Err(SyncError::Protocol(format!("folder {sync_id} is upload-only")));
            }
            let missing: Vec<[u8; 32]> = chunk_hashes.iter().copied().filter(|h| !rt.blockstore.has(h)).collect();
            if !missing.is_empty() {
                return Ok(SyncResponse::FileChunks { sync_id, path: relative_path, chunk_hashes: missing });
            }
            let mut data = Vec::new();
            for h in &chunk_hashes {
                data.extend_from_slice(&rt.blockstore.get(h)?);
            }
            put_file_bytes(state, &rt, &relative_path, &data, vector_clock).await?;
            Ok(SyncResponse::FileChunksAck { sync_id, path: relative_path })
        }

        SyncRequest::PutChunkData { sync_id, chunk_hash, bytes } => {
            let rt = require_folder(state, &sync_id).await?;
            rt.blockstore.put(&chunk_hash, &bytes)?;
            Ok(SyncResponse::ChunkAck { sync_id, chunk_hash })
        }
    }
}

async fn require_folder(state: &ServerState, sync_id: &str) -> crate::error::Result<Arc<FolderRuntime>> {
    state.folder(sync_id).await.ok_or_else(|| SyncError::PeerAbsent(sync_id.to_string()))
}

/// Conflict artifacts are plain writes: no state-store entry, no vector
/// clock merge, just bytes landing at a `.conflict.`-marked path (spec
/// §4.9). Everything else merges the incoming clock and records `Exists`.
async fn put_file_bytes(
    state: &ServerState,
    rt: &FolderRuntime,
    relative_path: &str,
    bytes: &[u8],
    vector_clock: Option<VectorClock>,
) -> crate::error::Result<()> {
    let abs = rt.folder.root.join(relative_path);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent.display().to_string(), e))?;
    }
    let mut tmp_name = abs.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".part");
    let tmp = abs.with_file_name(tmp_name);
    tokio::fs::write(&tmp, bytes).await.map_err(|e| SyncError::io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, &abs).await.map_err(|e| SyncError::io(abs.display().to_string(), e))?;
    state.cooldown.mark(&rt.folder.sync_id, relative_path);

    if conflict::is_conflict_path(relative_path) {
        return Ok(());
    }

    let hash = chunker::hash_bytes(bytes);
    let mtime = Utc::now();
    let merged = {
        let mut vclocks = rt.vclocks.lock().await;
        let current = vclocks.get(relative_path);
        let incoming = vector_clock.unwrap_or_default();
        let merged = current.merge(&incoming);
        vclocks.set(relative_path, merged.clone());
        merged
    };
    {
        let mut st = rt.state.lock().await;
        st.set_exists(relative_path, FileMetadata { content_hash: hash, mtime, vector_clock: merged, size: bytes.len() as u64 });
    }
    rt.persist_state().await?;
    rt.persist_vclocks().await?;
    Ok(())
}

async fn apply_deletion(state: &ServerState, rt: &FolderRuntime, relative_path: &str, incoming_vc: VectorClock) -> crate::error::Result<()> {
    let abs = rt.folder.root.join(relative_path);
    if abs.exists() {
        tokio::fs::remove_file(&abs).await.map_err(|e| SyncError::io(abs.display().to_string(), e))?;
        state.cooldown.mark(&rt.folder.sync_id, relative_path);
    }
    let merged = {
        let mut vclocks = rt.vclocks.lock().await;
        let current = vclocks.get(relative_path);
        let merged = current.merge(&incoming_vc);
        vclocks.set(relative_path, merged.clone());
        merged
    };
    {
        let mut st = rt.state.lock().await;
        st.set_deleted(relative_path, DeletionRecord { deleted_at: Utc::now(), deleted_by: state.my_peer_id.clone(), vector_clock: merged });
    }
    rt.persist_state().await?;
    rt.persist_vclocks().await?;
    Ok(())
}

/// Legacy response shape (spec §9 open question): same data, encoded
/// without per-tombstone vector clocks, for peers that haven't upgraded.
pub async fn legacy_files_response(state: &ServerState, sync_id: &str) -> crate::error::Result<SyncResponse> {
    let rt = require_folder(state, sync_id).await?;
    let store = rt.state.lock().await;
    let mut files = HashMap::new();
    let mut deleted_paths = Vec::new();
    for (path, s) in store.iter() {
        match s {
            FileState::Exists(m) => {
                files.insert(path.clone(), LegacyFileMetadata { content_hash: m.content_hash, mtime_unix: m.mtime.timestamp() });
            }
            FileState::Deleted(_) => deleted_paths.push(path.clone()),
        }
    }
    Ok(SyncResponse::Files { sync_id: sync_id.to_string(), files, deleted_paths })
}

/// QUIC accept loop (spec §1 collaborator iii), one task per connection,
/// one task per bidirectional stream within it — the teacher's
/// `run_server`/`handle_connection_server` shape, now dispatching through
/// `handle_request` instead of the old `Msg` switch.
pub async fn run_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let (server_config, cert_der) = crate::identity::make_server_config()?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let endpoint = Endpoint::server(server_config, addr)?;
    info!(fingerprint = %crate::trust::sha256_hex(&cert_der), %addr, "listening");

    while let Some(connecting) = endpoint.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, connecting).await {
                warn!("connection error: {e:?}");
            }
        });
    }
    Ok(())
}

async fn handle_connection(state: Arc<ServerState>, connecting: quinn::Connecting) -> anyhow::Result<()> {
    let connection = connecting.await?;
    info!(peer = %connection.remote_address(), "peer connected");
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(state, send, recv).await {
                        error!("stream error: {e:?}");
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed { .. }) | Err(quinn::ConnectionError::LocallyClosed) => break,
            Err(e) => {
                warn!("accept_bi error: {e:?}");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stream(state: Arc<ServerState>, mut send: SendStream, mut recv: RecvStream) -> anyhow::Result<()> {
    while let Some(req) = protocol::recv_request(&mut recv).await? {
        let resp = handle_request(&state, req).await;
        protocol::send_response(&mut send, &resp).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::FolderMode as FM;

    fn state_for(dir: &std::path::Path, root: &std::path::Path) -> ServerState {
        let folder = Folder::new(root, "ab12", FM::TwoWay);
        let rt = FolderRuntime::open(folder, dir.to_path_buf()).unwrap();
        let mut folders = HashMap::new();
        folders.insert("ab12".to_string(), Arc::new(rt));
        ServerState { my_peer_id: "pserver".into(), folders: Mutex::new(folders), cooldown: Arc::new(WriteCooldownTracker::default()), config: Config::default() }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_bytes_and_state() {
        let state_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let state = state_for(state_dir.path(), root.path());

        let resp = handle_request(&state, SyncRequest::PutFileData { sync_id: "ab12".into(), relative_path: "a.txt".into(), bytes: b"hello".to_vec(), vector_clock: None }).await;
        assert!(matches!(resp, SyncResponse::PutAck { .. }));

        let resp = handle_request(&state, SyncRequest::GetFileData { sync_id: "ab12".into(), relative_path: "a.txt".into() }).await;
        match resp {
            SyncResponse::FileData { bytes, .. } => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected {other:?}"),
        }

        let resp = handle_request(&state, SyncRequest::GetFiles { sync_id: "ab12".into() }).await;
        match resp {
            SyncResponse::FilesV2 { files, .. } => assert!(matches!(files.get("a.txt"), Some(FileState::Exists(_)))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_files_removes_and_tombstones() {
        let state_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let state = state_for(state_dir.path(), root.path());
        handle_request(&state, SyncRequest::PutFileData { sync_id: "ab12".into(), relative_path: "a.txt".into(), bytes: b"x".to_vec(), vector_clock: None }).await;

        let mut deletions = HashMap::new();
        deletions.insert("a.txt".to_string(), VectorClock::new().increment("pa"));
        let resp = handle_request(&state, SyncRequest::DeleteFiles { sync_id: "ab12".into(), deletions }).await;
        assert!(matches!(resp, SyncResponse::DeleteAck { .. }));
        assert!(!root.path().join("a.txt").exists());

        let resp = handle_request(&state, SyncRequest::GetFiles { sync_id: "ab12".into() }).await;
        match resp {
            SyncResponse::FilesV2 { files, .. } => assert!(matches!(files.get("a.txt"), Some(FileState::Deleted(_)))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_only_folder_rejects_incoming_put() {
        let state_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let folder = Folder::new(root.path(), "ab12", FolderMode::UploadOnly);
        let rt = FolderRuntime::open(folder, state_dir.path().to_path_buf()).unwrap();
        let mut folders = HashMap::new();
        folders.insert("ab12".to_string(), Arc::new(rt));
        let state = ServerState { my_peer_id: "pserver".into(), folders: Mutex::new(folders), cooldown: Arc::new(WriteCooldownTracker::default()), config: Config::default() };

        let resp = handle_request(&state, SyncRequest::PutFileData { sync_id: "ab12".into(), relative_path: "a.txt".into(), bytes: b"x".to_vec(), vector_clock: None }).await;
        assert!(matches!(resp, SyncResponse::Error { .. }));
    }

    #[tokio::test]
    async fn conflict_artifact_write_does_not_touch_state_store() {
        let state_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let state = state_for(state_dir.path(), root.path());
        let artifact = conflict::conflict_path("a.txt", "peerb", 1234);
        handle_request(&state, SyncRequest::PutFileData { sync_id: "ab12".into(), relative_path: artifact.clone(), bytes: b"conflicting".to_vec(), vector_clock: None }).await;

        assert!(root.path().join(&artifact).exists());
        let resp = handle_request(&state, SyncRequest::GetFiles { sync_id: "ab12".into() }).await;
        match resp {
            SyncResponse::FilesV2 { files, .. } => assert!(!files.contains_key(&artifact)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
