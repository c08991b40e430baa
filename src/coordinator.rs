//! Orchestrates one reconciliation run against one peer for one folder:
//! local rescan, discovery, planning, execution, finalization (spec §4.11).
//!
//! Grounded on the teacher's `net.rs::run_client_filtered` phase sequence,
//! reorganized into the explicit phase machine spec §4.11/§5 describe.

use crate::classifier;
use crate::config::Config;
use crate::decision::{self, Action, ConflictKind};
use crate::detector;
use crate::error::{Result, SyncError};
use crate::folder::{Folder, PeerInfo};
use crate::merkle::MerkleSummary;
use crate::ports::{Clock, RpcClient};
use crate::protocol::{SyncRequest, SyncResponse};
use crate::server::{FolderRuntime, WriteCooldownTracker};
use crate::state::{DeletionRecord, FileMetadata, FileState, FolderSnapshot, SnapshotEntry};
use crate::transfer::{self, ExecutionContext, Op, Plan, SyncedFileInfo};
use crate::vclock::VectorClock;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    Synced { files_changed: usize },
    Skipped(String),
    /// The peer answered but has no folder registered for this sync_id.
    /// Not a failure (spec §4.11, §7) — callers should drop this peer from
    /// the folder's known set rather than retry or log it as an error.
    PeerAbsent,
    Failed(String),
}

/// Runs reconciliation for a single `Folder` against whichever peers
/// `run_once` is called with. Shares its `FolderRuntime` with the
/// `RequestHandler` so both sides of a sync see one persisted state.
pub struct SyncCoordinator {
    folder: Folder,
    my_peer_id: String,
    state_dir: PathBuf,
    runtime: Arc<FolderRuntime>,
    cooldown: Arc<WriteCooldownTracker>,
    config: Config,
    clock: Arc<dyn Clock>,
    rpc: Arc<dyn RpcClient>,
    /// Dedups concurrent runs against the *same* peer; runs against
    /// different peers for this folder proceed in parallel (spec §5).
    running: Mutex<HashSet<String>>,
    last_synced: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SyncCoordinator {
    pub fn new(
        folder: Folder,
        my_peer_id: String,
        state_dir: PathBuf,
        runtime: Arc<FolderRuntime>,
        cooldown: Arc<WriteCooldownTracker>,
        config: Config,
        clock: Arc<dyn Clock>,
        rpc: Arc<dyn RpcClient>,
    ) -> Self {
        Self {
            folder,
            my_peer_id,
            state_dir,
            runtime,
            cooldown,
            config,
            clock,
            rpc,
            running: Mutex::new(HashSet::new()),
            last_synced: Mutex::new(HashMap::new()),
        }
    }

    /// Gates, then runs, one sync attempt against `peer`. Never panics or
    /// propagates errors — failures become `SyncOutcome::Failed` so a
    /// calling scheduler can log and move to the next peer.
    pub async fn run_once(&self, peer: &PeerInfo) -> SyncOutcome {
        if !peer.announced_sync_ids.iter().any(|s| s == &self.folder.sync_id) {
            return SyncOutcome::Skipped("peer does not announce this sync_id".into());
        }

        let now = self.clock.now();
        let online_window = chrono::Duration::from_std(self.config.online_window()).unwrap_or(chrono::Duration::zero());
        if now.signed_duration_since(peer.last_seen_at) > online_window {
            return SyncOutcome::Skipped("peer not seen within online window".into());
        }

        let cooldown = chrono::Duration::from_std(self.config.peer_sync_cooldown()).unwrap_or(chrono::Duration::zero());
        if let Some(last) = self.last_synced.lock().await.get(&peer.peer_id) {
            if now.signed_duration_since(*last) < cooldown {
                return SyncOutcome::Skipped("peer sync cooldown still active".into());
            }
        }

        {
            let mut running = self.running.lock().await;
            if running.contains(&peer.peer_id) {
                return SyncOutcome::Skipped("sync already in progress with this peer".into());
            }
            running.insert(peer.peer_id.clone());
        }

        crate::status::set_active(&self.folder.sync_id, &peer.peer_id, true).await;
        let outcome = match self.run_inner(peer, now).await {
            Ok(outcome) => outcome,
            Err(SyncError::PeerAbsent(_)) => {
                info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "peer has no folder for this sync_id; dropping it for this round");
                SyncOutcome::PeerAbsent
            }
            Err(e) => {
                warn!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "sync failed: {e}");
                SyncOutcome::Failed(e.to_string())
            }
        };
        let (ok, msg) = match &outcome {
            SyncOutcome::UpToDate => (true, "up_to_date".to_string()),
            SyncOutcome::Synced { files_changed } => (true, format!("synced {files_changed} files")),
            SyncOutcome::Skipped(reason) => (true, reason.clone()),
            SyncOutcome::PeerAbsent => (true, "peer absent for this sync_id".to_string()),
            SyncOutcome::Failed(reason) => (false, reason.clone()),
        };
        crate::status::session_done(&self.folder.sync_id, &peer.peer_id, ok, &msg).await;

        self.running.lock().await.remove(&peer.peer_id);
        outcome
    }

    fn pick_address<'a>(&self, peer: &'a PeerInfo) -> Result<&'a str> {
        peer.network_addresses.first().map(|s| s.as_str()).ok_or_else(|| SyncError::PeerAbsent(peer.peer_id.clone()))
    }

    async fn run_inner(&self, peer: &PeerInfo, now: DateTime<Utc>) -> Result<SyncOutcome> {
        let addr = self.pick_address(peer)?.to_string();

        info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "phase: local state");
        let local_states = self.local_rescan(now).await?;
        self.log_phase(peer, "local_state", format!("{} paths", local_states.len())).await;

        info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "phase: discovery");
        let local_summary = MerkleSummary::from_pairs(local_states.iter().filter_map(|(p, s)| s.content_hash().map(|h| (p.clone(), h))));
        let remote_digest = self.summary_digest(&addr).await?;
        if remote_digest == local_summary.root() {
            self.log_phase(peer, "discovery", "roots match, nothing to reconcile").await;
            self.finalize(peer, now).await?;
            return Ok(SyncOutcome::UpToDate);
        }
        let remote_states = self.fetch_remote_files(&addr, now).await?;
        self.log_phase(peer, "discovery", format!("{} remote paths", remote_states.len())).await;

        info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "phase: planning");
        let plan = self.plan(&local_states, &remote_states).await?;
        self.log_phase(peer, "planning", format!("{:?}", plan)).await;

        if plan.is_empty() {
            self.finalize(peer, now).await?;
            return Ok(SyncOutcome::UpToDate);
        }

        info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "phase: execution");
        let ctx = ExecutionContext {
            root: &self.folder.root,
            my_peer_id: &self.my_peer_id,
            peer_id: &peer.peer_id,
            peer_addr: &addr,
            sync_id: &self.folder.sync_id,
            blockstore: self.runtime.blockstore.clone(),
            config: &self.config,
            local_states: &local_states,
            remote_states: &remote_states,
            rpc: self.rpc.clone(),
        };
        let results = transfer::execute_plan(&ctx, &plan).await;
        self.commit_results(&results, &remote_states).await?;
        self.log_phase(peer, "execution", format!("{} ops applied", results.len())).await;

        let changed = results.len();
        self.finalize(peer, now).await?;
        Ok(SyncOutcome::Synced { files_changed: changed })
    }

    /// Walks the folder, classifies disappeared/appeared paths against the
    /// last snapshot, migrates vector clocks across detected renames, then
    /// overlays the (now-migrated) persisted vector clock onto each current
    /// path — incrementing it only for paths whose content actually changed
    /// since the prior snapshot (spec §4.7 steps 1-5, §4.4 step "own clock
    /// entry bumps on local change").
    async fn local_rescan(&self, now: DateTime<Utc>) -> Result<HashMap<String, FileState>> {
        let snapshot = FolderSnapshot::load(&self.state_dir, &self.folder.sync_id)?;
        let last_known_paths: HashSet<String> = snapshot.as_ref().map(|s| s.files.keys().cloned().collect()).unwrap_or_default();
        let last_known_metadata: HashMap<String, SnapshotEntry> = snapshot.as_ref().map(|s| s.files.clone()).unwrap_or_default();

        let scan = detector::compute_full_state(
            &self.folder.root,
            &self.runtime.ignores,
            |_| VectorClock::new(),
            now,
            chrono::Duration::from_std(self.config.write_stability_delay()).unwrap_or(chrono::Duration::zero()),
            self.config.walk_yield_every,
        )
        .await?;

        let classify_result = classifier::classify(&self.folder.root, &scan.states, &last_known_paths, &last_known_metadata, |p| p.exists());

        // The old path's pre-rename clock carries the file's full causal
        // history; capture it before `migrate` moves that history onto the
        // new path, then increment it once for the deletion event so the
        // old path tombstones the same way a plain local deletion would
        // (spec §4.7 step 5, spec.md:163 — the old name must not survive).
        let mut rename_tombstones: HashMap<String, VectorClock> = HashMap::with_capacity(classify_result.renamed.len());
        {
            let mut vclocks = self.runtime.vclocks.lock().await;
            for (old, new) in &classify_result.renamed {
                let vc_before = vclocks.get(old);
                vclocks.migrate(old, new);
                rename_tombstones.insert(old.clone(), vc_before.increment(&self.my_peer_id));
            }
        }

        let renamed_new_to_old: HashMap<String, String> = classify_result.renamed.iter().map(|(o, n)| (n.clone(), o.clone())).collect();

        let mut states = HashMap::with_capacity(scan.states.len());
        {
            let mut vclocks = self.runtime.vclocks.lock().await;
            let prior_store = self.runtime.state.lock().await;
            for (path, file_state) in scan.states {
                let mut meta = match file_state {
                    FileState::Exists(m) => m,
                    FileState::Deleted(_) => continue, // detector only ever emits Exists
                };
                let persisted_vc = vclocks.get(&path);
                let prior_path = renamed_new_to_old.get(&path).unwrap_or(&path);
                let prior = prior_store.get(prior_path);
                let unchanged = matches!(prior, Some(FileState::Exists(p)) if p.content_hash == meta.content_hash);
                let vc = if unchanged { persisted_vc } else { persisted_vc.increment(&self.my_peer_id) };
                vclocks.set(path.clone(), vc.clone());
                meta.vector_clock = vc;
                states.insert(path, FileState::Exists(meta));
            }
        }

        {
            let mut vclocks = self.runtime.vclocks.lock().await;
            let mut store = self.runtime.state.lock().await;
            for path in &classify_result.locally_deleted {
                let vc = vclocks.get(path).increment(&self.my_peer_id);
                vclocks.set(path.clone(), vc.clone());
                store.set_deleted(path.clone(), DeletionRecord { deleted_at: now, deleted_by: self.my_peer_id.clone(), vector_clock: vc });
            }
            // The old half of a rename tombstones too, so the decision
            // engine's normal DeleteRemote/DeleteLocal path clears it from
            // whichever side hasn't caught up to the rename yet.
            for (old, vc) in &rename_tombstones {
                vclocks.set(old.clone(), vc.clone());
                store.set_deleted(old.clone(), DeletionRecord { deleted_at: now, deleted_by: self.my_peer_id.clone(), vector_clock: vc.clone() });
            }
        }

        {
            let mut store = self.runtime.state.lock().await;
            for (path, fs) in &states {
                if let FileState::Exists(m) = fs {
                    store.set_exists(path.clone(), m.clone());
                }
            }
        }
        self.runtime.persist_state().await?;
        self.runtime.persist_vclocks().await?;

        let local_states: HashMap<String, FileState> = self.runtime.state.lock().await.iter().map(|(p, s)| (p.clone(), s.clone())).collect();
        Ok(local_states)
    }

    async fn summary_digest(&self, addr: &str) -> Result<Option<[u8; 32]>> {
        let dur = std::time::Duration::from_secs(self.config.request_timeouts.summary_secs);
        let retries = self.config.retry_counts.summary;
        let sync_id = self.folder.sync_id.clone();
        transfer::retrying(retries, || async {
            match tokio::time::timeout(dur, self.rpc.send(addr, SyncRequest::GetMST { sync_id: sync_id.clone() })).await {
                Ok(Ok(SyncResponse::MstRoot { digest, .. })) => Ok(digest),
                Ok(Ok(SyncResponse::FolderNotFound { sync_id })) => Err(SyncError::PeerAbsent(sync_id)),
                Ok(Ok(SyncResponse::Error { text })) => Err(SyncError::Protocol(text)),
                Ok(Ok(_)) => Err(SyncError::Protocol("unexpected response to GetMST".into())),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::Transient("GetMST timed out".into())),
            }
        })
        .await
    }

    /// Always requests the unified listing; accepts the legacy shape too
    /// (spec §9 open question) — a legacy tombstone carries an empty
    /// `VectorClock` and a synthesized `Exists` entry carries `size: 0`,
    /// since `LegacyFileMetadata` has no size field. This crate doesn't try
    /// to improve on that ambiguity, only to make it explicit here and in
    /// the logs.
    async fn fetch_remote_files(&self, addr: &str, now: DateTime<Utc>) -> Result<HashMap<String, FileState>> {
        let dur = std::time::Duration::from_secs(self.config.request_timeouts.listing_secs);
        let retries = self.config.retry_counts.listing;
        let sync_id = self.folder.sync_id.clone();
        transfer::retrying(retries, || async {
            match tokio::time::timeout(dur, self.rpc.send(addr, SyncRequest::GetFiles { sync_id: sync_id.clone() })).await {
                Ok(Ok(SyncResponse::FilesV2 { files, .. })) => Ok(files),
                Ok(Ok(SyncResponse::Files { files, deleted_paths, .. })) => {
                    warn!(peer_addr = addr, "peer answered with legacy Files shape, not FilesV2");
                    let mut out = HashMap::new();
                    for (path, m) in files {
                        let mtime = DateTime::from_timestamp(m.mtime_unix, 0).unwrap_or(now);
                        out.insert(path, FileState::Exists(FileMetadata { content_hash: m.content_hash, mtime, vector_clock: VectorClock::new(), size: 0 }));
                    }
                    for path in deleted_paths {
                        out.insert(path, FileState::Deleted(DeletionRecord { deleted_at: now, deleted_by: "legacy-peer".into(), vector_clock: VectorClock::new() }));
                    }
                    Ok(out)
                }
                Ok(Ok(SyncResponse::FolderNotFound { sync_id })) => Err(SyncError::PeerAbsent(sync_id)),
                Ok(Ok(SyncResponse::Error { text })) => Err(SyncError::Protocol(text)),
                Ok(Ok(_)) => Err(SyncError::Protocol("unexpected response to GetFiles".into())),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::Transient("GetFiles timed out".into())),
            }
        })
        .await
    }

    /// Runs the decision engine over the union of both sides' paths,
    /// classifying `Conflict` into a concrete resolution and applying
    /// `PropagateTombstoneToLocal` immediately in-process (it needs no peer
    /// I/O — the remote's tombstone is already in `remote_states`). Folder
    /// mode then prunes any bucket this folder isn't allowed to act on.
    async fn plan(&self, local_states: &HashMap<String, FileState>, remote_states: &HashMap<String, FileState>) -> Result<Plan> {
        let mut plan = Plan::default();
        let all_paths: HashSet<&String> = local_states.keys().chain(remote_states.keys()).collect();

        for path in all_paths {
            let l = local_states.get(path);
            let r = remote_states.get(path);
            match decision::decide(l, r) {
                Action::Skip => {}
                Action::Download => plan.downloads.push(path.clone()),
                Action::Upload => plan.uploads.push(path.clone()),
                Action::DeleteLocal => plan.delete_local.push(path.clone()),
                Action::DeleteRemote => plan.delete_remote.push(path.clone()),
                Action::PropagateTombstoneToRemote => plan.tombstones_to_remote.push(path.clone()),
                Action::PropagateTombstoneToLocal => {
                    if self.folder.allows_download() {
                        if let Some(FileState::Deleted(t)) = r {
                            let mut vclocks = self.runtime.vclocks.lock().await;
                            let mut store = self.runtime.state.lock().await;
                            vclocks.set(path.clone(), t.vector_clock.clone());
                            store.set_deleted(path.clone(), t.clone());
                        }
                    }
                }
                Action::Uncertain => warn!(path, "decision engine returned Uncertain; leaving untouched this round"),
                Action::Conflict => match decision::classify_conflict(l, r) {
                    Some(ConflictKind::ModifyModify) => {
                        plan.conflict_downloads.push(path.clone());
                        plan.conflict_uploads.push(path.clone());
                    }
                    Some(ConflictKind::DeleteVsModify { local_is_tombstone: true }) => plan.downloads.push(path.clone()),
                    Some(ConflictKind::DeleteVsModify { local_is_tombstone: false }) => plan.uploads.push(path.clone()),
                    None => warn!(path, "Conflict action with no classifiable ConflictKind"),
                },
            }
        }

        if !self.folder.allows_upload() {
            plan.uploads.clear();
            plan.conflict_uploads.clear();
            plan.delete_remote.clear();
            plan.tombstones_to_remote.clear();
        }
        if !self.folder.allows_download() {
            plan.downloads.clear();
            plan.conflict_downloads.clear();
            plan.delete_local.clear();
        }

        self.runtime.persist_state().await?;
        self.runtime.persist_vclocks().await?;
        Ok(plan)
    }

    /// Folds `TransferExecutor` results back into the shared state/vclock
    /// stores. `Op::DeleteLocal` carries no `new_local_state` (the executor
    /// only deletes bytes), so the authoritative tombstone is looked up from
    /// `remote_states`, captured at planning time — a path can't simply
    /// vanish from the store, it must carry a `DeletionRecord` (spec
    /// invariant: every known path has exactly one `FileState`).
    async fn commit_results(&self, results: &[SyncedFileInfo], remote_states: &HashMap<String, FileState>) -> Result<()> {
        {
            // Lock vclocks before state, matching the order `RequestHandler`
            // uses, so concurrent syncs against different peers for this
            // folder can't lock-order-invert and deadlock.
            let mut vclocks = self.runtime.vclocks.lock().await;
            let mut store = self.runtime.state.lock().await;
            for r in results {
                match r.op {
                    Op::DeleteLocal => {
                        if let Some(FileState::Deleted(t)) = remote_states.get(&r.path) {
                            vclocks.set(r.path.clone(), t.vector_clock.clone());
                            store.set_deleted(r.path.clone(), t.clone());
                        }
                        self.cooldown.mark(&self.folder.sync_id, &r.path);
                    }
                    Op::DeleteRemote | Op::TombstoneToRemote => {}
                    Op::Download | Op::Upload => {
                        if let Some(new_state) = &r.new_local_state {
                            vclocks.set(r.path.clone(), new_state.vector_clock().clone());
                            match new_state {
                                FileState::Exists(m) => store.set_exists(r.path.clone(), m.clone()),
                                FileState::Deleted(t) => store.set_deleted(r.path.clone(), t.clone()),
                            }
                        }
                        if r.op == Op::Download {
                            self.cooldown.mark(&self.folder.sync_id, &r.path);
                        }
                    }
                    // Conflict artifacts never enter the state store (spec §4.9).
                    Op::ConflictDownload => self.cooldown.mark(&self.folder.sync_id, &r.path),
                    Op::ConflictUpload => {}
                }
            }
        }
        self.runtime.persist_state().await?;
        self.runtime.persist_vclocks().await?;
        Ok(())
    }

    /// Persists the folder snapshot used by the next run's rename/deletion
    /// classifier, records the peer-sync-cooldown timestamp, and sweeps
    /// expired tombstones. Sweep is conservative (spec §9 open question):
    /// a `Deleted` record is only ever dropped once it is older than
    /// `tombstone_ttl`, regardless of what any individual peer has or
    /// hasn't acknowledged.
    async fn finalize(&self, peer: &PeerInfo, now: DateTime<Utc>) -> Result<()> {
        let mut snapshot = FolderSnapshot::empty(self.folder.sync_id.clone(), self.folder.id);
        {
            let store = self.runtime.state.lock().await;
            for (path, s) in store.iter() {
                if let FileState::Exists(m) = s {
                    snapshot
                        .files
                        .insert(path.clone(), SnapshotEntry { hash: m.content_hash, mtime: m.mtime, vector_clock: m.vector_clock.clone(), size: m.size });
                }
            }
        }
        snapshot.taken_at = now;
        snapshot.save(&self.state_dir)?;

        self.last_synced.lock().await.insert(peer.peer_id.clone(), now);

        let ttl = chrono::Duration::from_std(self.config.tombstone_ttl()).unwrap_or(chrono::Duration::zero());
        {
            let mut store = self.runtime.state.lock().await;
            store.cleanup_expired(now, ttl, |_path, _tombstone| true);
        }
        self.runtime.persist_state().await?;

        self.log_phase(peer, "finalization", "snapshot persisted").await;
        info!(peer = %peer.peer_id, sync_id = %self.folder.sync_id, "sync finalized");
        Ok(())
    }

    async fn log_phase(&self, peer: &PeerInfo, phase: &str, detail: impl Into<String>) {
        if let Err(e) = append_sync_log(&self.state_dir, &self.folder.sync_id, &peer.peer_id, phase, detail).await {
            warn!("sync log append failed: {e}");
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct SyncLogEntry {
    timestamp: DateTime<Utc>,
    sync_id: String,
    peer_id: String,
    phase: String,
    detail: String,
}

fn sync_log_path(state_dir: &Path, sync_id: &str) -> PathBuf {
    state_dir.join("sync").join(sync_id).join("sync.log.jsonl")
}

/// Append-only JSON-lines record of completed phase transitions (spec §3
/// Expansion "SyncLog"), read by the status UI and by tests — never by the
/// coordinator itself.
async fn append_sync_log(state_dir: &Path, sync_id: &str, peer_id: &str, phase: &str, detail: impl Into<String>) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let path = sync_log_path(state_dir, sync_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent.display().to_string(), e))?;
    }
    let entry = SyncLogEntry { timestamp: Utc::now(), sync_id: sync_id.to_string(), peer_id: peer_id.to_string(), phase: phase.to_string(), detail: detail.into() };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await.map_err(|e| SyncError::io(path.display().to_string(), e))?;
    file.write_all(line.as_bytes()).await.map_err(|e| SyncError::io(path.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::FolderMode;
    use crate::ports::FixedClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullRpc;
    #[async_trait]
    impl RpcClient for NullRpc {
        async fn send(&self, _address: &str, _request: SyncRequest) -> Result<SyncResponse> {
            Err(SyncError::PeerAbsent("unreachable in this test".into()))
        }
    }

    struct EchoRpc {
        digest: Option<[u8; 32]>,
        calls: AtomicUsize,
    }
    #[async_trait]
    impl RpcClient for EchoRpc {
        async fn send(&self, _address: &str, request: SyncRequest) -> Result<SyncResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request {
                SyncRequest::GetMST { sync_id } => Ok(SyncResponse::MstRoot { sync_id, digest: self.digest }),
                SyncRequest::GetFiles { sync_id } => Ok(SyncResponse::FilesV2 { sync_id, files: HashMap::new() }),
                _ => Err(SyncError::Protocol("unexpected request in test".into())),
            }
        }
    }

    fn peer(id: &str, sync_id: &str, now: DateTime<Utc>) -> PeerInfo {
        PeerInfo { peer_id: id.into(), network_addresses: vec!["127.0.0.1:0".into()], last_seen_at: now, announced_sync_ids: vec![sync_id.into()] }
    }

    fn coordinator_for(dir: &std::path::Path, rpc: Arc<dyn RpcClient>, now: DateTime<Utc>) -> SyncCoordinator {
        let folder = Folder::new(dir.join("root"), "ab12", FolderMode::TwoWay);
        std::fs::create_dir_all(&folder.root).unwrap();
        let runtime = Arc::new(FolderRuntime::open(folder.clone(), dir.join("state")).unwrap());
        SyncCoordinator::new(
            folder,
            "pa".into(),
            dir.join("state"),
            runtime,
            Arc::new(WriteCooldownTracker::default()),
            Config::default(),
            Arc::new(FixedClock(now)),
            rpc,
        )
    }

    #[tokio::test]
    async fn skips_peer_not_announcing_this_sync_id() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let coord = coordinator_for(dir.path(), Arc::new(NullRpc), now);
        let mut p = peer("pb", "ab12", now);
        p.announced_sync_ids = vec!["other".into()];
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::Skipped("peer does not announce this sync_id".into()));
    }

    #[tokio::test]
    async fn skips_peer_outside_online_window() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let coord = coordinator_for(dir.path(), Arc::new(NullRpc), now);
        let p = peer("pb", "ab12", now - chrono::Duration::seconds(3600));
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::Skipped("peer not seen within online window".into()));
    }

    #[tokio::test]
    async fn matching_empty_roots_reports_up_to_date_without_fetching_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let rpc = Arc::new(EchoRpc { digest: None, calls: AtomicUsize::new(0) });
        let coord = coordinator_for(dir.path(), rpc.clone(), now);
        let p = peer("pb", "ab12", now);
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::UpToDate);
        // Only GetMST, never GetFiles, since the roots already matched.
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn downloads_a_remote_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        struct OneFileRpc;
        #[async_trait]
        impl RpcClient for OneFileRpc {
            async fn send(&self, _address: &str, request: SyncRequest) -> Result<SyncResponse> {
                match request {
                    SyncRequest::GetMST { sync_id } => Ok(SyncResponse::MstRoot { sync_id, digest: Some([9u8; 32]) }),
                    SyncRequest::GetFiles { sync_id } => {
                        let mut files = HashMap::new();
                        files.insert(
                            "only_remote.txt".to_string(),
                            FileState::Exists(FileMetadata { content_hash: [1u8; 32], mtime: Utc::now(), vector_clock: VectorClock::new(), size: 5 }),
                        );
                        Ok(SyncResponse::FilesV2 { sync_id, files })
                    }
                    SyncRequest::GetFileData { sync_id, relative_path } => Ok(SyncResponse::FileData { sync_id, path: relative_path, bytes: b"hello".to_vec() }),
                    _ => Err(SyncError::Protocol("unexpected request".into())),
                }
            }
        }

        let coord = coordinator_for(dir.path(), Arc::new(OneFileRpc), now);
        let p = peer("pb", "ab12", now);
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::Synced { files_changed: 1 });
        assert_eq!(std::fs::read(dir.path().join("root").join("only_remote.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn concurrent_run_against_same_peer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let coord = Arc::new(coordinator_for(dir.path(), Arc::new(NullRpc), now));
        coord.running.lock().await.insert("pb".to_string());
        let p = peer("pb", "ab12", now);
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::Skipped("sync already in progress with this peer".into()));
    }

    #[tokio::test]
    async fn folder_not_found_is_a_quiet_peer_absent_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        struct FolderNotFoundRpc;
        #[async_trait]
        impl RpcClient for FolderNotFoundRpc {
            async fn send(&self, _address: &str, request: SyncRequest) -> Result<SyncResponse> {
                match request {
                    SyncRequest::GetMST { sync_id } => Ok(SyncResponse::FolderNotFound { sync_id }),
                    _ => Err(SyncError::Protocol("unexpected request".into())),
                }
            }
        }

        let coord = coordinator_for(dir.path(), Arc::new(FolderNotFoundRpc), now);
        let p = peer("pb", "ab12", now);
        let outcome = coord.run_once(&p).await;
        assert_eq!(outcome, SyncOutcome::PeerAbsent);
    }

    /// Renaming `foo.bin` to `bar.bin` locally must tombstone `foo.bin` in
    /// the persisted state, not merely migrate its vector clock, or a peer
    /// that still has `foo.bin` will never be told to delete it.
    #[tokio::test]
    async fn rename_tombstones_the_old_path() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let coord = coordinator_for(dir.path(), Arc::new(NullRpc), now);
        let root = dir.path().join("root");

        std::fs::write(root.join("foo.bin"), b"hello").unwrap();
        let first = coord.local_rescan(now).await.unwrap();
        let original_vc = match first.get("foo.bin") {
            Some(FileState::Exists(m)) => m.vector_clock.clone(),
            other => panic!("expected foo.bin to exist after first scan, got {other:?}"),
        };

        std::fs::rename(root.join("foo.bin"), root.join("bar.bin")).unwrap();
        let second = coord.local_rescan(now + chrono::Duration::seconds(1)).await.unwrap();

        match second.get("foo.bin") {
            Some(FileState::Deleted(t)) => {
                assert_eq!(t.vector_clock.compare(&original_vc), crate::vclock::Comparison::Successor);
            }
            other => panic!("expected foo.bin to be tombstoned after rename, got {other:?}"),
        }
        assert!(matches!(second.get("bar.bin"), Some(FileState::Exists(_))));
    }
}
