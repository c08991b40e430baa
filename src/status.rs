//! Live sync status, exposed to the (external) UI surface via `web.rs`
//! (spec §2 ambient; SPEC_FULL §2 "SyncStatus extended with folder/peer
//! dimensions"). The teacher tracked one global `SyncStatus` for its single
//! fixed client/server run; this crate's `SyncCoordinator` runs many
//! `(sync_id, peer_id)` pairs concurrently; so status is now a registry
//! keyed by that pair, following the same `OnceCell<Arc<Mutex<_>>>` handle
//! pattern `status.rs` always used.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub static REGISTRY: OnceCell<Arc<Mutex<StatusRegistry>>> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StatusKey {
    pub sync_id: String,
    pub peer_id: String,
}

#[derive(Default, Clone, Serialize)]
pub struct SyncStatus {
    pub last_event: Option<String>,
    pub last_sync_ok: Option<bool>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub active: bool,
    pub current_file: Option<String>,
    pub current_received: u64,
    pub current_total: u64,
    pub last_message: Option<String>,
}

#[derive(Default)]
pub struct StatusRegistry {
    entries: HashMap<(String, String), SyncStatus>,
}

impl StatusRegistry {
    fn entry(&mut self, sync_id: &str, peer_id: &str) -> &mut SyncStatus {
        self.entries.entry((sync_id.to_string(), peer_id.to_string())).or_default()
    }

    pub fn snapshot(&self) -> Vec<(StatusKey, SyncStatus)> {
        self.entries
            .iter()
            .map(|((sync_id, peer_id), status)| (StatusKey { sync_id: sync_id.clone(), peer_id: peer_id.clone() }, status.clone()))
            .collect()
    }
}

/// Installs the process-wide registry handle. Call once at startup; later
/// calls are ignored, matching the teacher's `init`.
pub fn init(handle: Arc<Mutex<StatusRegistry>>) {
    let _ = REGISTRY.set(handle);
}

pub fn handle() -> Option<Arc<Mutex<StatusRegistry>>> {
    REGISTRY.get().cloned()
}

pub async fn set_active(sync_id: &str, peer_id: &str, active: bool) {
    if let Some(h) = REGISTRY.get() {
        let mut reg = h.lock().await;
        let s = reg.entry(sync_id, peer_id);
        s.active = active;
        s.last_event = Some(if active { "sync_started" } else { "sync_idle" }.into());
        s.last_sync_time = Some(Utc::now());
    }
}

pub async fn start_file(sync_id: &str, peer_id: &str, name: &str, total: u64) {
    if let Some(h) = REGISTRY.get() {
        let mut reg = h.lock().await;
        let s = reg.entry(sync_id, peer_id);
        s.current_file = Some(name.to_string());
        s.current_total = total;
        s.current_received = 0;
        s.last_event = Some("file_started".into());
        s.last_sync_time = Some(Utc::now());
    }
}

pub async fn progress(sync_id: &str, peer_id: &str, received: u64) {
    if let Some(h) = REGISTRY.get() {
        let mut reg = h.lock().await;
        let s = reg.entry(sync_id, peer_id);
        s.current_received = received;
        s.last_event = Some("progress".into());
        s.last_sync_time = Some(Utc::now());
    }
}

pub async fn file_done(sync_id: &str, peer_id: &str, ok: bool, msg: &str) {
    if let Some(h) = REGISTRY.get() {
        let mut reg = h.lock().await;
        let s = reg.entry(sync_id, peer_id);
        s.last_sync_ok = Some(ok);
        s.last_message = Some(msg.to_string());
        s.last_event = Some("file_done".into());
        s.last_sync_time = Some(Utc::now());
    }
}

pub async fn session_done(sync_id: &str, peer_id: &str, ok: bool, msg: &str) {
    if let Some(h) = REGISTRY.get() {
        let mut reg = h.lock().await;
        let s = reg.entry(sync_id, peer_id);
        s.active = false;
        s.last_sync_ok = Some(ok);
        s.last_message = Some(msg.to_string());
        s.last_event = Some("session_done".into());
        s.current_file = None;
        s.current_total = 0;
        s.current_received = 0;
        s.last_sync_time = Some(Utc::now());
    }
}
