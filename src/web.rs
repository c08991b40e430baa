//! Minimal status UI (spec §1 Non-goals: "UI/CLI surface beyond a thin
//! driver" stays external; this is that thin driver). Kept from the
//! teacher's `web.rs` shape (`axum`, a single `/` page plus a JSON API) but
//! now reports the `status::StatusRegistry` snapshot instead of driving
//! the old `net::run_server`/`run_client` control flow directly.

use crate::status::StatusRegistry;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub status: Arc<Mutex<StatusRegistry>>,
}

#[derive(Serialize)]
struct StatusEntry {
    sync_id: String,
    peer_id: String,
    #[serde(flatten)]
    status: crate::status::SyncStatus,
}

pub async fn run_ui(port: u16, status: Arc<Mutex<StatusRegistry>>) -> anyhow::Result<()> {
    let state = AppState { status };
    let app = Router::new().route("/", get(index)).route("/api/status", get(api_status)).with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(%addr, "status UI listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

async fn index() -> axum::response::Html<&'static str> {
    axum::response::Html(
        r#"<!doctype html>
<html>
<head><meta charset='utf-8'><title>LeafSync Status</title>
<style>body{font-family:system-ui;margin:2rem;max-width:900px} table{border-collapse:collapse;width:100%} td,th{border:1px solid #ccc;padding:.4rem;text-align:left}</style>
</head>
<body>
  <h1>LeafSync</h1>
  <table id="t"><thead><tr><th>sync_id</th><th>peer</th><th>active</th><th>last event</th><th>progress</th><th>last sync</th></tr></thead><tbody></tbody></table>
<script>
async function refresh(){
  const r = await fetch('/api/status');
  const rows = await r.json();
  const body = document.querySelector('#t tbody');
  body.innerHTML = rows.map(e => `<tr><td>${e.sync_id}</td><td>${e.peer_id}</td><td>${e.active}</td><td>${e.last_event||''}</td><td>${e.current_received}/${e.current_total}</td><td>${e.last_sync_time||''}</td></tr>`).join('');
}
refresh();
setInterval(refresh, 2000);
</script>
</body></html>"#,
    )
}

async fn api_status(State(state): State<AppState>) -> Json<Vec<StatusEntry>> {
    let snapshot = state.status.lock().await.snapshot();
    Json(
        snapshot
            .into_iter()
            .map(|(key, status)| StatusEntry { sync_id: key.sync_id, peer_id: key.peer_id, status })
            .collect(),
    )
}
