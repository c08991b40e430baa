//! Thin CLI driver (spec §1 Non-goal: "UI/CLI surface beyond a thin
//! driver" stays external to the library). Wires `leafsync`'s
//! `SyncCoordinator`/`server`/`watcher` to a QUIC transport and to a flat
//! JSON folder/peer registry — the minimal stand-in for the external
//! discovery/registration collaborators spec §1 explicitly excludes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leafsync::config::Config;
use leafsync::coordinator::SyncCoordinator;
use leafsync::folder::{Folder, FolderMode, PeerInfo};
use leafsync::net::{QuicRpcClient, TrustPolicy};
use leafsync::ports::{PeerOracle, RpcClient, SystemClock};
use leafsync::server::{FolderRuntime, ServerState, WriteCooldownTracker};
use leafsync::status::StatusRegistry;
use leafsync::watcher::WatcherBridge;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "leafsync", version, about = "P2P folder sync over QUIC with Merkle-summarized reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a folder to sync under a sync_id.
    FolderAdd {
        path: PathBuf,
        sync_id: String,
        #[arg(long, value_enum, default_value = "two-way")]
        mode: ModeArg,
    },
    /// List registered folders.
    FolderList,
    /// Register a peer's address and the sync_ids it participates in.
    PeerAdd {
        peer_id: String,
        address: String,
        sync_ids: Vec<String>,
    },
    /// List registered peers.
    PeerList,
    /// Start serving registered folders over QUIC, watching them for local
    /// changes, and syncing with registered peers.
    Serve {
        #[arg(long, default_value_t = 4455)]
        port: u16,
        #[arg(long)]
        ui_port: Option<u16>,
    },
    /// Run one reconciliation pass against a single peer, outside the
    /// watcher loop (useful for scripting and diagnosis).
    Sync {
        sync_id: String,
        peer_id: String,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ModeArg {
    TwoWay,
    UploadOnly,
    DownloadOnly,
}

impl From<ModeArg> for FolderMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::TwoWay => FolderMode::TwoWay,
            ModeArg::UploadOnly => FolderMode::UploadOnly,
            ModeArg::DownloadOnly => FolderMode::DownloadOnly,
        }
    }
}

/// Flat JSON-persisted folder/peer lists; the real discovery and
/// registration protocols are external collaborators (spec §1 Non-goals),
/// this is just enough bookkeeping for the CLI to drive the library.
#[derive(Default, Serialize, Deserialize)]
struct Registry {
    folders: Vec<Folder>,
    peers: Vec<PeerInfo>,
}

impl Registry {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("registry.json")
    }

    fn load(state_dir: &Path) -> Result<Self> {
        let p = Self::path(state_dir);
        if !p.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&p).with_context(|| format!("read {p:?}"))?;
        Ok(serde_json::from_str(&text).with_context(|| "parse registry.json")?)
    }

    fn save(&self, state_dir: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state_dir), text)?;
        Ok(())
    }
}

/// A `PeerOracle` over the flat registry: every registered peer is always
/// reported "online" since this crate owns no real liveness signal — the
/// coordinator's own online-window/cooldown gating still applies against
/// whatever `last_seen_at` the registry recorded at `peer add` time.
struct StaticPeerOracle {
    peers: Vec<PeerInfo>,
}

impl PeerOracle for StaticPeerOracle {
    fn peers_online_within(&self, _window: chrono::Duration) -> Vec<PeerInfo> {
        self.peers.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let state_dir = leafsync::identity::state_dir()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::FolderAdd { path, sync_id, mode } => {
            if !Folder::is_valid_sync_id(&sync_id) {
                anyhow::bail!("sync_id must be at least 4 alphanumeric characters");
            }
            let mut reg = Registry::load(&state_dir)?;
            reg.folders.push(Folder::new(path, sync_id.clone(), mode.into()));
            reg.save(&state_dir)?;
            println!("Registered folder for sync_id {sync_id}");
        }
        Commands::FolderList => {
            let reg = Registry::load(&state_dir)?;
            for f in &reg.folders {
                println!("{}  {}  {:?}", f.sync_id, f.root.display(), f.mode);
            }
        }
        Commands::PeerAdd { peer_id, address, sync_ids } => {
            let mut reg = Registry::load(&state_dir)?;
            reg.peers.retain(|p| p.peer_id != peer_id);
            reg.peers.push(PeerInfo { peer_id: peer_id.clone(), network_addresses: vec![address], last_seen_at: chrono::Utc::now(), announced_sync_ids: sync_ids });
            reg.save(&state_dir)?;
            println!("Registered peer {peer_id}");
        }
        Commands::PeerList => {
            let reg = Registry::load(&state_dir)?;
            for p in &reg.peers {
                println!("{}  {:?}  syncs={:?}", p.peer_id, p.network_addresses, p.announced_sync_ids);
            }
        }
        Commands::Serve { port, ui_port } => {
            run_serve(state_dir, port, ui_port).await?;
        }
        Commands::Sync { sync_id, peer_id } => {
            run_one_sync(state_dir, &sync_id, &peer_id).await?;
        }
    }
    Ok(())
}

async fn run_serve(state_dir: PathBuf, port: u16, ui_port: Option<u16>) -> Result<()> {
    let reg = Registry::load(&state_dir)?;
    if reg.folders.is_empty() {
        anyhow::bail!("no folders registered; run `leafsync folder-add <path> <sync_id>` first");
    }
    let config = Config::load_or_default(&state_dir.join("config.toml"))?;
    let cooldown = Arc::new(WriteCooldownTracker::default());
    let my_peer_id = format!("peer-{}", uuid::Uuid::new_v4());

    let status = Arc::new(Mutex::new(StatusRegistry::default()));
    leafsync::status::init(status.clone());

    let rpc: Arc<dyn RpcClient> = Arc::new(QuicRpcClient::new(TrustPolicy::TrustOnFirstUse)?);
    let peers: Arc<dyn PeerOracle> = Arc::new(StaticPeerOracle { peers: reg.peers.clone() });

    let mut folders = HashMap::new();
    let mut watchers = Vec::new();
    for folder in reg.folders {
        let runtime = Arc::new(FolderRuntime::open(folder.clone(), state_dir.clone())?);
        folders.insert(folder.sync_id.clone(), runtime.clone());

        let coordinator = Arc::new(SyncCoordinator::new(
            folder.clone(),
            my_peer_id.clone(),
            state_dir.clone(),
            runtime,
            cooldown.clone(),
            config.clone(),
            Arc::new(SystemClock),
            rpc.clone(),
        ));
        let bridge = Arc::new(WatcherBridge::new(folder.clone(), config.clone(), cooldown.clone(), coordinator, peers.clone()));
        match bridge.spawn() {
            Ok(handle) => watchers.push(handle),
            Err(e) => warn!(sync_id = %folder.sync_id, "failed to start watcher: {e}"),
        }
    }

    let server_state = Arc::new(ServerState { my_peer_id, folders: Mutex::new(folders), cooldown, config });
    if let Some(ui_port) = ui_port {
        let status = status.clone();
        tokio::spawn(async move {
            if let Err(e) = leafsync::web::run_ui(ui_port, status).await {
                warn!("status UI stopped: {e:?}");
            }
        });
    }

    info!(%port, "serving registered folders");
    leafsync::server::run_server(server_state, port).await
}

async fn run_one_sync(state_dir: PathBuf, sync_id: &str, peer_id: &str) -> Result<()> {
    let reg = Registry::load(&state_dir)?;
    let folder = reg.folders.into_iter().find(|f| f.sync_id == sync_id).with_context(|| format!("no registered folder for sync_id {sync_id}"))?;
    let peer = reg.peers.into_iter().find(|p| p.peer_id == peer_id).with_context(|| format!("no registered peer {peer_id}"))?;

    let config = Config::load_or_default(&state_dir.join("config.toml"))?;
    let runtime = Arc::new(FolderRuntime::open(folder.clone(), state_dir.clone())?);
    let rpc: Arc<dyn RpcClient> = Arc::new(QuicRpcClient::new(TrustPolicy::TrustOnFirstUse)?);
    let coordinator = SyncCoordinator::new(
        folder,
        format!("peer-{}", uuid::Uuid::new_v4()),
        state_dir,
        runtime,
        Arc::new(WriteCooldownTracker::default()),
        config,
        Arc::new(SystemClock),
        rpc,
    );
    let outcome = coordinator.run_once(&peer).await;
    println!("{outcome:?}");
    Ok(())
}
