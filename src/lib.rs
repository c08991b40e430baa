//! Folder sync core: content-addressed chunking, Merkle-summarized
//! reconciliation, and a vector-clock decision engine, driven by a
//! phased `SyncCoordinator` over a QUIC transport (spec §1–§2).
//!
//! `main.rs` is a thin `clap` CLI wiring this library to `net`'s QUIC
//! client and `server`'s QUIC accept loop; everything that actually
//! decides what to sync and how lives here.

pub mod blockstore;
pub mod chunker;
pub mod classifier;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod decision;
pub mod detector;
pub mod error;
pub mod folder;
pub mod identity;
pub mod ignore;
pub mod merkle;
pub mod net;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod state;
pub mod status;
pub mod transfer;
pub mod trust;
pub mod vclock;
pub mod vcstore;
pub mod watcher;
pub mod web;
