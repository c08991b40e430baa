//! Narrow interfaces the sync core consumes from outside collaborators
//! (spec §1): peer discovery, an RPC client, a clock, and a filesystem
//! façade. Concrete implementations (QUIC transport, the OS clock, etc.)
//! live in `net`/`identity`; the core only ever depends on these traits so
//! it can be driven by fakes in tests.

use crate::error::Result;
use crate::folder::PeerInfo;
use crate::protocol::{SyncRequest, SyncResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// "List peers seen in the last W seconds" oracle (spec §1 collaborator i).
pub trait PeerOracle: Send + Sync {
    fn peers_online_within(&self, window: chrono::Duration) -> Vec<PeerInfo>;
}

/// "Send request to address, get response" RPC client (spec §1 collaborator
/// ii).
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn send(&self, address: &str, request: SyncRequest) -> Result<SyncResponse>;
}

/// Clock abstraction (spec §1 collaborator vi), so tests can control `now`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
