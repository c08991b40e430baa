//! Client-side QUIC transport: the `RpcClient` (spec §1 collaborator ii)
//! the sync core calls through `ports::RpcClient`. Grounded on the
//! teacher's `run_client_filtered` connection setup and its
//! fingerprint-pinning `PinVerifier` — unchanged in spirit, just no longer
//! also carrying the file-transfer control flow, which moved to
//! `transfer`/`coordinator`.
//!
//! One `quinn::Connection` per peer address, reused across requests and
//! opened lazily on first use; each `RpcClient::send` call is one
//! bidirectional stream carrying one request/response pair, matching how
//! `server::handle_stream` already reads a stream to EOF.

use crate::error::{Result, SyncError};
use crate::ports::RpcClient;
use crate::protocol::{self, SyncRequest, SyncResponse};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig as RustlsClientConfig, RootCertStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How an unrecognized peer certificate is treated. Identity verification
/// proper (who *should* this fingerprint belong to) is a discovery-layer
/// concern (spec §1 Non-goals); this only decides what to do with a cert
/// the discovery layer hasn't told us to expect yet.
#[derive(Clone, Debug)]
pub enum TrustPolicy {
    /// Require an exact match against this fingerprint, ignoring whatever
    /// `TrustStore` has on file for the address.
    Pinned(String),
    /// Trust whatever `TrustStore` has pinned for this address; if nothing
    /// is pinned yet, accept the first cert seen and persist its
    /// fingerprint for next time.
    TrustOnFirstUse,
}

pub struct QuicRpcClient {
    endpoint: Endpoint,
    policy: TrustPolicy,
    connections: Mutex<HashMap<String, Connection>>,
}

impl QuicRpcClient {
    pub fn new(policy: TrustPolicy) -> Result<Self> {
        let endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(|e| SyncError::Other(format!("quic client bind: {e}")))?;
        Ok(Self { endpoint, policy, connections: Mutex::new(HashMap::new()) })
    }

    async fn connection_for(&self, address: &str) -> Result<Connection> {
        {
            let conns = self.connections.lock().await;
            if let Some(c) = conns.get(address) {
                if c.close_reason().is_none() {
                    return Ok(c.clone());
                }
            }
        }

        let server_addr: SocketAddr = address.parse().map_err(|e| SyncError::Protocol(format!("bad peer address {address}: {e}")))?;
        let expected = crate::trust::get(address).map_err(|e| SyncError::Other(format!("trust store: {e}")))?;
        let client_cfg = make_client_config(address.to_string(), expected, &self.policy)?;
        let connecting = self
            .endpoint
            .connect_with(client_cfg, server_addr, "localhost")
            .map_err(|e| SyncError::Transient(format!("connect setup to {address}: {e}")))?;
        let connection = connecting.await.map_err(|e| SyncError::Transient(format!("connect to {address}: {e}")))?;
        info!(%address, "connected to peer");
        self.connections.lock().await.insert(address.to_string(), connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl RpcClient for QuicRpcClient {
    async fn send(&self, address: &str, request: SyncRequest) -> Result<SyncResponse> {
        let connection = self.connection_for(address).await?;
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| SyncError::Transient(format!("open stream to {address}: {e}")))?;
        protocol::send_request(&mut send, &request)
            .await
            .map_err(|e| SyncError::Transient(format!("send to {address}: {e}")))?;
        let _ = send.finish().await;
        match protocol::recv_response(&mut recv).await? {
            Some(resp) => Ok(resp),
            None => {
                warn!(%address, "connection closed before a response arrived");
                Err(SyncError::Transient(format!("no response from {address}")))
            }
        }
    }
}

fn make_client_config(address: String, expected: Option<String>, policy: &TrustPolicy) -> Result<ClientConfig> {
    let (accept_first, pin) = match policy {
        TrustPolicy::Pinned(fp) => (false, Some(fp.clone())),
        TrustPolicy::TrustOnFirstUse => (true, expected),
    };
    let roots = RootCertStore::empty();
    let mut crypto = RustlsClientConfig::builder().with_safe_defaults().with_root_certificates(roots).with_no_client_auth();
    crypto.dangerous().set_certificate_verifier(Arc::new(PinVerifier { address, expected: pin, accept_first }));
    Ok(ClientConfig::new(Arc::new(crypto)))
}

/// Accepts a server certificate only if its SHA-256 fingerprint matches
/// what was pinned, or — for a never-seen address with `accept_first` set
/// — accepts and pins whatever fingerprint shows up.
struct PinVerifier {
    address: String,
    expected: Option<String>,
    accept_first: bool,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = crate::trust::sha256_hex(&end_entity.0);
        match self.expected.as_ref() {
            Some(exp) if exp.eq_ignore_ascii_case(&fp) => Ok(ServerCertVerified::assertion()),
            Some(exp) => Err(rustls::Error::General(format!("fingerprint mismatch for {}: expected {}, got {}", self.address, exp, fp))),
            None if self.accept_first => {
                let _ = crate::trust::set(&self.address, &fp);
                Ok(ServerCertVerified::assertion())
            }
            None => Err(rustls::Error::General(format!(
                "untrusted peer {} with fingerprint {}; re-run with trust-on-first-use or pin this fingerprint",
                self.address, fp
            ))),
        }
    }
}
