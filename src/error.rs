use thiserror::Error;

/// Error kinds produced by the sync core (spec §7).
///
/// `Conflict` is deliberately absent: a conflict is a decision outcome
/// (`decision::Action::Conflict`), never a failure.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("peer absent: {0}")]
    PeerAbsent(String),

    #[error("protocol shape error: {0}")]
    Protocol(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io { path: path.into(), source }
    }

    /// Transient-network errors are the only kind `TransferExecutor` retries.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io { path: String::new(), source: e }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Other(format!("json: {e}"))
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Protocol(format!("bincode: {e}"))
    }
}
