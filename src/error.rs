use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Every failure a sync operation can surface to the caller.
///
/// Per-record failures (a single row that cannot be materialised, a
/// verdict the server rejected) are folded into operation summaries and
/// never abort a batch; only operation-level failures appear here.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Network-level failure (DNS, connect, timeout, 5xx). Retryable;
    /// no local state has been mutated.
    #[error("transport: {0}")]
    Transport(String),
    /// Credential problem (401/403). The embedding application owns
    /// token refresh; no local state has been mutated.
    #[error("auth: {0}")]
    Auth(String),
    /// The server response violates the wire contract (length mismatch,
    /// missing required field). The operation aborted without mutating
    /// state.
    #[error("protocol: {0}")]
    Protocol(String),
    /// A declared sync table is missing or ill-formed.
    #[error("schema: {0}")]
    Schema(String),
    /// A constraint violation while writing business rows.
    #[error("integrity: {0}")]
    Integrity(String),
    /// The user-supplied merge policy failed.
    #[error("resolver: {0}")]
    Resolver(String),
    /// The operation was cancelled at a suspension point.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the caller may simply retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }

    /// Whether the failure is a credential problem the transport layer
    /// should resolve (refresh the token) before retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}
