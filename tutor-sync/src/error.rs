//! Error taxonomy for the sync engine.
//!
//! Nothing here is fatal to the process. Transport errors recover through
//! reconnect or the next poll, signaling and decode errors skip a single
//! step or frame, and command errors surface in the session view.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Connection refused, dropped, or a request that never got a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The collaborator explicitly rejected the connection (close code 4003
    /// or a 403 handshake). Reconnect is suppressed.
    #[error("connection rejected by collaborator (code {0})")]
    Rejected(u16),

    /// Malformed or out-of-sequence SDP/ICE, or a failing negotiation step.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// An inbound frame that could not be decoded.
    #[error("malformed frame: {0}")]
    ProtocolDecode(String),

    /// A mutating call the collaborator (or the local exclusivity check)
    /// refused. The message is user-facing.
    #[error("{0}")]
    Command(String),

    /// Snapshot cache failure. Persistence is best-effort.
    #[error("cache error: {0}")]
    Cache(String),

    /// Local media device acquisition failed.
    #[error("media error: {0}")]
    Media(String),

    /// The engine task has shut down.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Whether the failure is expected to clear up on its own
    /// (next reconnect attempt or next poll cycle).
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::ProtocolDecode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::ProtocolDecode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(ref response) if response.status().as_u16() == 403 => {
                SyncError::Rejected(403)
            }
            other => SyncError::Transport(other.to_string()),
        }
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<webrtc::Error> for SyncError {
    fn from(e: webrtc::Error) -> Self {
        SyncError::Signaling(e.to_string())
    }
}
