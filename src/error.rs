//! Error taxonomy for the hub. A routing miss is not an error and has no variant here.

use crate::auth::AuthError;
use crate::storage::StorageError;
use crate::UserId;

/// Why a single inbound frame was rejected. The connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported frame kind: {0}")]
    UnsupportedFrame(&'static str),
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The recipient's outbound queue is full; the connection gets torn down.
    #[error("slow consumer: outbound queue of user {user_id} is full")]
    SlowConsumer { user_id: UserId },
    #[error("connection of user {user_id} is closed")]
    ConnectionClosed { user_id: UserId },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),
}
