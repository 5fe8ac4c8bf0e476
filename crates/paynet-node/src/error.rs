//! Error taxonomy for node operations.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by channel, task and protocol operations.
///
/// Recovery rules: [`NodeError::AlreadyExists`] and
/// [`NodeError::NewerStateIsKnown`] are idempotency signals treated as
/// success by callers; [`NodeError::ChannelBusy`] and [`NodeError::Transient`]
/// make the surrounding task retry; signature, proof, seqno and protocol
/// violations are reported to the peer and fail the task without retrying;
/// balance and deadline failures surface to the originator.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("channel is busy")]
    ChannelBusy,

    #[error("newer state is already known")]
    NewerStateIsKnown,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid state proof")]
    InvalidProof,

    #[error("seqno gap: expected {expected}, got {got}")]
    SeqnoGap { expected: u64, got: u64 },

    #[error("not enough available balance")]
    InsufficientBalance,

    #[error("deadline expired")]
    DeadlineExpired,

    #[error("virtual channel with the same key prefix and different content already exists")]
    KeyPrefixCollision,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("cell error: {0}")]
    Cell(#[from] paynet_cell::CellError),
}

impl NodeError {
    /// Whether the surrounding task should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::ChannelBusy | NodeError::Transient(_) | NodeError::Store(_)
        )
    }

    /// Whether this error means the intended effect is already in place.
    pub fn is_idempotent_success(&self) -> bool {
        matches!(self, NodeError::AlreadyExists | NodeError::NewerStateIsKnown)
    }

    /// Stable short code carried to peers and management clients.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::NotFound => "not_found",
            NodeError::AlreadyExists => "already_exists",
            NodeError::ChannelBusy => "channel_busy",
            NodeError::NewerStateIsKnown => "newer_state_is_known",
            NodeError::InvalidSignature => "invalid_signature",
            NodeError::InvalidProof => "invalid_proof",
            NodeError::SeqnoGap { .. } => "seqno_gap",
            NodeError::InsufficientBalance => "insufficient_balance",
            NodeError::DeadlineExpired => "deadline_expired",
            NodeError::KeyPrefixCollision => "key_prefix_collision",
            NodeError::ProtocolViolation(_) => "protocol_violation",
            NodeError::Transient(_) => "transient",
            NodeError::Store(_) => "storage",
            NodeError::Cell(_) => "cell",
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Transient(format!("serialization: {err}"))
    }
}
