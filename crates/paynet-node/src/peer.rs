//! Peer protocol: request/response messages exchanged between channel
//! parties over the authenticated transport.
//!
//! The transport collaborator guarantees end-to-end authentication per peer
//! key; the core adds a per-peer monotonic nonce against replays and maps
//! every failure into a stable error code the peer can act on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::ChannelAction;
use crate::error::NodeError;

/// A proposed state update: the action plus the resulting signed state and
/// the Merkle proof of the conditionals delta. Cells travel as bags of
/// cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalEnvelope {
    pub channel: String,
    pub action: ChannelAction,
    pub signed_state: Vec<u8>,
    pub proof: Option<Vec<u8>>,
}

/// Requests a peer may send us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRequest {
    /// Propose a state update on the sender's side.
    ProposeAction(ProposalEnvelope),
    /// Propose an `OpenVirtual` plus the onion instruction for this hop.
    RequestOpenVirtual {
        proposal: ProposalEnvelope,
        instruction_blob: Vec<u8>,
    },
    /// Ask the party holding our incoming condition to confirm its close
    /// with the given resolve.
    RequestCloseVirtual { key: [u8; 32], resolve: Vec<u8> },
    /// Ask to prune a condition without crediting it.
    RequestRemoveVirtual { key: [u8; 32] },
    /// Liveness/readiness probe before sensitive operations.
    IsChannelUnlocked { channel: String },
}

impl PeerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PeerRequest::ProposeAction(_) => "propose_action",
            PeerRequest::RequestOpenVirtual { .. } => "request_open_virtual",
            PeerRequest::RequestCloseVirtual { .. } => "request_close_virtual",
            PeerRequest::RequestRemoveVirtual { .. } => "request_remove_virtual",
            PeerRequest::IsChannelUnlocked { .. } => "is_channel_unlocked",
        }
    }
}

/// Responses to [`PeerRequest`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerResponse {
    /// The proposal was validated and persisted.
    Ack,
    /// Countersigned state produced by a confirm-close or confirm-remove,
    /// for the requester to apply as the counterparty action.
    Agreement {
        signed_state: Vec<u8>,
        proof: Option<Vec<u8>>,
    },
    Unlocked {
        unlocked: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

impl PeerResponse {
    pub fn from_error(err: &NodeError) -> Self {
        PeerResponse::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Reconstruct a [`NodeError`] from a peer-reported code, preserving the
    /// idempotency and retry classification.
    pub fn error_to_node(code: &str, message: &str) -> NodeError {
        match code {
            "not_found" => NodeError::NotFound,
            "already_exists" => NodeError::AlreadyExists,
            "channel_busy" => NodeError::ChannelBusy,
            "newer_state_is_known" => NodeError::NewerStateIsKnown,
            "invalid_signature" => NodeError::InvalidSignature,
            "invalid_proof" => NodeError::InvalidProof,
            "insufficient_balance" => NodeError::InsufficientBalance,
            "deadline_expired" => NodeError::DeadlineExpired,
            "key_prefix_collision" => NodeError::KeyPrefixCollision,
            "transient" => NodeError::Transient(message.to_string()),
            other => NodeError::ProtocolViolation(format!("{other}: {message}")),
        }
    }
}

/// A request wrapped with its anti-replay nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub nonce: u64,
    pub request: PeerRequest,
}

/// Outbound peer messaging collaborator. The transport owns connection
/// management and authentication; `peer` is the counterparty's public key.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request(&self, peer: [u8; 32], envelope: PeerEnvelope)
        -> Result<PeerResponse, NodeError>;
}
