//! Signed webhook dispatch for lifecycle events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::types::{VirtualChannelEventType, VirtualChannelMeta};

pub const POOL_WEBHOOKS: &str = "webhooks";
pub const KIND_VIRTUAL_CHANNEL_EVENT: &str = "virtual-channel-event";

/// Delivery collaborator: POSTs the signed body and succeeds on 2xx.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, body: &[u8], signature_hex: &str) -> Result<(), NodeError>;
}

/// Body of a virtual-channel lifecycle webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualChannelEvent {
    pub event_type: VirtualChannelEventType,
    pub key: [u8; 32],
    pub status: crate::types::VirtualChannelStatus,
    pub amount: u128,
    pub updated_at: i64,
}

impl VirtualChannelEvent {
    pub fn from_meta(event_type: VirtualChannelEventType, meta: &VirtualChannelMeta) -> Self {
        Self {
            event_type,
            key: meta.key,
            status: meta.status,
            amount: meta.known_resolve().map(|r| r.amount).unwrap_or(0),
            updated_at: meta.updated_at,
        }
    }

    /// Task id: one delivery per (key, event, update time).
    pub fn task_id(&self) -> String {
        format!(
            "{}-{}-{}",
            hex::encode(self.key),
            self.event_type,
            self.updated_at
        )
    }
}

/// HMAC-SHA256 of the raw body, hex encoded, carried in `X-Signature`.
pub fn sign_body(key: &[u8], body: &[u8]) -> String {
    hex::encode(paynet_crypto::hmac_sha256(key, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VirtualChannelStatus;

    #[test]
    fn signature_is_stable_per_key_and_body() {
        let body = br#"{"event_type":"close"}"#;
        let sig = sign_body(b"hook-key", body);
        assert_eq!(sig, sign_body(b"hook-key", body));
        assert_ne!(sig, sign_body(b"other", body));
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn task_id_changes_with_update_time() {
        let mut meta = VirtualChannelMeta::new([1u8; 32], VirtualChannelStatus::Active, 10);
        let first = VirtualChannelEvent::from_meta(VirtualChannelEventType::Open, &meta).task_id();
        meta.updated_at = 20;
        let second = VirtualChannelEvent::from_meta(VirtualChannelEventType::Open, &meta).task_id();
        assert_ne!(first, second);
    }
}
