//! Virtual-channel manager: per-key bookkeeping, the resolve accumulator
//! and deadline guards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::error::NodeError;
use crate::semichannel::{VirtualChannelCondition, VirtualChannelState};
use crate::store::{KvExecutor, KvStore, PaymentsDb};
use crate::types::{VirtualChannelMeta, VirtualChannelMetaSide, VirtualChannelStatus};

/// Pool running all per-channel protocol workflows.
pub const POOL_CHANNEL_OPS: &str = "channel-ops";

pub const KIND_PROPOSE_ACTION: &str = "propose-action";
pub const KIND_OPEN_VIRTUAL: &str = "open-virtual";
pub const KIND_CLOSE_VIRTUAL: &str = "close-virtual";
pub const KIND_REMOVE_VIRTUAL: &str = "remove-virtual";

/// Payload of an `open-virtual` task: propose the condition on `channel`
/// and forward the onion blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVirtualPayload {
    pub channel: String,
    pub condition: VirtualChannelCondition,
    pub instruction_blob: Vec<u8>,
}

/// Payload of `close-virtual` and `remove-virtual` tasks, keyed by the
/// virtual channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualKeyPayload {
    pub key: [u8; 32],
    /// Close resulting from an instant-close tunnel: reported as a transfer.
    #[serde(default)]
    pub transfer: bool,
}

/// Tracks [`VirtualChannelMeta`] across hops and accepts resolves.
pub struct VirtualChannelManager<S: KvStore> {
    db: Arc<PaymentsDb<S>>,
    cfg: ChannelConfig,
}

impl<S: KvStore> VirtualChannelManager<S> {
    pub fn new(db: Arc<PaymentsDb<S>>, cfg: ChannelConfig) -> Self {
        Self { db, cfg }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    /// Meta side entry for a condition living on `channel_address`.
    pub fn side_for(
        &self,
        channel_address: &str,
        condition: &VirtualChannelCondition,
        sender_key: Option<[u8; 32]>,
    ) -> VirtualChannelMetaSide {
        VirtualChannelMetaSide {
            channel_address: channel_address.to_string(),
            capacity: condition.capacity,
            fee: condition.fee,
            uncooperative_deadline: condition.deadline,
            safe_deadline: self.cfg.safe_deadline(condition.deadline),
            sender_key,
        }
    }

    /// Accept a signed resolve for `key`. Monotonic: a weaker resolve is
    /// rejected with [`NodeError::NewerStateIsKnown`] and the stored one
    /// stays.
    pub fn add_resolve(
        &self,
        key: &[u8; 32],
        state: &VirtualChannelState,
        now: i64,
    ) -> Result<VirtualChannelMeta, NodeError> {
        self.db.transaction(|exec| {
            let mut meta = self.db.get_virtual_meta(exec, key)?;
            meta.add_known_resolve(state, now)?;
            self.db.put_virtual_meta(exec, &meta)?;
            debug!(key = %hex::encode(&key[..8]), amount = state.amount, "resolve stored");
            Ok(meta)
        })
    }

    /// Schedule the deadline guard for an incoming condition: if no resolve
    /// arrived by the safe deadline, ask upstream to remove the condition
    /// instead of letting it ride into the on-chain danger zone.
    pub fn schedule_safety_guard(
        &self,
        exec: &dyn KvExecutor,
        meta: &VirtualChannelMeta,
    ) -> Result<(), NodeError> {
        let Some(incoming) = &meta.incoming else {
            return Ok(());
        };
        self.db.create_task(
            exec,
            POOL_CHANNEL_OPS,
            KIND_REMOVE_VIRTUAL,
            &incoming.channel_address,
            &format!("safety-remove-{}", hex::encode(meta.key)),
            &VirtualKeyPayload {
                key: meta.key,
                transfer: false,
            },
            Some(incoming.safe_deadline * 1_000_000_000),
            Some(incoming.uncooperative_deadline * 1_000_000_000),
        )?;
        info!(
            key = %hex::encode(&meta.key[..8]),
            at = incoming.safe_deadline,
            "safety removal scheduled"
        );
        Ok(())
    }

    /// Whether a remove guard should actually fire: a known resolve means
    /// the channel is worth closing instead.
    pub fn should_remove(&self, meta: &VirtualChannelMeta) -> bool {
        meta.known_resolve().is_none()
            && !matches!(
                meta.status,
                VirtualChannelStatus::Closed | VirtualChannelStatus::Removed
            )
    }
}
