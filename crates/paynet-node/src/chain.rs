//! Chain and wallet collaborator contracts, and the watcher that turns
//! account events into idempotent tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::store::{KvStore, PaymentsDb};
use crate::types::Asset;

/// Lifecycle of a channel contract as reported on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStatus {
    Uninitialized,
    Open,
    ClosureStarted,
    Quarantine,
    Settled,
}

/// Strongly typed channel contract state.
#[derive(Debug, Clone)]
pub struct ContractState {
    pub status: ContractStatus,
    pub asset: Asset,
    pub left_key: [u8; 32],
    pub right_key: [u8; 32],
    pub left_wallet: String,
    pub right_wallet: String,
    pub left_deposited: u128,
    pub right_deposited: u128,
    pub left_withdrawn: u128,
    pub right_withdrawn: u128,
    /// Seqnos committed by the contract, used to detect challengeable states.
    pub left_seqno: u64,
    pub right_seqno: u64,
    /// End of the quarantine window, once an uncooperative close started.
    pub quarantine_until: Option<i64>,
    /// End of the conditional-settlement window.
    pub conditional_close_until: Option<i64>,
}

/// A transaction on a watched channel contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub address: String,
    /// Ledger logical time; the idempotency key together with the address.
    pub lt: u64,
    /// Masterchain seqno the event was observed at.
    pub mc_seqno: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MasterchainInfo {
    pub seqno: u64,
    pub gen_utime: i64,
}

/// On-chain RPC collaborator.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_channel_contract_state(&self, address: &str) -> Result<ContractState, NodeError>;

    /// Submit a serialized external/internal message body to a contract.
    async fn submit(&self, address: &str, body: Vec<u8>) -> Result<(), NodeError>;

    /// Stream transaction events for a set of channel contract addresses.
    async fn subscribe_events(
        &self,
        addresses: Vec<String>,
    ) -> Result<mpsc::Receiver<ChainEvent>, NodeError>;

    async fn current_mc_info(&self) -> Result<MasterchainInfo, NodeError>;
}

/// Node wallet collaborator.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn send_external(&self, payload: Vec<u8>) -> Result<(), NodeError>;
    async fn balance(&self) -> Result<u128, NodeError>;
    fn address(&self) -> String;
}

/// Pool and task naming for chain events.
pub const POOL_CHAIN_EVENTS: &str = "chain-events";
pub const KIND_CHANNEL_EVENT: &str = "channel-event";
pub const QUEUE_EVENTS: &str = "events";

/// Payload of a `channel-event` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEventPayload {
    pub address: String,
    pub lt: u64,
}

/// Consumes chain events and persists them as tasks keyed by
/// `(address, lt)`, so replays after a crash deduplicate naturally. The
/// block offset is stored in the same transaction.
pub struct ChainWatcher<S: KvStore> {
    db: Arc<PaymentsDb<S>>,
}

impl<S: KvStore> ChainWatcher<S> {
    pub fn new(db: Arc<PaymentsDb<S>>) -> Self {
        Self { db }
    }

    /// Fold one event into the task queue. Exposed for tests; `run` loops
    /// over a subscription feeding this.
    pub fn ingest(&self, event: &ChainEvent) -> Result<(), NodeError> {
        self.db.transaction(|exec| {
            self.db.create_task(
                exec,
                POOL_CHAIN_EVENTS,
                KIND_CHANNEL_EVENT,
                QUEUE_EVENTS,
                &format!("{}-{}", event.address, event.lt),
                &ChannelEventPayload {
                    address: event.address.clone(),
                    lt: event.lt,
                },
                None,
                None,
            )?;
            self.db.set_block_offset(exec, event.mc_seqno)?;
            Ok(())
        })?;
        debug!(address = %event.address, lt = event.lt, "chain event recorded");
        Ok(())
    }

    /// Drive a subscription until the channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<ChainEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.ingest(&event) {
                warn!(error = %err, address = %event.address, "failed to record chain event");
            }
        }
        debug!("chain event stream ended");
    }
}
