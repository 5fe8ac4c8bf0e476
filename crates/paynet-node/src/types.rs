//! Node-local data model: channels, sides, virtual-channel bookkeeping and
//! channel history.

use std::sync::Arc;

use paynet_cell::{boc, Cell, CellBuilder, CellSlice, Dictionary};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::semichannel::{SignedSemiChannel, VirtualChannelCondition, VirtualChannelState};

/// The asset a channel settles in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Asset {
    /// The chain's native coin.
    Native,
    /// An extra-currency id.
    ExtraCurrency(u32),
    /// A token identified by its master contract address.
    Token(String),
}

/// Lifecycle status of an on-chain channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Inactive,
    Active,
    Closing,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Inactive => write!(f, "inactive"),
            ChannelStatus::Active => write!(f, "active"),
            ChannelStatus::Closing => write!(f, "closing"),
        }
    }
}

/// Lifecycle status of a virtual channel. Advances monotonically and is
/// never reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualChannelStatus {
    Pending,
    Active,
    WantClose,
    Closed,
    WantRemove,
    Removed,
}

impl VirtualChannelStatus {
    fn rank(self) -> u8 {
        match self {
            VirtualChannelStatus::Pending => 0,
            VirtualChannelStatus::Active => 1,
            VirtualChannelStatus::WantClose | VirtualChannelStatus::WantRemove => 2,
            VirtualChannelStatus::Closed | VirtualChannelStatus::Removed => 3,
        }
    }

    pub fn is_final(self) -> bool {
        self.rank() == 3
    }
}

/// Per-party state as last confirmed on chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnchainState {
    pub key: [u8; 32],
    pub committed_seqno: u64,
    pub wallet_address: String,
    pub deposited: u128,
    pub withdrawn: u128,
    pub sent: u128,
}

impl OnchainState {
    pub fn new(key: [u8; 32], wallet_address: String) -> Self {
        Self {
            key,
            committed_seqno: 0,
            wallet_address,
            deposited: 0,
            withdrawn: 0,
            sent: 0,
        }
    }
}

/// One party's off-chain side: the signed semi-channel, the conditionals
/// dictionary the body hash commits to, and any pending withdraw.
#[derive(Debug, Clone)]
pub struct Side {
    pub signed: SignedSemiChannel,
    pub conditionals: Dictionary,
    pub pending_withdraw: u128,
}

impl Side {
    pub fn new(channel_id: [u8; 16]) -> Self {
        Self {
            signed: SignedSemiChannel::blank(channel_id),
            conditionals: Dictionary::new(),
            pending_withdraw: 0,
        }
    }

    /// Whether this side ever produced a signature.
    pub fn is_ready(&self) -> bool {
        !self.signed.signature.is_blank()
    }

    /// Parse a condition from the dictionary by its 32-bit key.
    pub fn condition(&self, dict_key: u32) -> Result<Option<VirtualChannelCondition>, NodeError> {
        match self.conditionals.get(dict_key) {
            Some(cell) => Ok(Some(VirtualChannelCondition::from_cell(cell)?)),
            None => Ok(None),
        }
    }

    /// All conditions currently held on this side.
    pub fn conditions(&self) -> Result<Vec<VirtualChannelCondition>, NodeError> {
        self.conditionals
            .iter()
            .map(|(_, cell)| VirtualChannelCondition::from_cell(cell).map_err(NodeError::from))
            .collect()
    }

    fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_ref(Arc::new(self.signed.to_cell()?))?;
        match self.conditionals.root_cell() {
            Some(root) => {
                builder.store_bit(true)?;
                builder.store_ref(Arc::new(root))?;
            }
            None => {
                builder.store_bit(false)?;
            }
        }
        builder.store_coins(self.pending_withdraw)?;
        Ok(builder.build()?)
    }

    fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let signed = SignedSemiChannel::from_cell(slice.load_ref()?)?;
        let conditionals = if slice.load_bit()? {
            Dictionary::from_root_cell(slice.load_ref()?)?
        } else {
            Dictionary::new()
        };
        let pending_withdraw = slice.load_coins()?;
        Ok(Self {
            signed,
            conditionals,
            pending_withdraw,
        })
    }
}

// Sides persist as base64 bags-of-cells inside the JSON channel blob, the
// same shape they travel on the wire.
impl Serialize for Side {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let cell = self.to_cell().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&boc::to_base64(&cell))
    }
}

impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let cell = boc::from_base64(&encoded).map_err(serde::de::Error::custom)?;
        Side::from_cell(&cell).map_err(serde::de::Error::custom)
    }
}

/// A bilateral payment channel backed by an on-chain contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: [u8; 16],
    pub address: String,
    pub asset: Asset,
    pub status: ChannelStatus,
    /// Whether our party is the "left" side of the contract.
    pub we_left: bool,
    /// Gate for new proposals; cleared while closing or migrating.
    pub accepting_actions: bool,

    pub our_onchain: OnchainState,
    pub their_onchain: OnchainState,
    pub our: Side,
    pub their: Side,

    /// Initialization or reinitialization time, unix seconds.
    pub init_at: i64,
    pub created_at: i64,
    /// Last chain transaction logical time already folded into this record.
    pub last_processed_lt: u64,
    /// Seconds of on-chain margin needed to close this channel safely.
    pub safe_onchain_close_period: i64,

    /// Optimistic-concurrency version, bumped by every store.
    pub db_version: u64,
}

impl Channel {
    /// Available balance and locked amount for one side.
    ///
    /// `balance = counterparty.sent + deposited − max(withdrawn,
    /// pending_withdraw) − sent − Σ(capacity + fee − prepay)`; the result may
    /// be transiently negative while validating a proposed transition, which
    /// is exactly the condition the engine rejects.
    pub fn balance(&self, their: bool) -> Result<(i128, u128), NodeError> {
        let (side, onchain, other) = if their {
            (&self.their, &self.their_onchain, &self.our)
        } else {
            (&self.our, &self.our_onchain, &self.their)
        };

        let max_withdraw = onchain.withdrawn.max(side.pending_withdraw);
        let mut balance = other.signed.state.data.sent as i128 + onchain.deposited as i128
            - max_withdraw as i128
            - side.signed.state.data.sent as i128;
        let mut locked = side.pending_withdraw.saturating_sub(onchain.withdrawn);

        for condition in side.conditions()? {
            balance -= condition.locked_amount() as i128;
            locked += condition.locked_amount();
        }
        Ok((balance, locked))
    }

    pub fn our_key(&self) -> &[u8; 32] {
        &self.our_onchain.key
    }

    pub fn their_key(&self) -> &[u8; 32] {
        &self.their_onchain.key
    }
}

/// One direction of a virtual channel as seen by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualChannelMetaSide {
    pub channel_address: String,
    pub capacity: u128,
    pub fee: u128,
    /// The condition deadline; after it only removal is legal off-chain.
    pub uncooperative_deadline: i64,
    /// When we must start acting to keep on-chain settlement possible.
    pub safe_deadline: i64,
    pub sender_key: Option<[u8; 32]>,
}

/// Node-local bookkeeping for one virtual channel key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualChannelMeta {
    pub key: [u8; 32],
    pub status: VirtualChannelStatus,
    pub incoming: Option<VirtualChannelMetaSide>,
    pub outgoing: Option<VirtualChannelMetaSide>,
    /// Highest-amount valid resolve seen so far, as a bag-of-cells.
    pub last_known_resolve: Option<Vec<u8>>,
    /// Set only on the payment initiator.
    pub final_destination: Option<[u8; 32]>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VirtualChannelMeta {
    pub fn new(key: [u8; 32], status: VirtualChannelStatus, now: i64) -> Self {
        Self {
            key,
            status,
            incoming: None,
            outgoing: None,
            last_known_resolve: None,
            final_destination: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the status. Transitions never go backwards; a final status is
    /// terminal.
    pub fn advance_status(&mut self, to: VirtualChannelStatus, now: i64) -> bool {
        if self.status.is_final() || to.rank() < self.status.rank() {
            return false;
        }
        self.status = to;
        self.updated_at = now;
        true
    }

    /// The strongest valid resolve stored, if any.
    pub fn known_resolve(&self) -> Option<VirtualChannelState> {
        let bytes = self.last_known_resolve.as_ref()?;
        let state = VirtualChannelState::from_boc(bytes).ok()?;
        state.verify(&self.key).ok()?;
        Some(state)
    }

    /// Store a resolve if it is valid and not weaker than the current one.
    ///
    /// This is the monotonic accumulator: a lower amount returns
    /// [`NodeError::NewerStateIsKnown`] and leaves the stored value intact.
    pub fn add_known_resolve(
        &mut self,
        state: &VirtualChannelState,
        now: i64,
    ) -> Result<(), NodeError> {
        state.verify(&self.key)?;
        if let Some(existing) = self.known_resolve() {
            if existing.amount > state.amount {
                return Err(NodeError::NewerStateIsKnown);
            }
        }
        self.last_known_resolve = Some(state.to_boc()?);
        self.updated_at = now;
        Ok(())
    }
}

/// Channel history event, stored under the `hist:` namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHistoryEvent {
    Topup { amount: u128 },
    TopupCapacity { amount: u128 },
    Withdraw { amount: u128 },
    WithdrawCapacity { amount: u128 },
    TransferIn { amount: u128, from: [u8; 32] },
    TransferOut { amount: u128, to: [u8; 32] },
    UncooperativeCloseStarted,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHistoryItem {
    /// Unix nanoseconds; also the ordering component of the storage key.
    pub at: i64,
    pub event: ChannelHistoryEvent,
}

/// Virtual-channel lifecycle event pushed to the webhook queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualChannelEventType {
    Open,
    Close,
    Transfer,
    Remove,
}

impl std::fmt::Display for VirtualChannelEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VirtualChannelEventType::Open => write!(f, "open"),
            VirtualChannelEventType::Close => write!(f, "close"),
            VirtualChannelEventType::Transfer => write!(f, "transfer"),
            VirtualChannelEventType::Remove => write!(f, "remove"),
        }
    }
}
