//! Off-chain channel state wire types.
//!
//! These are the structures both parties sign and the channel contract
//! understands during disputes:
//!
//! ```tlb
//! semichannel_state#43685374
//!   channel_id:uint128
//!   data:^SemiChannelBody
//!   counterparty_data:(Maybe ^SemiChannelBody)
//!   = SemiChannel;
//!
//! semi_channel_body$_ seqno:uint64 sent:Coins conditionals_hash:bits256
//!   = SemiChannelBody;
//!
//! signed_semi_channel$_ sig:bits512 state:^SemiChannel = SignedSemiChannel;
//! ```
//!
//! The body commits to the conditionals dictionary by hash only; the
//! dictionary itself travels next to the signed state, with Merkle proofs of
//! the entries a state transition touched.

use paynet_cell::{boc, Cell, CellBuilder, CellSlice};
use paynet_crypto::{verify_signature, Ed25519Keypair};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::NodeError;

/// Tag of the semi-channel state cell.
pub const SEMI_CHANNEL_TAG: u32 = 0x43685374;

/// Tag of a virtual-channel resolve body.
pub const VIRTUAL_STATE_TAG: u32 = 0x56525354;

/// A detached Ed25519 signature. All zeroes means "not signed yet" — a side
/// that was created locally and never countersigned.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn blank() -> Self {
        Self([0u8; 64])
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..6]))
    }
}

// 64-byte arrays travel as hex strings in JSON.
impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature(bytes))
    }
}

/// One party's committed counters plus the conditionals commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemiChannelBody {
    /// Monotonic state number; every re-signed state increments it by one.
    pub seqno: u64,
    /// Cumulative amount unconditionally sent to the counterparty.
    pub sent: u128,
    /// Hash of the conditionals dictionary, all zeroes when empty.
    pub conditionals_hash: [u8; 32],
}

impl SemiChannelBody {
    pub fn new() -> Self {
        Self {
            seqno: 0,
            sent: 0,
            conditionals_hash: [0u8; 32],
        }
    }

    pub fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_u64(self.seqno)?;
        builder.store_coins(self.sent)?;
        builder.store_bytes(&self.conditionals_hash)?;
        Ok(builder.build()?)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let seqno = slice.load_u64()?;
        let sent = slice.load_coins()?;
        let hash = slice.load_bytes(32)?;
        let mut conditionals_hash = [0u8; 32];
        conditionals_hash.copy_from_slice(&hash);
        Ok(Self {
            seqno,
            sent,
            conditionals_hash,
        })
    }
}

impl Default for SemiChannelBody {
    fn default() -> Self {
        Self::new()
    }
}

/// One party's view of the channel: its own body plus the last body it has
/// seen from the counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemiChannel {
    pub channel_id: [u8; 16],
    pub data: SemiChannelBody,
    pub counterparty_data: Option<SemiChannelBody>,
}

impl SemiChannel {
    pub fn new(channel_id: [u8; 16]) -> Self {
        Self {
            channel_id,
            data: SemiChannelBody::new(),
            counterparty_data: None,
        }
    }

    pub fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_u32(SEMI_CHANNEL_TAG)?;
        builder.store_bytes(&self.channel_id)?;
        builder.store_ref(Arc::new(self.data.to_cell()?))?;
        match &self.counterparty_data {
            Some(counterparty) => {
                builder.store_bit(true)?;
                builder.store_ref(Arc::new(counterparty.to_cell()?))?;
            }
            None => {
                builder.store_bit(false)?;
            }
        }
        Ok(builder.build()?)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let tag = slice.load_u32()?;
        if tag != SEMI_CHANNEL_TAG {
            return Err(NodeError::ProtocolViolation(format!(
                "bad semi-channel tag 0x{tag:08x}"
            )));
        }
        let id = slice.load_bytes(16)?;
        let mut channel_id = [0u8; 16];
        channel_id.copy_from_slice(&id);
        let data = SemiChannelBody::from_cell(slice.load_ref()?)?;
        let counterparty_data = if slice.load_bit()? {
            Some(SemiChannelBody::from_cell(slice.load_ref()?)?)
        } else {
            None
        };
        Ok(Self {
            channel_id,
            data,
            counterparty_data,
        })
    }

    /// Hash the signature covers.
    pub fn signing_hash(&self) -> Result<[u8; 32], NodeError> {
        Ok(self.to_cell()?.hash())
    }
}

/// A semi-channel state with its owner's signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSemiChannel {
    pub signature: Signature,
    pub state: SemiChannel,
}

impl SignedSemiChannel {
    /// Fresh unsigned side state for a new channel.
    pub fn blank(channel_id: [u8; 16]) -> Self {
        let mut state = SemiChannel::new(channel_id);
        state.counterparty_data = Some(SemiChannelBody::new());
        Self {
            signature: Signature::blank(),
            state,
        }
    }

    /// Sign the current state, replacing the signature.
    pub fn sign(&mut self, keypair: &Ed25519Keypair) -> Result<(), NodeError> {
        let hash = self.state.signing_hash()?;
        self.signature = Signature(keypair.sign(&hash));
        Ok(())
    }

    /// Verify the signature against the owner's public key.
    pub fn verify(&self, public_key: &[u8; 32]) -> Result<(), NodeError> {
        let hash = self.state.signing_hash()?;
        verify_signature(public_key, &hash, &self.signature.0)
            .map_err(|_| NodeError::InvalidSignature)
    }

    pub fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_bytes(&self.signature.0)?;
        builder.store_ref(Arc::new(self.state.to_cell()?))?;
        Ok(builder.build()?)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let sig = slice.load_bytes(64)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&sig);
        let state = SemiChannel::from_cell(slice.load_ref()?)?;
        Ok(Self {
            signature: Signature(signature),
            state,
        })
    }

    pub fn to_boc(&self) -> Result<Vec<u8>, NodeError> {
        Ok(boc::serialize(&self.to_cell()?))
    }

    pub fn from_boc(bytes: &[u8]) -> Result<Self, NodeError> {
        Self::from_cell(&boc::parse(bytes)?)
    }
}

/// An outstanding virtual-channel claim stored in a side's conditionals
/// dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelCondition {
    /// The virtual channel's Ed25519 public key; resolves are verified
    /// against it.
    pub key: [u8; 32],
    /// Maximum amount the resolve may claim.
    pub capacity: u128,
    /// Fee credited to the party holding this condition on close.
    pub fee: u128,
    /// Amount already committed upfront; subtracted on close.
    pub prepay: u128,
    /// Unix seconds after which the condition can only be removed.
    pub deadline: i64,
}

impl VirtualChannelCondition {
    /// Dictionary key: the first four bytes of the channel key,
    /// little-endian.
    pub fn dict_key(&self) -> u32 {
        dict_key_for(&self.key)
    }

    pub fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_bytes(&self.key)?;
        builder.store_coins(self.capacity)?;
        builder.store_coins(self.fee)?;
        builder.store_coins(self.prepay)?;
        builder.store_u64(self.deadline as u64)?;
        Ok(builder.build()?)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let key_bytes = slice.load_bytes(32)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        let capacity = slice.load_coins()?;
        let fee = slice.load_coins()?;
        let prepay = slice.load_coins()?;
        let deadline = slice.load_u64()? as i64;
        Ok(Self {
            key,
            capacity,
            fee,
            prepay,
            deadline,
        })
    }

    /// Amount this condition locks on its side: capacity plus fee, minus the
    /// prepaid part that was already moved into `sent`.
    pub fn locked_amount(&self) -> u128 {
        (self.capacity + self.fee).saturating_sub(self.prepay)
    }
}

/// Dictionary key for a virtual-channel public key.
pub fn dict_key_for(key: &[u8; 32]) -> u32 {
    u32::from_le_bytes([key[0], key[1], key[2], key[3]])
}

/// A signed resolve: the virtual-channel key's authorization to settle a
/// given amount. Amounts are monotonic — a higher-amount resolve supersedes
/// any lower one everywhere along the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelState {
    pub amount: u128,
    pub signature: Signature,
}

impl VirtualChannelState {
    fn body_cell(amount: u128) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_u32(VIRTUAL_STATE_TAG)?;
        builder.store_coins(amount)?;
        Ok(builder.build()?)
    }

    /// Produce a resolve for `amount` signed by the virtual-channel key.
    pub fn sign(amount: u128, virtual_key: &Ed25519Keypair) -> Result<Self, NodeError> {
        let hash = Self::body_cell(amount)?.hash();
        Ok(Self {
            amount,
            signature: Signature(virtual_key.sign(&hash)),
        })
    }

    /// Verify against the virtual channel's public key.
    pub fn verify(&self, key: &[u8; 32]) -> Result<(), NodeError> {
        let hash = Self::body_cell(self.amount)?.hash();
        verify_signature(key, &hash, &self.signature.0).map_err(|_| NodeError::InvalidSignature)
    }

    pub fn to_cell(&self) -> Result<Cell, NodeError> {
        let mut builder = CellBuilder::new();
        builder.store_u32(VIRTUAL_STATE_TAG)?;
        builder.store_coins(self.amount)?;
        builder.store_bytes(&self.signature.0)?;
        Ok(builder.build()?)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, NodeError> {
        let mut slice = CellSlice::new(cell);
        let tag = slice.load_u32()?;
        if tag != VIRTUAL_STATE_TAG {
            return Err(NodeError::ProtocolViolation(format!(
                "bad resolve tag 0x{tag:08x}"
            )));
        }
        let amount = slice.load_coins()?;
        let sig = slice.load_bytes(64)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&sig);
        Ok(Self {
            amount,
            signature: Signature(signature),
        })
    }

    pub fn to_boc(&self) -> Result<Vec<u8>, NodeError> {
        Ok(boc::serialize(&self.to_cell()?))
    }

    pub fn from_boc(bytes: &[u8]) -> Result<Self, NodeError> {
        Self::from_cell(&boc::parse(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_state_round_trip() {
        let keypair = Ed25519Keypair::generate();
        let mut signed = SignedSemiChannel::blank([7u8; 16]);
        signed.state.data.seqno = 3;
        signed.state.data.sent = 1_000_000_000;
        signed.sign(&keypair).unwrap();

        let restored = SignedSemiChannel::from_boc(&signed.to_boc().unwrap()).unwrap();
        assert_eq!(restored, signed);
        assert!(restored.verify(&keypair.public_key).is_ok());
    }

    #[test]
    fn signature_binds_state() {
        let keypair = Ed25519Keypair::generate();
        let mut signed = SignedSemiChannel::blank([1u8; 16]);
        signed.state.data.sent = 100;
        signed.sign(&keypair).unwrap();

        signed.state.data.sent = 200;
        assert!(matches!(
            signed.verify(&keypair.public_key),
            Err(NodeError::InvalidSignature)
        ));
    }

    #[test]
    fn signature_verifies_only_with_matching_key() {
        let keypair = Ed25519Keypair::generate();
        let other = Ed25519Keypair::generate();
        let mut signed = SignedSemiChannel::blank([1u8; 16]);
        signed.sign(&keypair).unwrap();

        assert!(signed.verify(&keypair.public_key).is_ok());
        assert!(signed.verify(&other.public_key).is_err());
    }

    #[test]
    fn condition_round_trip_and_dict_key() {
        let cond = VirtualChannelCondition {
            key: [0xAB; 32],
            capacity: 500,
            fee: 7,
            prepay: 3,
            deadline: 1_700_000_000,
        };
        let restored = VirtualChannelCondition::from_cell(&cond.to_cell().unwrap()).unwrap();
        assert_eq!(restored, cond);
        assert_eq!(cond.dict_key(), u32::from_le_bytes([0xAB; 4]));
        assert_eq!(cond.locked_amount(), 504);
    }

    #[test]
    fn resolve_signature_verifies_against_virtual_key() {
        let virtual_key = Ed25519Keypair::generate();
        let resolve = VirtualChannelState::sign(80, &virtual_key).unwrap();
        assert!(resolve.verify(&virtual_key.public_key).is_ok());

        let other = Ed25519Keypair::generate();
        assert!(resolve.verify(&other.public_key).is_err());

        let restored = VirtualChannelState::from_boc(&resolve.to_boc().unwrap()).unwrap();
        assert_eq!(restored, resolve);
        assert!(restored.verify(&virtual_key.public_key).is_ok());
    }

    #[test]
    fn blank_signature_is_detected() {
        assert!(Signature::blank().is_blank());
        assert!(!Signature([1u8; 64]).is_blank());
        let blank = SignedSemiChannel::blank([0u8; 16]);
        assert!(blank.signature.is_blank());
    }
}
