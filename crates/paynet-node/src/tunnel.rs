//! Onion-routed tunnel instructions for opening virtual channels.
//!
//! The initiator produces one sealed instruction per hop. A hop can open
//! only its own layer, which tells it what condition to expect from its
//! predecessor, what condition to open toward its successor, and carries the
//! still-sealed blob for that successor. The terminal hop sees a payee
//! marker instead of a forward spec; a single flag distinguishes "open" (the
//! payee closes explicitly later) from "send" (the payee closes immediately
//! on receipt, for which it also gets the virtual key seed).
//!
//! Layers are padded with dummy blobs so the first hop of a short route is
//! indistinguishable from an intermediate hop of a long one.

use paynet_crypto::{open, seal, sealed_key, Ed25519Keypair};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::semichannel::VirtualChannelCondition;

/// Number of layers every tunnel is padded to.
pub const TUNNEL_PAD_LAYERS: usize = 5;

/// One hop of a tunnel under construction: who, how much, until when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelChainPart {
    pub target: [u8; 32],
    pub capacity: u128,
    pub fee: u128,
    /// Deadline of the condition opened *toward* this hop. Must not
    /// increase along the chain: upstream conditions outlive downstream
    /// ones, so closes can propagate back.
    pub deadline: i64,
}

/// Condition parameters a hop must see on its incoming side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopConditionSpec {
    pub capacity: u128,
    pub fee: u128,
    pub deadline: i64,
}

/// Condition a hop must open toward the next node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHopSpec {
    pub target: [u8; 32],
    pub capacity: u128,
    pub fee: u128,
    pub deadline: i64,
}

/// The decrypted per-hop instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopInstruction {
    /// The virtual channel's public key; the condition key at every hop.
    pub virtual_key: [u8; 32],
    /// What the predecessor's condition toward us must look like.
    pub expected_incoming: HopConditionSpec,
    /// Condition to open toward the next hop; absent on the payee.
    pub forward: Option<NextHopSpec>,
    /// Set on the terminal hop.
    pub final_recipient: bool,
    /// Payee should resolve the full capacity and close immediately.
    pub instant_close: bool,
    /// Virtual key seed, present only on the payee of an instant-close
    /// tunnel so it can sign the resolve itself.
    pub virtual_seed: Option<[u8; 32]>,
    /// Sealed instruction for the next hop, or padding on the payee.
    pub next_blob: Vec<u8>,
}

impl HopInstruction {
    /// The condition this hop's predecessor must have opened toward it.
    pub fn incoming_condition(&self) -> VirtualChannelCondition {
        VirtualChannelCondition {
            key: self.virtual_key,
            capacity: self.expected_incoming.capacity,
            fee: self.expected_incoming.fee,
            prepay: 0,
            deadline: self.expected_incoming.deadline,
        }
    }

    /// The condition this hop must open toward the next node, if any.
    pub fn outgoing_condition(&self) -> Option<VirtualChannelCondition> {
        self.forward.as_ref().map(|next| VirtualChannelCondition {
            key: self.virtual_key,
            capacity: next.capacity,
            fee: next.fee,
            prepay: 0,
            deadline: next.deadline,
        })
    }
}

/// A tunnel ready to hand to the first hop.
#[derive(Debug)]
pub struct BuiltTunnel {
    /// Condition the initiator opens toward the first hop.
    pub first_condition: VirtualChannelCondition,
    /// Address tag of the first instruction (its sealing key).
    pub first_instruction_key: [u8; 32],
    /// Sealed instruction for the first hop.
    pub first_blob: Vec<u8>,
}

/// Build the layered instructions for `chain`, innermost (payee) first.
///
/// `chain[0]` is the first hop after the initiator; the last element is the
/// payee. With `instant_close` the payee is told to resolve the full
/// capacity and request the close immediately, which turns the open into a
/// one-shot transfer.
pub fn generate_tunnel(
    virtual_key: &Ed25519Keypair,
    chain: &[TunnelChainPart],
    pad_to_layers: usize,
    instant_close: bool,
) -> Result<BuiltTunnel, NodeError> {
    if chain.is_empty() {
        return Err(NodeError::ProtocolViolation("empty tunnel chain".into()));
    }
    for window in chain.windows(2) {
        if window[1].deadline > window[0].deadline {
            return Err(NodeError::ProtocolViolation(
                "tunnel deadlines must not increase downstream".into(),
            ));
        }
    }

    // Innermost layer first. The payee's "next" blob is padding so every
    // hop sees a further layer of plausible size.
    let mut blob = dummy_blob(pad_to_layers.saturating_sub(chain.len()));
    for (index, part) in chain.iter().enumerate().rev() {
        let is_final = index == chain.len() - 1;
        let instruction = HopInstruction {
            virtual_key: virtual_key.public_key,
            expected_incoming: HopConditionSpec {
                capacity: part.capacity,
                fee: part.fee,
                deadline: part.deadline,
            },
            forward: chain.get(index + 1).map(|next| NextHopSpec {
                target: next.target,
                capacity: next.capacity,
                fee: next.fee,
                deadline: next.deadline,
            }),
            final_recipient: is_final,
            instant_close: is_final && instant_close,
            virtual_seed: (is_final && instant_close).then(|| *virtual_key.private_key_bytes()),
            next_blob: blob,
        };
        let plaintext = serde_json::to_vec(&instruction)?;
        blob = seal(&part.target, &plaintext)
            .map_err(|e| NodeError::ProtocolViolation(format!("sealing failed: {e}")))?;
    }

    let first_instruction_key =
        sealed_key(&blob).map_err(|e| NodeError::ProtocolViolation(e.to_string()))?;
    let first = &chain[0];
    Ok(BuiltTunnel {
        first_condition: VirtualChannelCondition {
            key: virtual_key.public_key,
            capacity: first.capacity,
            fee: first.fee,
            prepay: 0,
            deadline: first.deadline,
        },
        first_instruction_key,
        first_blob: blob,
    })
}

/// Open and parse our layer of a tunnel.
pub fn unwrap_instruction(us: &Ed25519Keypair, blob: &[u8]) -> Result<HopInstruction, NodeError> {
    let plaintext = open(us, blob)
        .map_err(|_| NodeError::ProtocolViolation("tunnel layer is not addressed to us".into()))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Random padding indistinguishable from `extra_layers` more sealed layers.
fn dummy_blob(extra_layers: usize) -> Vec<u8> {
    // Rough size of a sealed instruction without a payload blob.
    const LAYER_SIZE: usize = 512;
    let mut blob = vec![0u8; LAYER_SIZE * (extra_layers + 1)];
    paynet_crypto::fill_random(&mut blob);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_hop_chain(
        hop: &Ed25519Keypair,
        payee: &Ed25519Keypair,
        now: i64,
    ) -> Vec<TunnelChainPart> {
        vec![
            TunnelChainPart {
                target: hop.public_key,
                capacity: 50,
                fee: 1,
                deadline: now + 120,
            },
            TunnelChainPart {
                target: payee.public_key,
                capacity: 50,
                fee: 0,
                deadline: now + 60,
            },
        ]
    }

    #[test]
    fn each_hop_sees_only_its_layer() {
        let virtual_key = Ed25519Keypair::generate();
        let hop = Ed25519Keypair::generate();
        let payee = Ed25519Keypair::generate();
        let now = 1_000;

        let tunnel =
            generate_tunnel(&virtual_key, &three_hop_chain(&hop, &payee, now), 5, false).unwrap();

        assert_eq!(tunnel.first_condition.capacity, 50);
        assert_eq!(tunnel.first_condition.fee, 1);
        assert_eq!(tunnel.first_condition.key, virtual_key.public_key);

        // The payee cannot open the first layer.
        assert!(unwrap_instruction(&payee, &tunnel.first_blob).is_err());

        let hop_instruction = unwrap_instruction(&hop, &tunnel.first_blob).unwrap();
        assert!(!hop_instruction.final_recipient);
        assert_eq!(hop_instruction.expected_incoming.capacity, 50);
        assert_eq!(hop_instruction.expected_incoming.fee, 1);
        let forward = hop_instruction.forward.clone().unwrap();
        assert_eq!(forward.target, payee.public_key);
        assert_eq!(forward.capacity, 50);
        assert_eq!(forward.fee, 0);

        // The intermediate hop cannot open the payee's layer.
        assert!(unwrap_instruction(&hop, &hop_instruction.next_blob).is_err());

        let payee_instruction = unwrap_instruction(&payee, &hop_instruction.next_blob).unwrap();
        assert!(payee_instruction.final_recipient);
        assert!(payee_instruction.forward.is_none());
        assert!(!payee_instruction.instant_close);
        assert!(payee_instruction.virtual_seed.is_none());
        assert_eq!(payee_instruction.expected_incoming.capacity, 50);
    }

    #[test]
    fn instant_close_hands_the_seed_to_the_payee() {
        let virtual_key = Ed25519Keypair::generate();
        let hop = Ed25519Keypair::generate();
        let payee = Ed25519Keypair::generate();

        let tunnel =
            generate_tunnel(&virtual_key, &three_hop_chain(&hop, &payee, 1_000), 5, true).unwrap();
        let hop_instruction = unwrap_instruction(&hop, &tunnel.first_blob).unwrap();
        assert!(hop_instruction.virtual_seed.is_none());

        let payee_instruction = unwrap_instruction(&payee, &hop_instruction.next_blob).unwrap();
        assert!(payee_instruction.instant_close);
        let seed = payee_instruction.virtual_seed.unwrap();
        let rebuilt = Ed25519Keypair::from_private_key(seed);
        assert_eq!(rebuilt.public_key, virtual_key.public_key);
    }

    #[test]
    fn increasing_deadlines_are_rejected() {
        let virtual_key = Ed25519Keypair::generate();
        let hop = Ed25519Keypair::generate();
        let payee = Ed25519Keypair::generate();

        let mut chain = three_hop_chain(&hop, &payee, 1_000);
        chain[1].deadline = chain[0].deadline + 10;
        assert!(matches!(
            generate_tunnel(&virtual_key, &chain, 5, false),
            Err(NodeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn instruction_keys_differ_per_layer() {
        let virtual_key = Ed25519Keypair::generate();
        let hop = Ed25519Keypair::generate();
        let payee = Ed25519Keypair::generate();

        let tunnel =
            generate_tunnel(&virtual_key, &three_hop_chain(&hop, &payee, 1_000), 5, false).unwrap();
        let hop_instruction = unwrap_instruction(&hop, &tunnel.first_blob).unwrap();
        let inner_key = paynet_crypto::sealed_key(&hop_instruction.next_blob).unwrap();
        assert_ne!(tunnel.first_instruction_key, inner_key);
    }

    #[test]
    fn empty_chain_is_rejected() {
        let virtual_key = Ed25519Keypair::generate();
        assert!(generate_tunnel(&virtual_key, &[], 5, false).is_err());
    }
}
