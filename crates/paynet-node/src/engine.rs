//! Channel state engine.
//!
//! Applies [`ChannelAction`]s to the bilateral signed state. Two entry
//! points: [`StateEngine::apply_our_action`] mutates our side, re-signs and
//! emits a Merkle proof of the conditionals delta; [`StateEngine::apply_their_action`]
//! is the dual that validates a counterparty's proposed signed state by
//! replaying the claimed action on our mirror of their side.
//!
//! Both operate on an in-memory [`Channel`] copy. Callers load the record,
//! apply, and persist through the repository only on success — a failed
//! application must discard the copy, since errors can surface after partial
//! mutation.

use paynet_cell::{proof_lookup, unwrap_proof, Cell};
use paynet_crypto::Ed25519Keypair;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NodeError;
use crate::semichannel::{
    dict_key_for, SignedSemiChannel, VirtualChannelCondition, VirtualChannelState,
};
use crate::types::{Channel, Side};

/// An action either party may propose against the bilateral state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAction {
    /// Advance seqnos with no condition change: heartbeat and settlement
    /// point.
    IncrementStates,
    /// Insert a virtual-channel condition.
    OpenVirtual(VirtualChannelCondition),
    /// Raise a condition's prepaid amount.
    CommitVirtual { key: [u8; 32], prepay: u128 },
    /// Delete a condition without crediting it.
    RemoveVirtual { key: [u8; 32] },
    /// Delete a condition and credit the resolved amount plus fee.
    ConfirmClose {
        key: [u8; 32],
        resolve: VirtualChannelState,
    },
}

impl ChannelAction {
    /// Dictionary key this action touches, if any.
    pub fn touched_key(&self) -> Option<u32> {
        match self {
            ChannelAction::IncrementStates => None,
            ChannelAction::OpenVirtual(cond) => Some(cond.dict_key()),
            ChannelAction::CommitVirtual { key, .. }
            | ChannelAction::RemoveVirtual { key }
            | ChannelAction::ConfirmClose { key, .. } => Some(dict_key_for(key)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelAction::IncrementStates => "increment_states",
            ChannelAction::OpenVirtual(_) => "open_virtual",
            ChannelAction::CommitVirtual { .. } => "commit_virtual",
            ChannelAction::RemoveVirtual { .. } => "remove_virtual",
            ChannelAction::ConfirmClose { .. } => "confirm_close",
        }
    }
}

/// Outcome of applying an action.
#[derive(Debug)]
pub struct AppliedAction {
    /// Our freshly signed state (unchanged when the action was idempotent).
    pub signed_state: SignedSemiChannel,
    /// Merkle proof over the post-state conditionals; `None` when the
    /// dictionary is empty.
    pub proof: Option<Cell>,
    /// The action changed nothing: seqno was not bumped, signature not
    /// recomputed.
    pub idempotent: bool,
    /// Amount newly credited into `sent` by this action.
    pub transferred: u128,
}

/// Signs and validates state transitions with the node key.
pub struct StateEngine {
    keypair: Ed25519Keypair,
}

/// Outcome of the side-local mutation shared by both apply directions.
struct SideDelta {
    idempotent: bool,
    transferred: u128,
}

impl StateEngine {
    pub fn new(keypair: Ed25519Keypair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.keypair.public_key
    }

    pub fn keypair(&self) -> &Ed25519Keypair {
        &self.keypair
    }

    /// Apply `action` to our side, verify the balance invariant, bump the
    /// seqno and re-sign. Idempotent re-application leaves seqno and
    /// signature untouched and returns the existing state bit-exact.
    pub fn apply_our_action(
        &self,
        channel: &mut Channel,
        action: &ChannelAction,
        now: i64,
    ) -> Result<AppliedAction, NodeError> {
        let their_body = channel.their.signed.state.data;
        let delta = {
            let our = &mut channel.our;
            apply_to_side(our, action, now)?
        };

        if !delta.idempotent {
            let data = &mut channel.our.signed.state.data;
            data.seqno += 1;
            data.conditionals_hash = channel.our.conditionals.root_hash();
            channel.our.signed.state.counterparty_data = Some(their_body);

            let (balance, _) = channel.balance(false)?;
            if balance < 0 {
                return Err(NodeError::InsufficientBalance);
            }
            channel.our.signed.sign(&self.keypair)?;
            debug!(
                channel = %channel.address,
                action = action.name(),
                seqno = channel.our.signed.state.data.seqno,
                "applied action to our side"
            );
        }

        let proof = match action.touched_key() {
            _ if channel.our.conditionals.is_empty() => None,
            Some(key) => Some(channel.our.conditionals.make_proof(&[key])?),
            None => Some(channel.our.conditionals.make_proof(&[])?),
        };

        Ok(AppliedAction {
            signed_state: channel.our.signed.clone(),
            proof,
            idempotent: delta.idempotent,
            transferred: delta.transferred,
        })
    }

    /// Validate and accept a counterparty-proposed signed state.
    ///
    /// Checks, in order: channel id, their signature, strict seqno
    /// contiguity (an exact re-send of the current state is acknowledged
    /// idempotently), the replayed conditionals delta against the claimed
    /// hash and `sent`, the supplied Merkle proof, their balance invariant,
    /// and the mirror of our own state they embedded.
    pub fn apply_their_action(
        &self,
        channel: &mut Channel,
        signed: &SignedSemiChannel,
        proof: Option<&Cell>,
        action: &ChannelAction,
        now: i64,
    ) -> Result<AppliedAction, NodeError> {
        if signed.state.channel_id != channel.id {
            return Err(NodeError::ProtocolViolation("channel id mismatch".into()));
        }
        signed.verify(channel.their_key())?;

        let current = channel.their.signed.state.data.seqno;
        if signed.state.data.seqno == current
            && signed.state.data == channel.their.signed.state.data
            && !channel.their.signed.signature.is_blank()
        {
            // Exact re-send of the already-accepted state.
            return Ok(AppliedAction {
                signed_state: channel.their.signed.clone(),
                proof: None,
                idempotent: true,
                transferred: 0,
            });
        }
        if signed.state.data.seqno != current + 1 {
            return Err(NodeError::SeqnoGap {
                expected: current + 1,
                got: signed.state.data.seqno,
            });
        }

        // Replay the claimed action on our mirror of their side; the result
        // must match the claimed state exactly, which proves the delta is
        // the action and nothing else.
        let mut their = channel.their.clone();
        let delta = apply_to_side(&mut their, action, now)?;
        let expected_sent = their.signed.state.data.sent;

        if signed.state.data.sent != expected_sent {
            return Err(NodeError::ProtocolViolation(format!(
                "sent {} does not match action outcome {}",
                signed.state.data.sent, expected_sent
            )));
        }
        if signed.state.data.conditionals_hash != their.conditionals.root_hash() {
            return Err(NodeError::InvalidProof);
        }

        match proof {
            None => {
                if !their.conditionals.is_empty() {
                    return Err(NodeError::InvalidProof);
                }
            }
            Some(proof) => {
                let tree = unwrap_proof(proof, &signed.state.data.conditionals_hash)
                    .map_err(|_| NodeError::InvalidProof)?;
                if let Some(dict_key) = action.touched_key() {
                    let witnessed = proof_lookup(tree, dict_key).map_err(|_| NodeError::InvalidProof)?;
                    let expect_present = matches!(
                        action,
                        ChannelAction::OpenVirtual(_) | ChannelAction::CommitVirtual { .. }
                    );
                    match (witnessed, expect_present) {
                        (Some(_), true) | (None, false) => {}
                        _ => return Err(NodeError::InvalidProof),
                    }
                }
            }
        }

        their.signed = signed.clone();
        channel.their = their;

        let (their_balance, _) = channel.balance(true)?;
        if their_balance < 0 {
            return Err(NodeError::InsufficientBalance);
        }

        if let Some(mirror) = &signed.state.counterparty_data {
            if mirror.seqno > channel.our.signed.state.data.seqno {
                return Err(NodeError::ProtocolViolation(
                    "counterparty mirror is ahead of our state".into(),
                ));
            }
        }

        debug!(
            channel = %channel.address,
            action = action.name(),
            seqno = signed.state.data.seqno,
            "accepted counterparty state"
        );
        Ok(AppliedAction {
            signed_state: signed.clone(),
            proof: None,
            idempotent: false,
            transferred: delta.transferred,
        })
    }
}

/// The conditionals/sent mutation common to both directions. Mutates the
/// dictionary and `sent`, never seqno or signature.
fn apply_to_side(side: &mut Side, action: &ChannelAction, now: i64) -> Result<SideDelta, NodeError> {
    let mut idempotent = false;
    let mut transferred = 0u128;

    match action {
        ChannelAction::IncrementStates => {}

        ChannelAction::OpenVirtual(cond) => {
            if cond.capacity == 0 {
                return Err(NodeError::ProtocolViolation("zero capacity".into()));
            }
            if cond.deadline <= now {
                return Err(NodeError::DeadlineExpired);
            }
            if cond.prepay > cond.capacity + cond.fee {
                return Err(NodeError::ProtocolViolation(
                    "prepay exceeds capacity and fee".into(),
                ));
            }
            let dict_key = cond.dict_key();
            let cell = cond.to_cell()?;
            match side.conditionals.get(dict_key) {
                Some(existing) if existing.hash() == cell.hash() => idempotent = true,
                Some(_) => return Err(NodeError::KeyPrefixCollision),
                None => side.conditionals.set(dict_key, cell),
            }
        }

        ChannelAction::CommitVirtual { key, prepay } => {
            let dict_key = dict_key_for(key);
            let mut cond = match side.condition(dict_key)? {
                Some(cond) if cond.key == *key => cond,
                _ => return Err(NodeError::NotFound),
            };
            if *prepay < cond.prepay {
                return Err(NodeError::ProtocolViolation("prepay decreased".into()));
            }
            if *prepay > cond.capacity + cond.fee {
                return Err(NodeError::ProtocolViolation(
                    "prepay exceeds capacity and fee".into(),
                ));
            }
            let delta = *prepay - cond.prepay;
            if delta == 0 {
                idempotent = true;
            } else {
                cond.prepay = *prepay;
                side.conditionals.set(dict_key, cond.to_cell()?);
                let data = &mut side.signed.state.data;
                data.sent = data
                    .sent
                    .checked_add(delta)
                    .ok_or_else(|| NodeError::ProtocolViolation("amount overflow".into()))?;
                transferred = delta;
            }
        }

        ChannelAction::RemoveVirtual { key } => {
            let dict_key = dict_key_for(key);
            match side.condition(dict_key)? {
                // Absent, or a different channel under the same prefix:
                // nothing of ours to remove.
                Some(cond) if cond.key == *key => {
                    side.conditionals.remove(dict_key);
                }
                _ => idempotent = true,
            }
        }

        ChannelAction::ConfirmClose { key, resolve } => {
            resolve.verify(key)?;
            let dict_key = dict_key_for(key);
            match side.condition(dict_key)? {
                Some(cond) if cond.key == *key => {
                    if now > cond.deadline {
                        return Err(NodeError::DeadlineExpired);
                    }
                    if resolve.amount > cond.capacity {
                        return Err(NodeError::ProtocolViolation(
                            "resolve amount exceeds capacity".into(),
                        ));
                    }
                    side.conditionals.remove(dict_key);
                    // Sent never decreases, even when more was prepaid than
                    // finally resolved.
                    let credit = (resolve.amount + cond.fee).saturating_sub(cond.prepay);
                    if credit > 0 {
                        let data = &mut side.signed.state.data;
                        data.sent = data
                            .sent
                            .checked_add(credit)
                            .ok_or_else(|| NodeError::ProtocolViolation("amount overflow".into()))?;
                        transferred = credit;
                    }
                }
                _ => idempotent = true,
            }
        }
    }

    Ok(SideDelta {
        idempotent,
        transferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Asset, ChannelStatus, OnchainState};

    struct Pair {
        left: Channel,
        right: Channel,
        left_engine: StateEngine,
        right_engine: StateEngine,
    }

    /// Two channel records for the same contract, one per party, each funded
    /// with 1_000_000_000.
    fn pair() -> Pair {
        let left_key = Ed25519Keypair::generate();
        let right_key = Ed25519Keypair::generate();
        let id = [3u8; 16];

        let make = |ours: &Ed25519Keypair, theirs: &Ed25519Keypair, we_left: bool| Channel {
            id,
            address: "contract-1".into(),
            asset: Asset::Native,
            status: ChannelStatus::Active,
            we_left,
            accepting_actions: true,
            our_onchain: {
                let mut st = OnchainState::new(ours.public_key, "our".into());
                st.deposited = 1_000_000_000;
                st
            },
            their_onchain: {
                let mut st = OnchainState::new(theirs.public_key, "their".into());
                st.deposited = 1_000_000_000;
                st
            },
            our: Side::new(id),
            their: Side::new(id),
            init_at: 0,
            created_at: 0,
            last_processed_lt: 0,
            safe_onchain_close_period: 300,
            db_version: 0,
        };

        Pair {
            left: make(&left_key, &right_key, true),
            right: make(&right_key, &left_key, false),
            left_engine: StateEngine::new(left_key),
            right_engine: StateEngine::new(right_key),
        }
    }

    fn condition(key: &Ed25519Keypair, capacity: u128, fee: u128, deadline: i64) -> VirtualChannelCondition {
        VirtualChannelCondition {
            key: key.public_key,
            capacity,
            fee,
            prepay: 0,
            deadline,
        }
    }

    const NOW: i64 = 1_000_000;

    /// Drive one action through both parties: the proposer applies it, the
    /// counterparty validates the produced state.
    fn propose(
        pair: &mut Pair,
        left_proposes: bool,
        action: &ChannelAction,
    ) -> Result<AppliedAction, NodeError> {
        let (proposer, engine, receiver, receiver_engine) = if left_proposes {
            (&mut pair.left, &pair.left_engine, &mut pair.right, &pair.right_engine)
        } else {
            (&mut pair.right, &pair.right_engine, &mut pair.left, &pair.left_engine)
        };
        let applied = engine.apply_our_action(proposer, action, NOW)?;
        receiver_engine.apply_their_action(
            receiver,
            &applied.signed_state,
            applied.proof.as_ref(),
            action,
            NOW,
        )?;
        Ok(applied)
    }

    #[test]
    fn increment_states_advances_seqnos() {
        let mut pair = pair();
        propose(&mut pair, true, &ChannelAction::IncrementStates).unwrap();
        propose(&mut pair, false, &ChannelAction::IncrementStates).unwrap();

        assert_eq!(pair.left.our.signed.state.data.seqno, 1);
        assert_eq!(pair.left.their.signed.state.data.seqno, 1);
        assert_eq!(pair.right.our.signed.state.data.seqno, 1);
        assert_eq!(pair.right.their.signed.state.data.seqno, 1);
    }

    #[test]
    fn open_then_close_credits_amount_and_empties_dict() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();

        propose(&mut pair, true, &ChannelAction::IncrementStates).unwrap();
        propose(&mut pair, false, &ChannelAction::IncrementStates).unwrap();

        let cond = condition(&virtual_key, 100, 0, NOW + 300);
        propose(&mut pair, true, &ChannelAction::OpenVirtual(cond)).unwrap();

        let (balance, locked) = pair.left.balance(false).unwrap();
        assert_eq!(balance, 999_999_900);
        assert_eq!(locked, 100);
        // The counterparty sees the same numbers for us.
        let (their_view, _) = pair.right.balance(true).unwrap();
        assert_eq!(their_view, 999_999_900);

        let resolve = VirtualChannelState::sign(80, &virtual_key).unwrap();
        let close = ChannelAction::ConfirmClose {
            key: virtual_key.public_key,
            resolve,
        };
        let applied = propose(&mut pair, true, &close).unwrap();
        assert_eq!(applied.transferred, 80);

        assert!(pair.left.our.conditionals.is_empty());
        assert!(pair.right.their.conditionals.is_empty());
        assert_eq!(pair.left.our.signed.state.data.sent, 80);

        let (left_balance, _) = pair.left.balance(false).unwrap();
        let (right_balance, _) = pair.right.balance(false).unwrap();
        assert_eq!(left_balance, 999_999_920);
        assert_eq!(right_balance, 1_000_000_080);
    }

    #[test]
    fn idempotent_reapply_is_bit_exact() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let cond = condition(&virtual_key, 50, 1, NOW + 600);
        let action = ChannelAction::OpenVirtual(cond);

        let first = pair
            .left_engine
            .apply_our_action(&mut pair.left, &action, NOW)
            .unwrap();
        assert!(!first.idempotent);
        let seqno = first.signed_state.state.data.seqno;

        let second = pair
            .left_engine
            .apply_our_action(&mut pair.left, &action, NOW)
            .unwrap();
        assert!(second.idempotent);
        assert_eq!(second.signed_state, first.signed_state);
        assert_eq!(second.signed_state.state.data.seqno, seqno);
        assert_eq!(second.signed_state.signature.0, first.signed_state.signature.0);
    }

    #[test]
    fn receiver_acks_identical_reproposal() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let action = ChannelAction::OpenVirtual(condition(&virtual_key, 10, 0, NOW + 60));

        let applied = pair
            .left_engine
            .apply_our_action(&mut pair.left, &action, NOW)
            .unwrap();

        // Delivered twice, e.g. after a timed-out response.
        let first = pair
            .right_engine
            .apply_their_action(&mut pair.right, &applied.signed_state, applied.proof.as_ref(), &action, NOW)
            .unwrap();
        assert!(!first.idempotent);
        let second = pair
            .right_engine
            .apply_their_action(&mut pair.right, &applied.signed_state, applied.proof.as_ref(), &action, NOW)
            .unwrap();
        assert!(second.idempotent);
        assert_eq!(pair.right.their.signed.state.data.seqno, applied.signed_state.state.data.seqno);
    }

    #[test]
    fn seqno_gap_is_rejected() {
        let mut pair = pair();
        propose(&mut pair, true, &ChannelAction::IncrementStates).unwrap();

        // Forge a proposal that skips ahead.
        let mut working = pair.left.clone();
        working.our.signed.state.data.seqno += 1; // pretend one was lost
        let applied = pair
            .left_engine
            .apply_our_action(&mut working, &ChannelAction::IncrementStates, NOW)
            .unwrap();

        let before = pair.right.their.signed.clone();
        let err = pair
            .right_engine
            .apply_their_action(
                &mut pair.right,
                &applied.signed_state,
                applied.proof.as_ref(),
                &ChannelAction::IncrementStates,
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::SeqnoGap { expected: 2, got: 3 }));
        assert_eq!(pair.right.their.signed, before);
    }

    #[test]
    fn tampered_sent_is_rejected() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let action = ChannelAction::OpenVirtual(condition(&virtual_key, 10, 0, NOW + 60));
        let mut applied = pair
            .left_engine
            .apply_our_action(&mut pair.left, &action, NOW)
            .unwrap();

        // Claim more sent than the action allows; signature breaks first.
        applied.signed_state.state.data.sent += 5;
        let err = pair
            .right_engine
            .apply_their_action(&mut pair.right, &applied.signed_state, applied.proof.as_ref(), &action, NOW)
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidSignature));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut pair = pair();
        let imposter = Ed25519Keypair::generate();
        let mut working = pair.left.clone();
        let applied = StateEngine::new(imposter)
            .apply_our_action(&mut working, &ChannelAction::IncrementStates, NOW)
            .unwrap();

        let err = pair
            .right_engine
            .apply_their_action(
                &mut pair.right,
                &applied.signed_state,
                applied.proof.as_ref(),
                &ChannelAction::IncrementStates,
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidSignature));
    }

    #[test]
    fn open_over_balance_is_rejected() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let cond = condition(&virtual_key, 2_000_000_000, 0, NOW + 60);
        let err = pair
            .left_engine
            .apply_our_action(&mut pair.left, &ChannelAction::OpenVirtual(cond), NOW)
            .unwrap_err();
        assert!(matches!(err, NodeError::InsufficientBalance));
    }

    #[test]
    fn expired_condition_cannot_open_or_close() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();

        let expired = condition(&virtual_key, 10, 0, NOW - 1);
        assert!(matches!(
            pair.left_engine
                .apply_our_action(&mut pair.left, &ChannelAction::OpenVirtual(expired), NOW),
            Err(NodeError::DeadlineExpired)
        ));

        // Open a short-lived condition, then try to close past its deadline.
        let cond = condition(&virtual_key, 10, 0, NOW + 5);
        propose(&mut pair, true, &ChannelAction::OpenVirtual(cond)).unwrap();
        let resolve = VirtualChannelState::sign(10, &virtual_key).unwrap();
        let err = pair
            .left_engine
            .apply_our_action(
                &mut pair.left,
                &ChannelAction::ConfirmClose {
                    key: virtual_key.public_key,
                    resolve,
                },
                NOW + 6,
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::DeadlineExpired));

        // Removal stays legal after the deadline.
        let applied = pair
            .left_engine
            .apply_our_action(
                &mut pair.left,
                &ChannelAction::RemoveVirtual {
                    key: virtual_key.public_key,
                },
                NOW + 6,
            )
            .unwrap();
        assert!(!applied.idempotent);
        assert!(pair.left.our.conditionals.is_empty());
    }

    #[test]
    fn key_prefix_collision_is_distinct() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let cond = condition(&virtual_key, 10, 0, NOW + 60);
        pair.left_engine
            .apply_our_action(&mut pair.left, &ChannelAction::OpenVirtual(cond.clone()), NOW)
            .unwrap();

        // Same 4-byte prefix, different content.
        let mut clashing = cond;
        clashing.capacity = 11;
        let err = pair
            .left_engine
            .apply_our_action(&mut pair.left, &ChannelAction::OpenVirtual(clashing), NOW)
            .unwrap_err();
        assert!(matches!(err, NodeError::KeyPrefixCollision));
    }

    #[test]
    fn commit_raises_prepay_monotonically() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let cond = condition(&virtual_key, 100, 5, NOW + 600);
        propose(&mut pair, true, &ChannelAction::OpenVirtual(cond)).unwrap();

        let commit = ChannelAction::CommitVirtual {
            key: virtual_key.public_key,
            prepay: 40,
        };
        let applied = propose(&mut pair, true, &commit).unwrap();
        assert_eq!(applied.transferred, 40);
        assert_eq!(pair.left.our.signed.state.data.sent, 40);

        // Same prepay again: idempotent, no seqno bump.
        let again = pair
            .left_engine
            .apply_our_action(&mut pair.left, &commit, NOW)
            .unwrap();
        assert!(again.idempotent);

        // Lower prepay is a violation.
        let lower = ChannelAction::CommitVirtual {
            key: virtual_key.public_key,
            prepay: 30,
        };
        assert!(matches!(
            pair.left_engine.apply_our_action(&mut pair.left, &lower, NOW),
            Err(NodeError::ProtocolViolation(_))
        ));

        // Close after prepay credits only the remainder plus fee.
        let resolve = VirtualChannelState::sign(90, &virtual_key).unwrap();
        let close = ChannelAction::ConfirmClose {
            key: virtual_key.public_key,
            resolve,
        };
        let applied = propose(&mut pair, true, &close).unwrap();
        assert_eq!(applied.transferred, 90 + 5 - 40);
        assert_eq!(pair.left.our.signed.state.data.sent, 40 + 55);
    }

    #[test]
    fn resolve_above_capacity_is_rejected() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();
        let cond = condition(&virtual_key, 50, 0, NOW + 600);
        propose(&mut pair, true, &ChannelAction::OpenVirtual(cond)).unwrap();

        let resolve = VirtualChannelState::sign(51, &virtual_key).unwrap();
        let err = pair
            .left_engine
            .apply_our_action(
                &mut pair.left,
                &ChannelAction::ConfirmClose {
                    key: virtual_key.public_key,
                    resolve,
                },
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::ProtocolViolation(_)));
    }

    #[test]
    fn conditionals_hash_matches_dictionary_after_every_step() {
        let mut pair = pair();
        let virtual_key = Ed25519Keypair::generate();

        let check = |channel: &Channel| {
            assert_eq!(
                channel.our.signed.state.data.conditionals_hash,
                channel.our.conditionals.root_hash()
            );
            assert_eq!(
                channel.their.signed.state.data.conditionals_hash,
                channel.their.conditionals.root_hash()
            );
        };

        propose(&mut pair, true, &ChannelAction::IncrementStates).unwrap();
        check(&pair.left);
        check(&pair.right);

        let cond = condition(&virtual_key, 10, 0, NOW + 60);
        propose(&mut pair, true, &ChannelAction::OpenVirtual(cond)).unwrap();
        check(&pair.left);
        check(&pair.right);

        let resolve = VirtualChannelState::sign(10, &virtual_key).unwrap();
        propose(
            &mut pair,
            true,
            &ChannelAction::ConfirmClose {
                key: virtual_key.public_key,
                resolve,
            },
        )
        .unwrap();
        check(&pair.left);
        check(&pair.right);
        assert_eq!(pair.left.our.signed.state.data.conditionals_hash, [0u8; 32]);
    }
}
