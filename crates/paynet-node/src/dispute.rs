//! Uncooperative-close pipeline: contract message bodies and the task
//! schedule that drives start → challenge → settle → finalize.

use std::sync::Arc;

use paynet_cell::{boc, Cell, CellBuilder, Dictionary};
use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::error::NodeError;
use crate::semichannel::{SignedSemiChannel, VirtualChannelState};
use crate::types::Channel;

// Channel contract operation codes (ASCII tags of the payment-channel
// contract scheme).
pub const OP_START_UNCOOPERATIVE_CLOSE: u32 = 0x556e436c; // "UnCl"
pub const OP_CHALLENGE_QUARANTINED_STATE: u32 = 0x43686751; // "ChgQ"
pub const OP_SETTLE_CONDITIONALS: u32 = 0x436c436e; // "ClCn"
pub const OP_FINISH_UNCOOPERATIVE_CLOSE: u32 = 0x466e436c; // "FnCl"
pub const OP_COOPERATIVE_CLOSE: u32 = 0x436c6f73; // "Clos"
pub const OP_TOP_UP_BALANCE: u32 = 0x67c7d281;

/// Task kinds of the pipeline, in execution order.
pub const KIND_UNCOOPERATIVE_CLOSE: &str = "uncooperative-close";
pub const KIND_CHALLENGE: &str = "challenge";
pub const KIND_SETTLE_CONDITIONALS: &str = "settle-conditionals";
pub const KIND_FINALIZE: &str = "finalize";

/// Payload shared by all pipeline tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputePayload {
    pub channel: String,
}

/// Submit both latest signed semi-channel states to open the quarantine.
pub fn build_start_uncooperative_close_body(
    signed_by_us_left: bool,
    our: &SignedSemiChannel,
    their: &SignedSemiChannel,
) -> Result<Cell, NodeError> {
    let (left, right) = if signed_by_us_left { (our, their) } else { (their, our) };
    let mut builder = CellBuilder::new();
    builder.store_u32(OP_START_UNCOOPERATIVE_CLOSE)?;
    builder.store_bit(signed_by_us_left)?;
    builder.store_ref(Arc::new(left.to_cell()?))?;
    builder.store_ref(Arc::new(right.to_cell()?))?;
    Ok(builder.build()?)
}

/// Override the quarantined state with a strictly newer signed state from
/// the counterparty.
pub fn build_challenge_body(
    challenger_is_left: bool,
    their_newer: &SignedSemiChannel,
) -> Result<Cell, NodeError> {
    let mut builder = CellBuilder::new();
    builder.store_u32(OP_CHALLENGE_QUARANTINED_STATE)?;
    builder.store_bit(challenger_is_left)?;
    builder.store_ref(Arc::new(their_newer.to_cell()?))?;
    Ok(builder.build()?)
}

/// Settle the counterparty's conditionals with the strongest resolves we
/// hold: a dictionary from condition key to resolve, plus the Merkle proof
/// of the conditionals being settled.
pub fn build_settle_conditionals_body(
    settler_is_left: bool,
    conditionals_proof: Option<&Cell>,
    resolves: &[(u32, VirtualChannelState)],
) -> Result<Cell, NodeError> {
    let mut dict = Dictionary::new();
    for (dict_key, resolve) in resolves {
        dict.set(*dict_key, resolve.to_cell()?);
    }

    let mut builder = CellBuilder::new();
    builder.store_u32(OP_SETTLE_CONDITIONALS)?;
    builder.store_bit(settler_is_left)?;
    match dict.root_cell() {
        Some(root) => {
            builder.store_bit(true)?;
            builder.store_ref(Arc::new(root))?;
        }
        None => {
            builder.store_bit(false)?;
        }
    }
    match conditionals_proof {
        Some(proof) => {
            builder.store_bit(true)?;
            builder.store_ref(Arc::new(proof.clone()))?;
        }
        None => {
            builder.store_bit(false)?;
        }
    }
    Ok(builder.build()?)
}

pub fn build_finalize_body() -> Result<Cell, NodeError> {
    let mut builder = CellBuilder::new();
    builder.store_u32(OP_FINISH_UNCOOPERATIVE_CLOSE)?;
    Ok(builder.build()?)
}

/// Cooperative close: the full state signed by both parties.
pub fn build_cooperative_close_body(channel: &Channel) -> Result<Cell, NodeError> {
    let (left, right) = if channel.we_left {
        (&channel.our, &channel.their)
    } else {
        (&channel.their, &channel.our)
    };
    let mut builder = CellBuilder::new();
    builder.store_u32(OP_COOPERATIVE_CLOSE)?;
    builder.store_ref(Arc::new(left.signed.to_cell()?))?;
    builder.store_ref(Arc::new(right.signed.to_cell()?))?;
    Ok(builder.build()?)
}

/// Top up one party's balance by `amount`.
pub fn build_topup_body(to_left: bool, amount: u128) -> Result<Cell, NodeError> {
    let mut builder = CellBuilder::new();
    builder.store_u32(OP_TOP_UP_BALANCE)?;
    builder.store_bit(to_left)?;
    builder.store_coins(amount)?;
    Ok(builder.build()?)
}

/// One follow-up step of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeStep {
    pub kind: &'static str,
    /// Unix nanoseconds the on-chain window opens.
    pub execute_after: i64,
    /// Unix nanoseconds after which the step is pointless.
    pub execute_till: i64,
}

const NANOS: i64 = 1_000_000_000;

/// Follow-up schedule once an uncooperative close was submitted at
/// `started_at` (unix seconds). Each step fires when its on-chain window
/// unlocks and expires with a safety margin past the window.
pub fn follow_up_steps(cfg: &ChannelConfig, started_at: i64) -> [DisputeStep; 3] {
    let quarantine_end = started_at + cfg.quarantine_duration;
    let settle_end = quarantine_end + cfg.conditional_close_duration;
    let margin = cfg.buffer_to_commit;
    let mut steps = [
        DisputeStep {
            kind: KIND_CHALLENGE,
            execute_after: started_at * NANOS,
            execute_till: quarantine_end * NANOS,
        },
        DisputeStep {
            kind: KIND_SETTLE_CONDITIONALS,
            execute_after: quarantine_end * NANOS,
            execute_till: (settle_end + margin) * NANOS,
        },
        DisputeStep {
            kind: KIND_FINALIZE,
            execute_after: settle_end * NANOS,
            execute_till: (settle_end + cfg.quarantine_duration + margin) * NANOS,
        },
    ];
    // The order index keys on (ready-at, queue); equal ready-times within one
    // queue would collide, so keep them strictly increasing even with
    // zero-length windows.
    for i in 1..steps.len() {
        if steps[i].execute_after <= steps[i - 1].execute_after {
            steps[i].execute_after = steps[i - 1].execute_after + 1;
        }
        if steps[i].execute_till <= steps[i].execute_after {
            steps[i].execute_till = steps[i].execute_after + NANOS;
        }
    }
    steps
}

/// Serialize a body cell for submission.
pub fn body_boc(body: &Cell) -> Vec<u8> {
    boc::serialize(body)
}
