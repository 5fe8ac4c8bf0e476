//! Cell primitives for the payment network node.
//!
//! Off-chain channel state is exchanged and hashed in the same shape the
//! channel contract understands on-chain: trees of *cells*. A cell carries up
//! to 1023 data bits and up to four references to other cells, and its hash
//! covers both, so a single 32-byte digest commits to an arbitrary tree.
//!
//! On top of the plain cell model this crate provides the two structures the
//! channel state engine needs:
//!
//! - [`Dictionary`] — a label-compressed binary trie keyed by 32-bit integers
//!   with a deterministic cell encoding, used for the per-side conditionals
//!   of a channel. Equal contents always produce an equal root hash.
//! - Merkle proofs ([`dict::Dictionary::make_proof`], [`proof`]) — a copy of
//!   the dictionary tree in which every branch not needed to witness a set of
//!   keys is replaced by a *pruned* cell carrying only the branch hash. The
//!   proof hashes to the same root as the full dictionary, so a counterparty
//!   can check a single-key change against the committed `conditionals_hash`
//!   without seeing unrelated entries.
//!
//! [`boc`] serializes a cell tree to bytes and back for storage and the wire.

pub mod boc;
pub mod builder;
pub mod cell;
pub mod dict;
pub mod proof;
pub mod slice;

pub use builder::CellBuilder;
pub use cell::{Cell, CellType, HASH_BYTES};
pub use dict::Dictionary;
pub use proof::{proof_lookup, unwrap_proof, wrap_proof};
pub use slice::CellSlice;

use thiserror::Error;

/// Maximum number of data bits in a single cell.
pub const MAX_CELL_BITS: usize = 1023;

/// Maximum number of references in a single cell.
pub const MAX_CELL_REFS: usize = 4;

/// Errors produced by cell construction, parsing and proof checking.
#[derive(Debug, Error)]
pub enum CellError {
    /// Writing past the cell data capacity.
    #[error("cell data overflow: {used} + {requested} bits exceeds {max}")]
    DataOverflow {
        used: usize,
        requested: usize,
        max: usize,
    },

    /// Reading past the end of the available data bits.
    #[error("cell data underflow: tried to read {requested} bits, {left} left")]
    DataUnderflow { requested: usize, left: usize },

    /// Adding a fifth reference.
    #[error("too many cell references")]
    TooManyRefs,

    /// Reading a reference that does not exist.
    #[error("no such cell reference: index {0}")]
    NoSuchRef(usize),

    /// A traversal reached a pruned branch that the proof did not retain.
    #[error("pruned branch reached during traversal")]
    Pruned,

    /// Malformed serialized data.
    #[error("invalid cell data: {0}")]
    InvalidData(String),

    /// The requested dictionary key is absent.
    #[error("no such key in dictionary")]
    NoSuchKey,

    /// A Merkle proof does not match the expected root hash.
    #[error("proof hash mismatch")]
    ProofMismatch,
}

/// Result alias used throughout the crate.
pub type CellResult<T> = Result<T, CellError>;
