//! Merkle-proof wrapper cells and proof-side dictionary lookup.

use std::sync::Arc;

use crate::cell::{Cell, CellType, HASH_BYTES};
use crate::dict::read_node_header;
use crate::{CellError, CellResult};

/// Wrap a (possibly pruned) tree into a Merkle-proof cell. The wrapper's data
/// pins the virtual root hash and depth; its single reference is the tree.
pub fn wrap_proof(root: Cell) -> Cell {
    let mut data = Vec::with_capacity(1 + HASH_BYTES + 2);
    data.push(CellType::MerkleProof.to_u8());
    data.extend_from_slice(&root.hash());
    data.extend_from_slice(&root.depth().to_be_bytes());
    let bit_len = data.len() * 8;
    Cell::new_unchecked(CellType::MerkleProof, data, bit_len, vec![Arc::new(root)])
}

/// Check a Merkle-proof cell against the expected root hash and return the
/// proven tree.
pub fn unwrap_proof<'a>(proof: &'a Cell, expected_hash: &[u8; HASH_BYTES]) -> CellResult<&'a Arc<Cell>> {
    if proof.cell_type() != CellType::MerkleProof {
        return Err(CellError::InvalidData("not a merkle proof cell".into()));
    }
    if proof.data().len() < 1 + HASH_BYTES + 2 {
        return Err(CellError::InvalidData("merkle proof cell too short".into()));
    }
    let claimed = &proof.data()[1..1 + HASH_BYTES];
    let tree = proof.reference(0)?;
    if claimed != &expected_hash[..] || tree.hash() != *expected_hash {
        return Err(CellError::ProofMismatch);
    }
    Ok(tree)
}

/// Look up `key` in a proof tree produced by
/// [`crate::Dictionary::make_proof`].
///
/// Returns the value cell when the key is proven present (the value itself may
/// be pruned if it was not a witnessed key), `None` when the key is proven
/// absent, and [`CellError::Pruned`] when the proof does not cover the key's
/// path at all.
pub fn proof_lookup(root: &Arc<Cell>, key: u32) -> CellResult<Option<Arc<Cell>>> {
    let mut current = root.clone();
    let mut cursor = 0usize;

    loop {
        if current.is_pruned() {
            return Err(CellError::Pruned);
        }
        let (label_len, label, is_leaf) = read_node_header(&current)?;
        if cursor + label_len > 32 {
            return Err(CellError::InvalidData("proof path exceeds key width".into()));
        }
        let expected = if label_len == 0 {
            0
        } else {
            (key as u64 >> (32 - cursor - label_len)) & ((1u64 << label_len) - 1)
        };
        if label != expected {
            // The trie provably contains no key along this path.
            return Ok(None);
        }
        cursor += label_len;

        if is_leaf {
            if cursor != 32 {
                return Err(CellError::InvalidData("proof leaf at partial key".into()));
            }
            return Ok(Some(current.reference(0)?.clone()));
        }

        if cursor >= 32 {
            return Err(CellError::InvalidData("proof fork at full key".into()));
        }
        let bit = (key >> (31 - cursor)) & 1;
        let next = current.reference(bit as usize)?.clone();
        current = next;
        cursor += 1;
    }
}
