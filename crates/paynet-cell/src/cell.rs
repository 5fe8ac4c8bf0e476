//! The cell itself: immutable data bits plus references, identified by hash.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{CellError, CellResult, MAX_CELL_REFS};

/// Size of a cell hash in bytes.
pub const HASH_BYTES: usize = 32;

/// Kind of a cell.
///
/// Ordinary cells carry data. A pruned branch stands in for a subtree that was
/// cut out of a Merkle proof; it stores the subtree's hash and depth and
/// reports them as its own. A Merkle-proof cell wraps a pruned tree and pins
/// the virtual root hash in its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Ordinary,
    PrunedBranch,
    MerkleProof,
}

impl CellType {
    pub fn is_exotic(&self) -> bool {
        !matches!(self, CellType::Ordinary)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            CellType::Ordinary => 0x00,
            CellType::PrunedBranch => 0x01,
            CellType::MerkleProof => 0x03,
        }
    }

    pub(crate) fn from_u8(value: u8) -> CellResult<Self> {
        match value {
            0x00 => Ok(CellType::Ordinary),
            0x01 => Ok(CellType::PrunedBranch),
            0x03 => Ok(CellType::MerkleProof),
            other => Err(CellError::InvalidData(format!(
                "unknown cell type byte 0x{other:02x}"
            ))),
        }
    }
}

/// An immutable cell: up to 1023 data bits and up to four references.
#[derive(Clone, PartialEq, Eq)]
pub struct Cell {
    cell_type: CellType,
    data: Vec<u8>,
    bit_len: usize,
    references: Vec<Arc<Cell>>,
}

impl Cell {
    /// Empty ordinary cell.
    pub fn empty() -> Self {
        Self {
            cell_type: CellType::Ordinary,
            data: Vec::new(),
            bit_len: 0,
            references: Vec::new(),
        }
    }

    pub(crate) fn new_unchecked(
        cell_type: CellType,
        data: Vec<u8>,
        bit_len: usize,
        references: Vec<Arc<Cell>>,
    ) -> Self {
        Self {
            cell_type,
            data,
            bit_len,
            references,
        }
    }

    /// A pruned branch standing in for a subtree with the given hash and depth.
    pub fn pruned(hash: [u8; HASH_BYTES], depth: u16) -> Self {
        let mut data = Vec::with_capacity(1 + HASH_BYTES + 2);
        data.push(CellType::PrunedBranch.to_u8());
        data.extend_from_slice(&hash);
        data.extend_from_slice(&depth.to_be_bytes());
        Self {
            cell_type: CellType::PrunedBranch,
            data,
            bit_len: (1 + HASH_BYTES + 2) * 8,
            references: Vec::new(),
        }
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn is_pruned(&self) -> bool {
        self.cell_type == CellType::PrunedBranch
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn references(&self) -> &[Arc<Cell>] {
        &self.references
    }

    pub fn reference(&self, index: usize) -> CellResult<&Arc<Cell>> {
        self.references.get(index).ok_or(CellError::NoSuchRef(index))
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Hash of the subtree this pruned branch stands in for.
    pub fn pruned_hash(&self) -> CellResult<[u8; HASH_BYTES]> {
        if self.cell_type != CellType::PrunedBranch || self.data.len() < 1 + HASH_BYTES + 2 {
            return Err(CellError::InvalidData("not a pruned branch".into()));
        }
        let mut hash = [0u8; HASH_BYTES];
        hash.copy_from_slice(&self.data[1..1 + HASH_BYTES]);
        Ok(hash)
    }

    /// Cell hash.
    ///
    /// A pruned branch reports the hash of the subtree it replaces, so a tree
    /// containing pruned branches hashes identically to the full tree.
    pub fn hash(&self) -> [u8; HASH_BYTES] {
        if self.cell_type == CellType::PrunedBranch {
            let mut hash = [0u8; HASH_BYTES];
            hash.copy_from_slice(&self.data[1..1 + HASH_BYTES]);
            return hash;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.representation());
        hasher.finalize().into()
    }

    /// Depth of the tree rooted at this cell; pruned branches report the
    /// recorded depth of the subtree they replace.
    pub fn depth(&self) -> u16 {
        if self.cell_type == CellType::PrunedBranch {
            let at = 1 + HASH_BYTES;
            return u16::from_be_bytes([self.data[at], self.data[at + 1]]);
        }
        self.references
            .iter()
            .map(|r| r.depth().saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// The byte string that is hashed: descriptors, padded data, then the
    /// depth and hash of every reference.
    fn representation(&self) -> Vec<u8> {
        let (d1, d2) = self.descriptors();
        let mut repr = Vec::with_capacity(2 + self.data.len() + self.references.len() * 34);
        repr.push(d1);
        repr.push(d2);
        repr.extend_from_slice(&self.data_with_completion_tag());
        for reference in &self.references {
            repr.extend_from_slice(&reference.depth().to_be_bytes());
        }
        for reference in &self.references {
            repr.extend_from_slice(&reference.hash());
        }
        repr
    }

    /// Standard cell descriptors: reference count with the exotic flag, and
    /// the floor + ceil byte length of the data bits.
    pub(crate) fn descriptors(&self) -> (u8, u8) {
        let d1 = self.references.len() as u8 + if self.cell_type.is_exotic() { 8 } else { 0 };
        let d2 = (self.bit_len / 8 + self.bit_len.div_ceil(8)) as u8;
        (d1, d2)
    }

    /// Data bytes with the completion tag: a single 1-bit after the payload
    /// when the bit length is not byte aligned.
    pub(crate) fn data_with_completion_tag(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        if self.bit_len % 8 != 0 {
            let last = self.bit_len / 8;
            data.truncate(last + 1);
            data[last] |= 0x80 >> (self.bit_len % 8);
        } else {
            data.truncate(self.bit_len / 8);
        }
        data
    }

    /// Value of the data bit at `index`, if in range.
    pub fn get_bit(&self, index: usize) -> Option<bool> {
        if index >= self.bit_len {
            return None;
        }
        Some(self.data[index / 8] & (0x80 >> (index % 8)) != 0)
    }

    /// Sanity check used when accepting cells from the outside.
    pub(crate) fn check_limits(&self) -> CellResult<()> {
        if self.references.len() > MAX_CELL_REFS {
            return Err(CellError::TooManyRefs);
        }
        if self.bit_len > crate::MAX_CELL_BITS {
            return Err(CellError::DataOverflow {
                used: self.bit_len,
                requested: 0,
                max: crate::MAX_CELL_BITS,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("type", &self.cell_type)
            .field("bits", &self.bit_len)
            .field("refs", &self.references.len())
            .field("hash", &hex::encode(&self.hash()[..8]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellBuilder;

    #[test]
    fn empty_cell_hash_is_stable() {
        assert_eq!(Cell::empty().hash(), Cell::empty().hash());
    }

    #[test]
    fn hash_covers_data_and_refs() {
        let mut a = CellBuilder::new();
        a.store_u32(1).unwrap();
        let a = a.build().unwrap();

        let mut b = CellBuilder::new();
        b.store_u32(2).unwrap();
        let b = b.build().unwrap();

        assert_ne!(a.hash(), b.hash());

        let mut outer1 = CellBuilder::new();
        outer1.store_ref(Arc::new(a.clone())).unwrap();
        let outer1 = outer1.build().unwrap();

        let mut outer2 = CellBuilder::new();
        outer2.store_ref(Arc::new(b)).unwrap();
        let outer2 = outer2.build().unwrap();

        assert_ne!(outer1.hash(), outer2.hash());

        let mut outer3 = CellBuilder::new();
        outer3.store_ref(Arc::new(a)).unwrap();
        assert_eq!(outer1.hash(), outer3.build().unwrap().hash());
    }

    #[test]
    fn pruned_branch_reports_replaced_hash_and_depth() {
        let mut inner = CellBuilder::new();
        inner.store_u64(42).unwrap();
        let inner = inner.build().unwrap();

        let pruned = Cell::pruned(inner.hash(), inner.depth());
        assert_eq!(pruned.hash(), inner.hash());
        assert_eq!(pruned.depth(), inner.depth());

        // A parent hashes the same whether the child is present or pruned.
        let mut full = CellBuilder::new();
        full.store_bit(true).unwrap();
        full.store_ref(Arc::new(inner)).unwrap();
        let full = full.build().unwrap();

        let mut cut = CellBuilder::new();
        cut.store_bit(true).unwrap();
        cut.store_ref(Arc::new(pruned)).unwrap();
        let cut = cut.build().unwrap();

        assert_eq!(full.hash(), cut.hash());
    }

    #[test]
    fn completion_tag_distinguishes_bit_lengths() {
        let mut a = CellBuilder::new();
        a.store_bit(true).unwrap();
        let a = a.build().unwrap();

        let mut b = CellBuilder::new();
        b.store_bit(true).unwrap();
        b.store_bit(false).unwrap();
        let b = b.build().unwrap();

        assert_ne!(a.hash(), b.hash());
    }
}
