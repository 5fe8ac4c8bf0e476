//! Dictionary over 32-bit keys with a deterministic cell encoding.
//!
//! The cell form is a label-compressed binary trie. Every node starts with an
//! 8-bit label length and the label bits, followed by a leaf/fork flag:
//! a leaf's label covers all remaining key bits and its single reference is
//! the value cell; a fork consumes one branching bit and references the
//! zero-branch and one-branch subtrees. Equal contents always build an
//! identical tree, so the root hash is a commitment to the full content.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cell::{Cell, CellType};
use crate::{CellBuilder, CellError, CellResult, CellSlice};

const KEY_BITS: usize = 32;

/// An ordered dictionary mapping 32-bit keys to value cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<u32, Arc<Cell>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: u32) -> Option<&Arc<Cell>> {
        self.entries.get(&key)
    }

    pub fn set(&mut self, key: u32, value: Cell) {
        self.entries.insert(key, Arc::new(value));
    }

    pub fn remove(&mut self, key: u32) -> Option<Arc<Cell>> {
        self.entries.remove(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Arc<Cell>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Root cell of the trie, or `None` for an empty dictionary.
    pub fn root_cell(&self) -> Option<Cell> {
        if self.entries.is_empty() {
            return None;
        }
        let entries: Vec<(u32, Arc<Cell>)> =
            self.entries.iter().map(|(k, v)| (*k, v.clone())).collect();
        Some(build_node(&entries, 0))
    }

    /// Commitment hash: the root cell hash, or all zeroes when empty.
    pub fn root_hash(&self) -> [u8; 32] {
        match self.root_cell() {
            Some(root) => root.hash(),
            None => [0u8; 32],
        }
    }

    /// Rebuild a dictionary from its root cell. Fails on pruned branches:
    /// only complete trees can be loaded back.
    pub fn from_root_cell(root: &Cell) -> CellResult<Self> {
        let mut entries = BTreeMap::new();
        collect_entries(root, 0u64, 0, &mut entries)?;
        Ok(Self { entries })
    }

    /// Build a Merkle proof witnessing the given keys: a copy of the trie in
    /// which every branch no key descends into is replaced by a pruned cell.
    /// The proof hashes to [`Self::root_hash`] and supports both membership
    /// (the key's leaf and value are retained) and provable absence (the
    /// divergence point on the key's lookup path is retained).
    ///
    /// Fails with [`CellError::NoSuchKey`] on an empty dictionary, which has
    /// no root to prove against.
    pub fn make_proof(&self, keys: &[u32]) -> CellResult<Cell> {
        let root = self.root_cell().ok_or(CellError::NoSuchKey)?;
        let pruned = prune_for_keys(&root, keys, 0u64, 0)?;
        Ok(crate::proof::wrap_proof(pruned))
    }
}

fn key_bit(key: u32, index: usize) -> u64 {
    (key >> (KEY_BITS - 1 - index)) as u64 & 1
}

/// Label bits of `key` covering `[from_bit, from_bit + len)`.
fn key_segment(key: u32, from_bit: usize, len: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    (key as u64 >> (KEY_BITS - from_bit - len)) & ((1u64 << len) - 1)
}

fn build_node(entries: &[(u32, Arc<Cell>)], from_bit: usize) -> Cell {
    let mut builder = CellBuilder::new();

    if entries.len() == 1 {
        let (key, value) = &entries[0];
        let label_len = KEY_BITS - from_bit;
        builder.store_uint(label_len as u64, 8).expect("label length fits");
        builder
            .store_uint(key_segment(*key, from_bit, label_len), label_len)
            .expect("label fits");
        builder.store_bit(true).expect("leaf flag fits");
        builder.store_ref(value.clone()).expect("leaf value ref");
        return builder.build().expect("node within cell limits");
    }

    // Longest common prefix of the remaining key bits.
    let first = entries[0].0;
    let mut label_len = 0;
    while from_bit + label_len < KEY_BITS
        && entries
            .iter()
            .all(|(k, _)| key_bit(*k, from_bit + label_len) == key_bit(first, from_bit + label_len))
    {
        label_len += 1;
    }

    builder.store_uint(label_len as u64, 8).expect("label length fits");
    builder
        .store_uint(key_segment(first, from_bit, label_len), label_len)
        .expect("label fits");
    builder.store_bit(false).expect("fork flag fits");

    let branch_bit = from_bit + label_len;
    let split = entries.partition_point(|(k, _)| key_bit(*k, branch_bit) == 0);
    let left = build_node(&entries[..split], branch_bit + 1);
    let right = build_node(&entries[split..], branch_bit + 1);
    builder.store_ref(Arc::new(left)).expect("fork left ref");
    builder.store_ref(Arc::new(right)).expect("fork right ref");
    builder.build().expect("node within cell limits")
}

/// Parse one node header: (label_len, label_bits, is_leaf).
pub(crate) fn read_node_header(cell: &Cell) -> CellResult<(usize, u64, bool)> {
    let mut slice = CellSlice::new(cell);
    let label_len = slice.load_uint(8)? as usize;
    if label_len > KEY_BITS {
        return Err(CellError::InvalidData("dictionary label too long".into()));
    }
    let label = slice.load_uint(label_len)?;
    let is_leaf = slice.load_bit()?;
    Ok((label_len, label, is_leaf))
}

fn collect_entries(
    cell: &Cell,
    path: u64,
    path_len: usize,
    out: &mut BTreeMap<u32, Arc<Cell>>,
) -> CellResult<()> {
    if cell.is_pruned() {
        return Err(CellError::Pruned);
    }
    let (label_len, label, is_leaf) = read_node_header(cell)?;
    let path = path << label_len | label;
    let path_len = path_len + label_len;
    if path_len > KEY_BITS {
        return Err(CellError::InvalidData("dictionary path too long".into()));
    }

    if is_leaf {
        if path_len != KEY_BITS {
            return Err(CellError::InvalidData("dictionary leaf at partial key".into()));
        }
        out.insert(path as u32, cell.reference(0)?.clone());
        return Ok(());
    }

    if path_len >= KEY_BITS {
        return Err(CellError::InvalidData("dictionary fork at full key".into()));
    }
    collect_entries(cell.reference(0)?, path << 1, path_len + 1, out)?;
    collect_entries(cell.reference(1)?, path << 1 | 1, path_len + 1, out)
}

fn key_reaches(key: u32, path: u64, path_len: usize) -> bool {
    path_len == 0 || (key as u64) >> (KEY_BITS - path_len) == path
}

fn prune_for_keys(cell: &Cell, keys: &[u32], path: u64, path_len: usize) -> CellResult<Cell> {
    let (label_len, label, is_leaf) = read_node_header(cell)?;
    let path = path << label_len | label;
    let path_len = path_len + label_len;

    if is_leaf {
        let key = path as u32;
        let value = cell.reference(0)?;
        let value = if keys.contains(&key) {
            value.clone()
        } else {
            Arc::new(Cell::pruned(value.hash(), value.depth()))
        };
        return Ok(Cell::new_unchecked(
            CellType::Ordinary,
            cell.data().to_vec(),
            cell.bit_len(),
            vec![value],
        ));
    }

    let mut references = Vec::with_capacity(2);
    for branch in 0..2u64 {
        let child = cell.reference(branch as usize)?;
        let child_path = path << 1 | branch;
        let child_len = path_len + 1;
        if keys.iter().any(|k| key_reaches(*k, child_path, child_len)) {
            references.push(Arc::new(prune_for_keys(child, keys, child_path, child_len)?));
        } else {
            references.push(Arc::new(Cell::pruned(child.hash(), child.depth())));
        }
    }
    Ok(Cell::new_unchecked(
        CellType::Ordinary,
        cell.data().to_vec(),
        cell.bit_len(),
        references,
    ))
}
