//! Bit-level cell construction.

use std::sync::Arc;

use crate::cell::{Cell, CellType};
use crate::{CellError, CellResult, MAX_CELL_BITS, MAX_CELL_REFS};

/// Builder accumulating data bits and references for a new [`Cell`].
#[derive(Debug, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    references: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits_left(&self) -> usize {
        MAX_CELL_BITS - self.bit_len
    }

    pub fn refs_left(&self) -> usize {
        MAX_CELL_REFS - self.references.len()
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    fn ensure_bits(&self, requested: usize) -> CellResult<()> {
        if self.bit_len + requested > MAX_CELL_BITS {
            return Err(CellError::DataOverflow {
                used: self.bit_len,
                requested,
                max: MAX_CELL_BITS,
            });
        }
        Ok(())
    }

    pub fn store_bit(&mut self, bit: bool) -> CellResult<&mut Self> {
        self.ensure_bits(1)?;
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let idx = self.bit_len / 8;
            self.data[idx] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    /// Store the low `bits` bits of `value`, most significant first.
    pub fn store_uint(&mut self, value: u64, bits: usize) -> CellResult<&mut Self> {
        debug_assert!(bits <= 64);
        self.ensure_bits(bits)?;
        for i in (0..bits).rev() {
            self.store_bit(value >> i & 1 != 0)?;
        }
        Ok(self)
    }

    pub fn store_u8(&mut self, value: u8) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 8)
    }

    pub fn store_u16(&mut self, value: u16) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 16)
    }

    pub fn store_u32(&mut self, value: u32) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 32)
    }

    pub fn store_u64(&mut self, value: u64) -> CellResult<&mut Self> {
        self.store_uint(value, 64)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> CellResult<&mut Self> {
        self.ensure_bits(bytes.len() * 8)?;
        if self.bit_len % 8 == 0 {
            self.data.extend_from_slice(bytes);
            self.bit_len += bytes.len() * 8;
        } else {
            for byte in bytes {
                self.store_uint(*byte as u64, 8)?;
            }
        }
        Ok(self)
    }

    /// Store an amount in the on-chain variable-length coin encoding:
    /// a 4-bit byte count followed by that many big-endian bytes.
    pub fn store_coins(&mut self, amount: u128) -> CellResult<&mut Self> {
        let bytes = amount.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        self.store_uint(significant.len() as u64, 4)?;
        self.store_bytes(significant)?;
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> CellResult<&mut Self> {
        if self.references.len() >= MAX_CELL_REFS {
            return Err(CellError::TooManyRefs);
        }
        self.references.push(cell);
        Ok(self)
    }

    pub fn build(self) -> CellResult<Cell> {
        Ok(Cell::new_unchecked(
            CellType::Ordinary,
            self.data,
            self.bit_len,
            self.references,
        ))
    }
}
