//! Sequential reader over a cell's data bits and references.

use std::sync::Arc;

use crate::cell::Cell;
use crate::{CellError, CellResult};

/// Reader over a [`Cell`], consuming bits and references front to back.
#[derive(Debug)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellSlice<'a> {
    pub fn new(cell: &'a Cell) -> Self {
        Self {
            cell,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    pub fn bits_left(&self) -> usize {
        self.cell.bit_len() - self.bit_pos
    }

    pub fn refs_left(&self) -> usize {
        self.cell.reference_count() - self.ref_pos
    }

    pub fn load_bit(&mut self) -> CellResult<bool> {
        let bit = self.cell.get_bit(self.bit_pos).ok_or(CellError::DataUnderflow {
            requested: 1,
            left: 0,
        })?;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Read `bits` bits as an unsigned big-endian integer.
    pub fn load_uint(&mut self, bits: usize) -> CellResult<u64> {
        debug_assert!(bits <= 64);
        if bits > self.bits_left() {
            return Err(CellError::DataUnderflow {
                requested: bits,
                left: self.bits_left(),
            });
        }
        let mut value = 0u64;
        for _ in 0..bits {
            value = value << 1 | self.load_bit()? as u64;
        }
        Ok(value)
    }

    pub fn load_u8(&mut self) -> CellResult<u8> {
        Ok(self.load_uint(8)? as u8)
    }

    pub fn load_u16(&mut self) -> CellResult<u16> {
        Ok(self.load_uint(16)? as u16)
    }

    pub fn load_u32(&mut self) -> CellResult<u32> {
        Ok(self.load_uint(32)? as u32)
    }

    pub fn load_u64(&mut self) -> CellResult<u64> {
        self.load_uint(64)
    }

    pub fn load_bytes(&mut self, len: usize) -> CellResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.load_u8()?);
        }
        Ok(bytes)
    }

    /// Read an amount in the variable-length coin encoding.
    pub fn load_coins(&mut self) -> CellResult<u128> {
        let byte_len = self.load_uint(4)? as usize;
        let mut value = 0u128;
        for _ in 0..byte_len {
            value = value << 8 | self.load_u8()? as u128;
        }
        Ok(value)
    }

    pub fn load_ref(&mut self) -> CellResult<&'a Arc<Cell>> {
        let reference = self.cell.reference(self.ref_pos)?;
        self.ref_pos += 1;
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellBuilder;

    #[test]
    fn underflow_is_reported() {
        let mut builder = CellBuilder::new();
        builder.store_u8(1).unwrap();
        let cell = builder.build().unwrap();

        let mut slice = CellSlice::new(&cell);
        slice.load_u8().unwrap();
        assert!(matches!(
            slice.load_bit(),
            Err(CellError::DataUnderflow { .. })
        ));
    }

    #[test]
    fn missing_ref_is_reported() {
        let cell = Cell::empty();
        let mut slice = CellSlice::new(&cell);
        assert!(matches!(slice.load_ref(), Err(CellError::NoSuchRef(0))));
    }
}
