//! Bag-of-cells framing: a cell tree as a flat byte string.
//!
//! Cells are deduplicated by hash and written children-first, so every
//! reference points at an already-materialized index. The layout is
//! self-contained and versioned by the leading magic.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::cell::{Cell, CellType};
use crate::{CellError, CellResult};

const BOC_MAGIC: u32 = 0xb5ee9c72;

/// Serialize a cell tree rooted at `root`.
pub fn serialize(root: &Cell) -> Vec<u8> {
    let mut cells: Vec<Arc<Cell>> = Vec::new();
    let mut index: HashMap<[u8; 32], u32> = HashMap::new();
    let root = Arc::new(root.clone());
    let root_index = collect(&root, &mut cells, &mut index);

    let mut out = Vec::new();
    out.extend_from_slice(&BOC_MAGIC.to_be_bytes());
    out.extend_from_slice(&(cells.len() as u32).to_be_bytes());
    out.extend_from_slice(&root_index.to_be_bytes());

    for cell in &cells {
        out.push(cell.cell_type().to_u8());
        out.extend_from_slice(&(cell.bit_len() as u16).to_be_bytes());
        out.extend_from_slice(&cell.data()[..cell.bit_len().div_ceil(8)]);
        out.push(cell.reference_count() as u8);
        for reference in cell.references() {
            let ref_index = index[&reference.hash()];
            out.extend_from_slice(&ref_index.to_be_bytes());
        }
    }
    out
}

fn collect(
    cell: &Arc<Cell>,
    cells: &mut Vec<Arc<Cell>>,
    index: &mut HashMap<[u8; 32], u32>,
) -> u32 {
    let hash = cell.hash();
    if let Some(existing) = index.get(&hash) {
        return *existing;
    }
    for reference in cell.references() {
        collect(reference, cells, index);
    }
    let idx = cells.len() as u32;
    cells.push(cell.clone());
    index.insert(hash, idx);
    idx
}

/// Parse a cell tree serialized by [`serialize`].
pub fn parse(data: &[u8]) -> CellResult<Cell> {
    let mut reader = Reader { data, pos: 0 };

    if reader.read_u32()? != BOC_MAGIC {
        return Err(CellError::InvalidData("bad bag-of-cells magic".into()));
    }
    let cell_count = reader.read_u32()? as usize;
    let root_index = reader.read_u32()? as usize;
    if cell_count == 0 || root_index >= cell_count {
        return Err(CellError::InvalidData("bad bag-of-cells header".into()));
    }

    let mut cells: Vec<Arc<Cell>> = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        let cell_type = CellType::from_u8(reader.read_u8()?)?;
        let bit_len = reader.read_u16()? as usize;
        if bit_len > crate::MAX_CELL_BITS {
            return Err(CellError::InvalidData("cell bit length out of range".into()));
        }
        let byte_len = bit_len.div_ceil(8);
        let data = reader.read_bytes(byte_len)?.to_vec();
        let ref_count = reader.read_u8()? as usize;
        if ref_count > crate::MAX_CELL_REFS {
            return Err(CellError::TooManyRefs);
        }
        let mut references = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let ref_index = reader.read_u32()? as usize;
            // Children always precede their parents.
            let reference = cells
                .get(ref_index)
                .ok_or_else(|| CellError::InvalidData("forward cell reference".into()))?;
            references.push(reference.clone());
        }
        let cell = Cell::new_unchecked(cell_type, data, bit_len, references);
        cell.check_limits()?;
        cells.push(Arc::new(cell));
    }

    Ok((*cells[root_index]).clone())
}

/// Serialize to base64, the form embedded in JSON blobs.
pub fn to_base64(root: &Cell) -> String {
    BASE64.encode(serialize(root))
}

/// Parse a base64 bag-of-cells.
pub fn from_base64(encoded: &str) -> CellResult<Cell> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CellError::InvalidData(format!("bad base64: {e}")))?;
    parse(&bytes)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, len: usize) -> CellResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CellError::InvalidData("truncated bag-of-cells".into()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> CellResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> CellResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> CellResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
