//! # NCER cell banks
//!
//! A cell bank groups positioned sub-images ("cells") into sprites. Each
//! cell is three packed 16-bit attribute words selecting a tile run, a
//! palette, a size class and either flip flags or rotate/scale
//! parameters. Banks are decoded into draw order, assigned export
//! layers, and checked for structural duplicates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::Cursor;

use log::debug;
use twox_hash::XxHash64;

use crate::binary_utils::{read_i16_le, read_u16_le, read_u32_le, seek_to, skip};
use crate::nitro::layers::assign_layers;
use crate::nitro::NitroError;

/// Cell pixel dimensions by (shape, size class).
pub const CELL_SIZE_TABLE: [[(u16, u16); 4]; 3] = [
    [(8, 8), (16, 16), (32, 32), (64, 64)],
    [(16, 8), (32, 8), (32, 16), (64, 32)],
    [(8, 16), (8, 32), (16, 32), (32, 64)],
];

/// Attribute bits that differ between the two cell flavours. The
/// discriminator bit reuses the same positions for flip flags and for
/// the transform parameter selector, so only one set is ever valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellAttrs {
    Normal {
        x_flip: bool,
        y_flip: bool,
        disabled: bool,
    },
    RotateScale {
        double_size: bool,
        /// Transform parameter selector, 5 bits.
        param: u8,
    },
}

impl CellAttrs {
    pub fn x_flip(&self) -> bool {
        matches!(self, CellAttrs::Normal { x_flip: true, .. })
    }

    pub fn y_flip(&self) -> bool {
        matches!(self, CellAttrs::Normal { y_flip: true, .. })
    }

    pub fn flipped(&self) -> bool {
        self.x_flip() || self.y_flip()
    }
}

#[derive(Clone, Debug)]
pub struct Cell {
    /// Position relative to the bank's top-left corner after re-origin.
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub shape: u8,
    pub size: u8,
    /// Tile-run start, 10 bits.
    pub tile_offset: u16,
    pub attrs: CellAttrs,
    pub obj_mode: u8,
    pub mosaic: bool,
    pub depth: bool,
    pub priority: u8,
    pub palette: u8,
    /// Export layer, -1 until assigned.
    pub layer: i32,
    /// Declaration order inside the bank.
    pub index: usize,
}

fn decode_cell(obj0: u16, obj1: u16, obj2: u16, index: usize) -> Cell {
    let mut y = (obj0 & 0xFF) as i16;
    if y >= 128 {
        y -= 256;
    }
    let shape = ((obj0 >> 14) & 3) as u8;
    let mut x = (obj1 & 0x01FF) as i16;
    if x >= 0x100 {
        x -= 0x200;
    }
    let size = ((obj1 >> 14) & 3) as u8;
    let tile_offset = obj2 & 0x03FF;

    let rotate_scale = (obj0 >> 8) & 1 == 1;
    let attrs = if rotate_scale {
        CellAttrs::RotateScale {
            double_size: (obj0 >> 9) & 1 == 1,
            param: ((obj1 >> 9) & 0x1F) as u8,
        }
    } else {
        CellAttrs::Normal {
            x_flip: (obj1 >> 12) & 1 == 1,
            y_flip: (obj1 >> 13) & 1 == 1,
            disabled: (obj0 >> 9) & 1 == 1,
        }
    };

    let (width, height) = CELL_SIZE_TABLE[shape as usize][size as usize];
    Cell {
        x,
        y,
        width,
        height,
        shape,
        size,
        tile_offset,
        attrs,
        obj_mode: ((obj0 >> 10) & 3) as u8,
        mosaic: (obj0 >> 12) & 1 == 1,
        depth: (obj0 >> 13) & 1 == 1,
        priority: ((obj2 >> 10) & 3) as u8,
        palette: ((obj2 >> 12) & 0xF) as u8,
        layer: -1,
        index,
    }
}

#[derive(Debug, Default)]
pub struct Bank {
    /// Cells in draw order: descending (priority, declaration order).
    pub cells: Vec<Cell>,
    pub width: i32,
    pub height: i32,
    pub partition_offset: u32,
    pub partition_size: u32,
    pub layer_count: u32,
    pub duplicate: bool,
}

impl Bank {
    /// Per-cell structural signature; position, flip and palette are
    /// deliberately excluded so visually identical banks match.
    fn signature(&self) -> Vec<(u16, u16, u16)> {
        self.cells
            .iter()
            .map(|c| (c.width, c.height, c.tile_offset))
            .collect()
    }
}

pub struct CellBankSet {
    pub banks: Vec<Bank>,
    /// Tile-offset shift exponent shared by every bank.
    pub block_size: u32,
    /// Banks carry explicit bounding boxes.
    pub explicit_bounds: bool,
    pub max_partition_size: u32,
}

/// Decode an NCER cell bank file.
pub fn read_ncer(data: &[u8]) -> Result<CellBankSet, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 24)?;
    let bank_count = read_u16_le(&mut cursor)? as usize;
    let table_kind = read_u16_le(&mut cursor)?;
    let bank_offset = read_u32_le(&mut cursor)?;
    let block_size = read_u32_le(&mut cursor)? & 0xFF;
    let partition_offset = read_u32_le(&mut cursor)?;
    let explicit_bounds = table_kind == 0x01;

    let mut banks: Vec<Bank> = (0..bank_count).map(|_| Bank::default()).collect();

    // Partition directory: per-bank slice of the shared tile run.
    let mut max_partition_size = 0;
    if partition_offset > 0 {
        seek_to(&mut cursor, 16 + partition_offset as u64 + 8)?;
        max_partition_size = read_u32_le(&mut cursor)?;
        let first_partition_offset = read_u32_le(&mut cursor)?;
        let back = first_partition_offset.checked_sub(8).ok_or_else(|| {
            NitroError::format(
                "NCER",
                format!("partition offset {} before directory", first_partition_offset),
            )
        })?;
        skip(&mut cursor, back as i64)?;
        for bank in banks.iter_mut() {
            bank.partition_offset = read_u32_le(&mut cursor)?;
            bank.partition_size = read_u32_le(&mut cursor)?;
        }
    }
    debug!(
        "NCER {} banks, table kind {}, block size {}",
        bank_count, table_kind, block_size
    );

    let record_size = if explicit_bounds { 0x10u64 } else { 8 };
    seek_to(&mut cursor, 16 + bank_offset as u64 + 8)?;
    for i in 0..bank_count {
        let cell_count = read_u16_le(&mut cursor)? as usize;
        let _cell_info = read_u16_le(&mut cursor)?;
        let cell_offset = read_u32_le(&mut cursor)?;
        if explicit_bounds {
            let xmax = read_i16_le(&mut cursor)?;
            let ymax = read_i16_le(&mut cursor)?;
            let xmin = read_i16_le(&mut cursor)?;
            let ymin = read_i16_le(&mut cursor)?;
            banks[i].width = xmax as i32 - xmin as i32 + 1;
            banks[i].height = ymax as i32 - ymin as i32 + 1;
        }
        let record_end = cursor.position();

        // Cell arrays start past the end of the bank table.
        let remaining_records = (bank_count - (i + 1)) as u64;
        seek_to(
            &mut cursor,
            record_end + remaining_records * record_size + cell_offset as u64,
        )?;
        let mut cells = Vec::with_capacity(cell_count);
        for j in 0..cell_count {
            let obj0 = read_u16_le(&mut cursor)?;
            let obj1 = read_u16_le(&mut cursor)?;
            let obj2 = read_u16_le(&mut cursor)?;
            cells.push(decode_cell(obj0, obj1, obj2, j));
        }

        // Re-origin every cell to the bounding box so (0, 0) is the
        // bank's visual top-left.
        if !cells.is_empty() {
            let min_x = cells.iter().map(|c| c.x as i32).min().unwrap_or(0);
            let min_y = cells.iter().map(|c| c.y as i32).min().unwrap_or(0);
            let max_x = cells
                .iter()
                .map(|c| c.x as i32 + c.width as i32)
                .max()
                .unwrap_or(0);
            let max_y = cells
                .iter()
                .map(|c| c.y as i32 + c.height as i32)
                .max()
                .unwrap_or(0);
            if !explicit_bounds {
                banks[i].width = max_x - min_x;
                banks[i].height = max_y - min_y;
            }
            for cell in &mut cells {
                cell.x -= min_x as i16;
                cell.y -= min_y as i16;
            }
        }

        banks[i].layer_count = assign_layers(&mut cells);
        // Descending (priority, declaration order): draw order.
        cells.sort_by(|a, b| (b.priority, b.index).cmp(&(a.priority, a.index)));
        banks[i].cells = cells;

        seek_to(&mut cursor, record_end)?;
    }

    mark_duplicates(&mut banks);
    debug!("Loaded {} banks", banks.len());
    Ok(CellBankSet {
        banks,
        block_size,
        explicit_bounds,
        max_partition_size,
    })
}

/// Mark every bank whose structural signature was already seen. The
/// first occurrence stays authoritative; duplicates are skipped by the
/// compositor and re-encoder.
fn mark_duplicates(banks: &mut [Bank]) {
    let mut seen: HashMap<Vec<(u16, u16, u16)>, usize, BuildHasherDefault<XxHash64>> =
        HashMap::default();
    for (idx, bank) in banks.iter_mut().enumerate() {
        match seen.entry(bank.signature()) {
            Entry::Occupied(_) => bank.duplicate = true,
            Entry::Vacant(slot) => {
                slot.insert(idx);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pack_cell(
        x: i16,
        y: i16,
        shape: u8,
        size: u8,
        tile_offset: u16,
        priority: u8,
        palette: u8,
        x_flip: bool,
        y_flip: bool,
    ) -> [u16; 3] {
        let obj0 = (y as u16 & 0xFF) | ((shape as u16) << 14);
        let mut obj1 = (x as u16 & 0x1FF) | ((size as u16) << 14);
        if x_flip {
            obj1 |= 1 << 12;
        }
        if y_flip {
            obj1 |= 1 << 13;
        }
        let obj2 = (tile_offset & 0x3FF) | ((priority as u16) << 10) | ((palette as u16) << 12);
        [obj0, obj1, obj2]
    }

    /// Minimal NCER with one cell table per bank and no partition data.
    pub(crate) fn build_ncer(banks: &[Vec<[u16; 3]>]) -> Vec<u8> {
        let bank_count = banks.len();
        let mut data = vec![0u8; 48];
        data[24..26].copy_from_slice(&(bank_count as u16).to_le_bytes());
        data[26..28].copy_from_slice(&0u16.to_le_bytes());
        data[28..32].copy_from_slice(&24u32.to_le_bytes()); // bank table at 48
        data[32..36].copy_from_slice(&0u32.to_le_bytes());
        data[36..40].copy_from_slice(&0u32.to_le_bytes());

        // Bank records, then the cell arrays they point at.
        let mut cell_offset = 0u32;
        for bank in banks {
            data.extend_from_slice(&(bank.len() as u16).to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes());
            data.extend_from_slice(&cell_offset.to_le_bytes());
            cell_offset += bank.len() as u32 * 6;
        }
        for bank in banks {
            for cell in bank {
                for word in cell {
                    data.extend_from_slice(&word.to_le_bytes());
                }
            }
        }
        data
    }

    #[test]
    fn decodes_cell_attribute_words() {
        let ncer = build_ncer(&[vec![pack_cell(-4, -8, 1, 2, 5, 2, 3, true, false)]]);
        let set = read_ncer(&ncer).unwrap();

        assert_eq!(set.banks.len(), 1);
        let bank = &set.banks[0];
        assert_eq!(bank.cells.len(), 1);
        let cell = &bank.cells[0];
        // Shape 1 size 2 is a 32x16 cell.
        assert_eq!((cell.width, cell.height), (32, 16));
        assert_eq!(cell.tile_offset, 5);
        assert_eq!(cell.priority, 2);
        assert_eq!(cell.palette, 3);
        assert!(cell.attrs.x_flip());
        assert!(!cell.attrs.y_flip());
        // Re-origined to the bounding box.
        assert_eq!((cell.x, cell.y), (0, 0));
        assert_eq!((bank.width, bank.height), (32, 16));
        assert_eq!(bank.layer_count, 1);
    }

    #[test]
    fn rotate_scale_cells_carry_the_parameter_selector() {
        let mut words = pack_cell(0, 0, 0, 0, 0, 0, 0, false, false);
        words[0] |= 1 << 8; // rotate/scale
        words[0] |= 1 << 9; // double size
        words[1] |= 0x15 << 9;
        let set = read_ncer(&build_ncer(&[vec![words]])).unwrap();

        match set.banks[0].cells[0].attrs {
            CellAttrs::RotateScale { double_size, param } => {
                assert!(double_size);
                assert_eq!(param, 0x15);
            }
            CellAttrs::Normal { .. } => panic!("expected rotate/scale attributes"),
        }
    }

    #[test]
    fn bounding_box_spans_all_cells() {
        let ncer = build_ncer(&[vec![
            pack_cell(-8, -8, 0, 0, 0, 0, 0, false, false),
            pack_cell(8, 8, 0, 0, 1, 0, 0, false, false),
        ]]);
        let set = read_ncer(&ncer).unwrap();
        let bank = &set.banks[0];

        assert_eq!((bank.width, bank.height), (24, 24));
        let by_index = |i: usize| bank.cells.iter().find(|c| c.index == i).unwrap();
        assert_eq!((by_index(0).x, by_index(0).y), (0, 0));
        assert_eq!((by_index(1).x, by_index(1).y), (16, 16));
    }

    #[test]
    fn draw_order_is_descending_priority() {
        let ncer = build_ncer(&[vec![
            pack_cell(0, 0, 0, 0, 0, 0, 0, false, false),
            pack_cell(16, 0, 0, 0, 1, 3, 0, false, false),
        ]]);
        let set = read_ncer(&ncer).unwrap();
        let bank = &set.banks[0];

        assert_eq!(bank.cells[0].priority, 3);
        assert_eq!(bank.cells[1].priority, 0);
    }

    #[test]
    fn duplicate_banks_are_marked() {
        // Same sizes and tile runs, different positions and palettes.
        let ncer = build_ncer(&[
            vec![pack_cell(0, 0, 0, 1, 4, 0, 0, false, false)],
            vec![pack_cell(20, 10, 0, 1, 4, 0, 7, true, false)],
            vec![pack_cell(0, 0, 0, 1, 9, 0, 0, false, false)],
        ]);
        let set = read_ncer(&ncer).unwrap();

        assert!(!set.banks[0].duplicate);
        assert!(set.banks[1].duplicate);
        assert!(!set.banks[2].duplicate, "tile offset differs");
    }

    #[test]
    fn overlapping_cells_get_two_layers() {
        let ncer = build_ncer(&[vec![
            pack_cell(0, 0, 0, 1, 0, 0, 0, false, false),
            pack_cell(4, 4, 0, 1, 8, 0, 0, false, false),
        ]]);
        let set = read_ncer(&ncer).unwrap();
        assert_eq!(set.banks[0].layer_count, 2);
    }
}
