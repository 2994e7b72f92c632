//! # NFTR glyph tables
//!
//! Per-character glyph metrics resolved through the font's code-range
//! records. Character codes below 256 decode as a single-byte code page;
//! the rest decode their big-endian byte pair as Shift-JIS. Codes that
//! decode to nothing are dropped.

use std::collections::HashMap;
use std::io::Cursor;

use encoding_rs::SHIFT_JIS;
use log::{debug, error};

use crate::binary_utils::{read_i8, read_u16_le, read_u32_le, read_u8, seek_to, skip};
use crate::nitro::NitroError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlyphEntry {
    /// Leading space before the glyph bitmap.
    pub start: i8,
    /// Advance width.
    pub width: u8,
    /// Tile-run length.
    pub length: u8,
    /// Source character code.
    pub code: u16,
}

pub struct FontGlyphTable {
    pub cell_width: u8,
    pub cell_height: u8,
    pub glyphs: HashMap<char, GlyphEntry>,
}

fn code_to_char(code: u16) -> Option<char> {
    if code < 256 {
        if code < 0x80 {
            Some(code as u8 as char)
        } else {
            None
        }
    } else {
        let bytes = code.to_be_bytes();
        let (text, _, had_errors) = SHIFT_JIS.decode(&bytes);
        if had_errors {
            return None;
        }
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

/// Decode an NFTR glyph metrics table.
pub fn read_font_glyphs(data: &[u8]) -> Result<FontGlyphTable, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 25)?;
    let cell_height = read_u8(&mut cursor)?;
    skip(&mut cursor, 3)?;
    let cell_width = read_u8(&mut cursor)?;
    skip(&mut cursor, 2)?;
    let glyph_offset = read_u32_le(&mut cursor)?;
    let metrics_offset = read_u32_le(&mut cursor)?;
    let map_offset = read_u32_le(&mut cursor)?;
    debug!(
        "NFTR {}x{} glyphs {} metrics {} map {}",
        cell_width, cell_height, glyph_offset, metrics_offset, map_offset
    );

    // Glyph tile directory: its size determines the metrics count.
    let back = glyph_offset.checked_sub(4).ok_or_else(|| {
        NitroError::format("NFTR", format!("glyph section offset {}", glyph_offset))
    })?;
    seek_to(&mut cursor, back as u64)?;
    let glyph_size = read_u32_le(&mut cursor)?;
    skip(&mut cursor, 2)?;
    let tile_length = read_u16_le(&mut cursor)? as u32;
    if tile_length == 0 {
        return Err(NitroError::format("NFTR", "zero glyph tile length"));
    }
    let glyph_count = glyph_size.saturating_sub(0x10) / tile_length;

    // Metrics table, one record per glyph.
    seek_to(&mut cursor, metrics_offset as u64)?;
    let _first_code = read_u16_le(&mut cursor)?;
    let _last_code = read_u16_le(&mut cursor)?;
    skip(&mut cursor, 4)?;
    let mut metrics = Vec::with_capacity(glyph_count as usize);
    for _ in 0..glyph_count {
        let start = read_i8(&mut cursor)?;
        let width = read_u8(&mut cursor)?;
        let length = read_u8(&mut cursor)?;
        metrics.push((start, width, length));
    }

    // Walk the linked code-range records.
    let mut glyphs = HashMap::new();
    let mut next_offset = map_offset;
    while next_offset != 0 {
        seek_to(&mut cursor, next_offset as u64)?;
        let first_char = read_u16_le(&mut cursor)?;
        let last_char = read_u16_le(&mut cursor)?;
        let kind = read_u32_le(&mut cursor)?;
        next_offset = read_u32_le(&mut cursor)?;
        match kind {
            0 => {
                // Contiguous slice of the metrics table.
                let base = read_u16_le(&mut cursor)? as usize;
                for i in 0..=last_char.saturating_sub(first_char) as usize {
                    let code = first_char + i as u16;
                    let Some(&(start, width, length)) = metrics.get(base + i) else {
                        continue;
                    };
                    if let Some(c) = code_to_char(code) {
                        glyphs.insert(
                            c,
                            GlyphEntry {
                                start,
                                width,
                                length,
                                code,
                            },
                        );
                    }
                }
            }
            1 => {
                // Explicit per-character metrics indices.
                for i in 0..=last_char.saturating_sub(first_char) as usize {
                    let code = first_char + i as u16;
                    let glyph_index = read_u16_le(&mut cursor)?;
                    if glyph_index == 0xFFFF || glyph_index as usize >= metrics.len() {
                        continue;
                    }
                    let (start, width, length) = metrics[glyph_index as usize];
                    if let Some(c) = code_to_char(code) {
                        glyphs.insert(
                            c,
                            GlyphEntry {
                                start,
                                width,
                                length,
                                code,
                            },
                        );
                    }
                }
            }
            _ => error!("Unknown code-range record type {}", kind),
        }
    }

    Ok(FontGlyphTable {
        cell_width,
        cell_height,
        glyphs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put16(data: &mut [u8], pos: usize, value: u16) {
        data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(data: &mut [u8], pos: usize, value: u32) {
        data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Two glyphs; a type-0 range for 'A'..'B' and a type-1 range for
    /// two Shift-JIS codes, one of them the no-glyph sentinel.
    fn build_nftr() -> Vec<u8> {
        let mut data = vec![0u8; 104];
        data[25] = 12; // cell height
        data[29] = 10; // cell width
        put32(&mut data, 32, 48); // glyph section
        put32(&mut data, 36, 52); // metrics section
        put32(&mut data, 40, 68); // first code-range record

        // Glyph directory: size 0x10 + 2 tiles of 16 bytes.
        put32(&mut data, 44, 0x30);
        put16(&mut data, 50, 16);

        // Metrics: range header then (start, width, length) per glyph.
        put16(&mut data, 52, 65);
        put16(&mut data, 54, 66);
        data[60] = 1;
        data[61] = 5;
        data[62] = 6;
        data[63] = 0xFF; // start -1
        data[64] = 7;
        data[65] = 8;

        // Type-0 record: 'A'-'B' onto metrics 0...
        put16(&mut data, 68, 65);
        put16(&mut data, 70, 66);
        put32(&mut data, 72, 0);
        put32(&mut data, 76, 84); // next record
        put16(&mut data, 80, 0);

        // Type-1 record: two Shift-JIS codes, second is the sentinel.
        put16(&mut data, 84, 0x82A0);
        put16(&mut data, 86, 0x82A1);
        put32(&mut data, 88, 1);
        put32(&mut data, 92, 0); // terminates
        put16(&mut data, 96, 1);
        put16(&mut data, 98, 0xFFFF);

        data
    }

    #[test]
    fn resolves_direct_and_lookup_ranges() {
        let table = read_font_glyphs(&build_nftr()).unwrap();

        assert_eq!(table.cell_width, 10);
        assert_eq!(table.cell_height, 12);
        let a = table.glyphs[&'A'];
        assert_eq!((a.start, a.width, a.length), (1, 5, 6));
        assert_eq!(a.code, 65);
        let b = table.glyphs[&'B'];
        assert_eq!((b.start, b.width, b.length), (-1, 7, 8));

        // 0x82A0 is Shift-JIS for U+3041.
        let kana = table.glyphs[&'\u{3041}'];
        assert_eq!((kana.start, kana.width, kana.length), (-1, 7, 8));
        assert_eq!(kana.code, 0x82A0);
        // The sentinel code resolves to no glyph.
        assert_eq!(table.glyphs.len(), 3);
    }

    #[test]
    fn high_single_byte_codes_are_dropped() {
        assert_eq!(code_to_char(65), Some('A'));
        assert_eq!(code_to_char(0x80), None);
        assert_eq!(code_to_char(0xFF), None);
        assert_eq!(code_to_char(0x82A0), Some('\u{3041}'));
    }
}
