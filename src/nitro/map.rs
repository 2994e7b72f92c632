//! # NSCR background maps
//!
//! A map is a row-major grid of 16-bit entries selecting a tile, a
//! palette and per-tile flips.

use std::io::Cursor;

use log::{debug, warn};

use crate::binary_utils::{read_bytes, read_u16_le, read_u32_le, seek_to, skip};
use crate::nitro::NitroError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapEntry {
    /// Tile index, 10 bits.
    pub tile: u16,
    /// Palette id, 4 bits.
    pub palette: u8,
    pub x_flip: bool,
    pub y_flip: bool,
}

impl MapEntry {
    pub fn from_raw(raw: u16) -> Self {
        MapEntry {
            tile: raw & 0x3FF,
            x_flip: (raw >> 10) & 1 != 0,
            y_flip: (raw >> 11) & 1 != 0,
            palette: ((raw >> 12) & 0xF) as u8,
        }
    }

    pub fn flipped(&self) -> bool {
        self.x_flip || self.y_flip
    }
}

pub struct TileMap {
    /// Raster width in pixels.
    pub width: usize,
    pub height: usize,
    pub entries: Vec<MapEntry>,
    pub data_offset: usize,
    pub data_len: usize,
}

/// Decode an NSCR map.
pub fn read_nscr(data: &[u8]) -> Result<TileMap, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 24)?;
    let width = read_u16_le(&mut cursor)? as usize;
    let height = read_u16_le(&mut cursor)? as usize;
    skip(&mut cursor, 4)?;
    let mut map_len = read_u32_le(&mut cursor)? as usize;
    let data_offset = cursor.position() as usize;

    if data_offset + map_len > data.len() {
        warn!(
            "NSCR payload truncated: {} bytes declared, {} available",
            map_len,
            data.len() - data_offset
        );
        map_len = data.len() - data_offset;
    }
    if map_len % 2 != 0 {
        return Err(NitroError::format(
            "NSCR",
            format!("map length {} is not a whole number of entries", map_len),
        ));
    }

    let payload = read_bytes(&mut cursor, map_len)?;
    let entries = payload
        .chunks_exact(2)
        .map(|pair| MapEntry::from_raw(u16::from_le_bytes([pair[0], pair[1]])))
        .collect::<Vec<_>>();

    debug!("NSCR {}x{} with {} entries", width, height, entries.len());
    Ok(TileMap {
        width,
        height,
        entries,
        data_offset,
        data_len: map_len,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn build_nscr(entries: &[u16], width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[24..26].copy_from_slice(&width.to_le_bytes());
        data[26..28].copy_from_slice(&height.to_le_bytes());
        data[32..36].copy_from_slice(&((entries.len() * 2) as u32).to_le_bytes());
        for &e in entries {
            data.extend_from_slice(&e.to_le_bytes());
        }
        data
    }

    #[test]
    fn unpacks_entry_fields() {
        let raw = 0x3FF | (1 << 10) | (1 << 11) | (0xA << 12);
        let map = read_nscr(&build_nscr(&[raw, 0x0005], 16, 8)).unwrap();

        assert_eq!(map.entries.len(), 2);
        let first = map.entries[0];
        assert_eq!(first.tile, 0x3FF);
        assert!(first.x_flip);
        assert!(first.y_flip);
        assert_eq!(first.palette, 0xA);
        let second = map.entries[1];
        assert_eq!(second.tile, 5);
        assert!(!second.flipped());
        assert_eq!(second.palette, 0);
    }

    #[test]
    fn entry_count_matches_declared_length() {
        let map = read_nscr(&build_nscr(&[0, 1, 2, 3], 32, 8)).unwrap();
        assert_eq!(map.entries.len() * 2, map.data_len);
        assert_eq!(map.data_offset, 36);
    }

    #[test]
    fn odd_length_is_a_format_error() {
        let mut data = build_nscr(&[0], 8, 8);
        data[32..36].copy_from_slice(&3u32.to_le_bytes());
        data.push(0);
        assert!(read_nscr(&data).is_err());
    }
}
