//! # NCLR palette banks
//!
//! A palette bank holds one or more colour tables of 16 (4bpp) or 256
//! (8bpp) BGR555 entries, optionally followed by an index section that
//! assigns explicit palette ids.

use std::io::Cursor;

use image::Rgba;
use log::debug;

use crate::binary_utils::{read_u16_le, read_u32_le, seek_to, skip};
use crate::nitro::{read_colour, NitroError};

pub type Palette = Vec<Rgba<u8>>;

/// Ordered id -> palette mapping decoded from an NCLR bank.
pub struct PaletteSet {
    entries: Vec<(u16, Palette)>,
}

impl PaletteSet {
    pub fn new(entries: Vec<(u16, Palette)>) -> Self {
        PaletteSet { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Palettes in encounter order, with their ids.
    pub fn iter(&self) -> impl Iterator<Item = &(u16, Palette)> {
        self.entries.iter()
    }

    pub fn get(&self, id: u16) -> Option<&Palette> {
        self.entries
            .iter()
            .find(|(pal_id, _)| *pal_id == id)
            .map(|(_, pal)| pal)
    }

    /// Resolve a palette id to a `(palette, base index)` pair.
    ///
    /// A known id selects its own palette at base 0. An unknown id falls
    /// back to palette 0 with base `id * 16`, the sub-palette convention
    /// for 256-colour banks.
    ///
    /// Panics on an empty set; every decoded set holds at least one
    /// palette.
    pub fn select(&self, id: u16) -> (&Palette, usize) {
        if let Some(pal) = self.get(id) {
            return (pal, 0);
        }
        let fallback = self
            .get(0)
            .or_else(|| self.entries.first().map(|(_, pal)| pal))
            .expect("palette set is empty");
        (fallback, id as usize * 16)
    }
}

/// Decode an NCLR palette bank.
pub fn read_nclr(data: &[u8]) -> Result<PaletteSet, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 14)?;
    let sections = read_u16_le(&mut cursor)?;
    seek_to(&mut cursor, 20)?;
    let data_len = read_u32_le(&mut cursor)?;
    let bpp = if read_u16_le(&mut cursor)? == 0x04 { 8 } else { 4 };
    skip(&mut cursor, 6)?;
    let mut pal_len = read_u32_le(&mut cursor)?;
    if pal_len == 0 || pal_len > data_len {
        pal_len = data_len.saturating_sub(0x18);
    }
    let offset = read_u32_le(&mut cursor)?;

    let mut colours_per_palette = if bpp == 4 { 0x10u32 } else { 0x100 };
    if pal_len / 2 < colours_per_palette {
        colours_per_palette = pal_len / 2;
    }
    if colours_per_palette == 0 {
        return Err(NitroError::format(
            "NCLR",
            format!("empty colour table (palette length {})", pal_len),
        ));
    }
    debug!(
        "NCLR bpp {} length {} pal_len {} colours {}",
        bpp, data_len, pal_len, colours_per_palette
    );

    seek_to(&mut cursor, 0x18 + offset as u64)?;
    let palette_count = pal_len / (colours_per_palette * 2);
    let mut palettes = Vec::with_capacity(palette_count as usize);
    for _ in 0..palette_count {
        let mut palette = Vec::with_capacity(colours_per_palette as usize);
        for _ in 0..colours_per_palette {
            palette.push(read_colour(read_u16_le(&mut cursor)?));
        }
        palettes.push(palette);
    }

    // A two-section bank carries an explicit id table; otherwise ids are
    // the storage order.
    let mut entries = Vec::with_capacity(palettes.len());
    if sections == 2 {
        skip(&mut cursor, 16)?;
        for palette in palettes {
            let id = read_u16_le(&mut cursor)?;
            entries.push((id, palette));
        }
    } else {
        for (i, palette) in palettes.into_iter().enumerate() {
            entries.push((i as u16, palette));
        }
    }

    debug!("Loaded {} palettes", entries.len());
    Ok(PaletteSet::new(entries))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn build_nclr(colours: &[u16], bpp8: bool, ids: Option<&[u16]>) -> Vec<u8> {
        let pal_len = (colours.len() * 2) as u32;
        let mut data = vec![0u8; 0x28];
        let sections: u16 = if ids.is_some() { 2 } else { 1 };
        data[14..16].copy_from_slice(&sections.to_le_bytes());
        data[20..24].copy_from_slice(&(pal_len + 0x18).to_le_bytes());
        data[24..26].copy_from_slice(&(if bpp8 { 4u16 } else { 3 }).to_le_bytes());
        data[32..36].copy_from_slice(&pal_len.to_le_bytes());
        data[36..40].copy_from_slice(&0x10u32.to_le_bytes());
        for &c in colours {
            data.extend_from_slice(&c.to_le_bytes());
        }
        if let Some(ids) = ids {
            data.extend_from_slice(&[0u8; 16]);
            for &id in ids {
                data.extend_from_slice(&id.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn decodes_sequential_palettes() {
        let mut colours = vec![0x7FFFu16];
        colours.extend(std::iter::repeat(0x001F).take(15));
        colours.extend(std::iter::repeat(0x03E0).take(16));
        let set = read_nclr(&build_nclr(&colours, false, None)).unwrap();

        assert_eq!(set.len(), 2);
        let first = set.get(0).unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first[0], Rgba([255, 255, 255, 255]));
        assert_eq!(first[1], Rgba([255, 0, 0, 255]));
        assert_eq!(set.get(1).unwrap()[0], Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn decodes_explicit_id_table() {
        let mut colours = vec![0x001Fu16; 16];
        colours.extend(std::iter::repeat(0x03E0).take(16));
        let set = read_nclr(&build_nclr(&colours, false, Some(&[3, 7]))).unwrap();

        assert_eq!(set.get(3).unwrap()[0], Rgba([255, 0, 0, 255]));
        assert_eq!(set.get(7).unwrap()[0], Rgba([0, 255, 0, 255]));
        assert!(set.get(0).is_none());
    }

    #[test]
    fn select_falls_back_to_palette_zero() {
        let colours = vec![0x7FFFu16; 16];
        let set = read_nclr(&build_nclr(&colours, false, None)).unwrap();

        let (pal, base) = set.select(0);
        assert_eq!(pal.len(), 16);
        assert_eq!(base, 0);
        let (_, base) = set.select(5);
        assert_eq!(base, 80);
    }

    #[test]
    fn rejects_empty_colour_table() {
        let data = build_nclr(&[], false, None);
        assert!(read_nclr(&data).is_err());
    }
}
