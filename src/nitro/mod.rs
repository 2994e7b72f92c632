//! Nitro graphics format handling
//!
//! Codecs for the DS graphics asset formats: palettes (NCLR), indexed
//! tiles (NCGR), background maps (NSCR), sprite cell banks (NCER), model
//! textures (NSBMD) and font glyph tables (NFTR), plus the compositor
//! that renders them to RGBA images and the re-encoder that writes edited
//! images back into the original binaries.

use std::fmt;
use std::io;

use image::Rgba;
use thiserror::Error;

pub mod cells;
pub mod encode;
pub mod font;
pub mod layers;
pub mod map;
pub mod palette;
pub mod render;
pub mod texture;
pub mod tiles;

pub use cells::{read_ncer, Bank, Cell, CellAttrs, CellBankSet};
pub use encode::{write_ncer, write_ncgr, write_nscr, CellSource, EncodeReport};
pub use font::{read_font_glyphs, FontGlyphTable, GlyphEntry};
pub use layers::{assign_layers, cells_intersect};
pub use map::{read_nscr, MapEntry, TileMap};
pub use palette::{read_nclr, Palette, PaletteSet};
pub use render::{
    export_cell_banks, export_texture, export_tiles, render_cell_banks, render_texture,
    render_tiles, with_palette_strip, BankLayer, CellRender, LayerMerger,
};
pub use texture::{read_nsbmd, texture_to_image, Model, Texture, TextureFormat};
pub use tiles::{read_ncgr, Bpp, Tile, TileSet};

/// Edge length of a hardware tile in pixels.
pub const TILE_DIM: usize = 8;

/// Pixels in one tile.
pub const PIXELS_PER_TILE: usize = TILE_DIM * TILE_DIM;

/// Error type for Nitro codec operations
#[derive(Debug, Error)]
pub enum NitroError {
    /// Header field inconsistent with the expected layout
    #[error("invalid {section} data: {detail}")]
    Format {
        section: &'static str,
        detail: String,
    },
    /// A named layer is missing from a layered re-encode input
    #[error("layer {0} not found")]
    MissingLayer(String),
    /// The external layer merge tool failed
    #[error("layer merge failed: {0}")]
    Merge(String),
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Image encode/decode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl NitroError {
    pub(crate) fn format(section: &'static str, detail: impl fmt::Display) -> Self {
        NitroError::Format {
            section,
            detail: detail.to_string(),
        }
    }
}

/// Expand a 5-bit channel to 8 bits, replicating the high bits so that
/// 0x1F maps to 0xFF.
fn expand_channel(c: u8) -> u8 {
    (c << 3) | (c >> 2)
}

/// Decode one 15-bit BGR555 colour entry into an opaque RGBA colour.
pub fn read_colour(raw: u16) -> Rgba<u8> {
    let r = (raw & 0x1F) as u8;
    let g = ((raw >> 5) & 0x1F) as u8;
    let b = ((raw >> 10) & 0x1F) as u8;
    Rgba([expand_channel(r), expand_channel(g), expand_channel(b), 255])
}

/// Weighted blend of two colours, `(a * wa + b * wb) / div` per channel.
pub fn blend_colours(a: Rgba<u8>, b: Rgba<u8>, wa: u32, wb: u32, div: u32) -> Rgba<u8> {
    let mix = |ca: u8, cb: u8| ((ca as u32 * wa + cb as u32 * wb) / div) as u8;
    Rgba([mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2]), 255])
}

/// Map a pixel of tile (i, j) to its raster position.
///
/// Tiled addressing keeps each tile an 8x8 block; linear addressing runs
/// all tile pixels together and wraps them at the raster width.
pub fn pixel_position(
    linear: bool,
    width: usize,
    i: usize,
    j: usize,
    i2: usize,
    j2: usize,
) -> (usize, usize) {
    if linear {
        let flat = i * width * TILE_DIM + j * PIXELS_PER_TILE + i2 * TILE_DIM + j2;
        (flat % width, flat / width)
    } else {
        (j * TILE_DIM + j2, i * TILE_DIM + i2)
    }
}

/// Find the palette index whose colour is closest to `colour` in RGB
/// space. Translucent pixels resolve to index 0; ties keep the first
/// match.
pub fn nearest_colour_index(palette: &[Rgba<u8>], colour: Rgba<u8>) -> usize {
    if colour[3] < 128 {
        return 0;
    }
    let mut best = 0;
    let mut best_dist = u32::MAX;
    for (idx, cand) in palette.iter().enumerate() {
        let dr = cand[0] as i32 - colour[0] as i32;
        let dg = cand[1] as i32 - colour[1] as i32;
        let db = cand[2] as i32 - colour[2] as i32;
        let dist = (dr * dr + dg * dg + db * db) as u32;
        if dist < best_dist {
            best_dist = dist;
            best = idx;
            if dist == 0 {
                break;
            }
        }
    }
    best
}

/// Find an exactly matching palette index within `[base, base + window)`,
/// returned relative to `base`. Translucent pixels resolve to index 0; no
/// match is `None`.
pub fn exact_colour_index(
    palette: &[Rgba<u8>],
    colour: Rgba<u8>,
    base: usize,
    window: usize,
) -> Option<usize> {
    if colour[3] < 128 {
        return Some(0);
    }
    let end = (base + window).min(palette.len());
    palette
        .get(base..end)?
        .iter()
        .position(|c| c[0] == colour[0] && c[1] == colour[1] && c[2] == colour[2])
}

/// A full set of companion graphics structures decoded in one call.
///
/// The map and cell bank are optional companions; their absence means the
/// feature is not present, not that the decode failed.
pub struct NitroGraphic {
    pub palettes: PaletteSet,
    pub tiles: TileSet,
    pub map: Option<TileMap>,
    pub cells: Option<CellBankSet>,
    pub width: usize,
    pub height: usize,
}

/// Decode a palette, tile store and the optional map/cell companions,
/// returning the combined structure and the effective canvas dimensions
/// (map dimensions win over tile dimensions).
pub fn read_nitro_graphic(
    palette_data: &[u8],
    tile_data: &[u8],
    map_data: Option<&[u8]>,
    cell_data: Option<&[u8]>,
) -> Result<NitroGraphic, NitroError> {
    let palettes = read_nclr(palette_data)?;
    let tiles = read_ncgr(tile_data)?;
    let mut width = tiles.width;
    let mut height = tiles.height;

    let map = match map_data {
        Some(data) => {
            let map = read_nscr(data)?;
            width = map.width;
            height = map.height;
            Some(map)
        }
        None => None,
    };
    let cells = match cell_data {
        Some(data) => Some(read_ncer(data)?),
        None => None,
    };

    Ok(NitroGraphic {
        palettes,
        tiles,
        map,
        cells,
        width,
        height,
    })
}
