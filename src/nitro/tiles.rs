//! # NCGR tile stores
//!
//! A tile store is a flat run of 8x8 indexed-colour tiles at 4 or 8 bits
//! per pixel. The payload offset is kept so edited tiles can be written
//! back over the original bytes.

use std::io::Cursor;

use image::{Rgba, RgbaImage};
use log::{debug, warn};

use crate::binary_utils::{read_bytes, read_u16_le, read_u32_le, seek_to, skip, write_u8};
use crate::nitro::{
    nearest_colour_index, pixel_position, EncodeReport, NitroError, PIXELS_PER_TILE, TILE_DIM,
};

/// Bits per pixel of a tile store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bpp {
    Four,
    Eight,
}

impl Bpp {
    pub fn from_depth(depth: u32) -> Self {
        if depth == 0x04 {
            Bpp::Eight
        } else {
            Bpp::Four
        }
    }

    pub fn bits(self) -> usize {
        match self {
            Bpp::Four => 4,
            Bpp::Eight => 8,
        }
    }

    pub fn bytes_per_tile(self) -> usize {
        PIXELS_PER_TILE * self.bits() / 8
    }
}

/// One 8x8 tile of palette indices, row-major.
pub type Tile = [u8; PIXELS_PER_TILE];

pub struct TileSet {
    /// Raster width in pixels, when declared (0xFFFF * 8 when not).
    pub width: usize,
    pub height: usize,
    pub bpp: Bpp,
    /// Linear pixel addressing instead of 8x8 blocks.
    pub linear: bool,
    pub tiles: Vec<Tile>,
    /// Payload position in the source binary, kept for re-encode.
    pub data_offset: usize,
    pub data_len: usize,
}

/// Decode an NCGR tile store.
pub fn read_ncgr(data: &[u8]) -> Result<TileSet, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 24)?;
    let mut height = read_u16_le(&mut cursor)? as usize;
    let mut width = read_u16_le(&mut cursor)? as usize;
    let bpp = Bpp::from_depth(read_u32_le(&mut cursor)?);
    skip(&mut cursor, 4)?;
    let flag = read_u32_le(&mut cursor)?;
    let linear = (flag & 0xFF) != 0;
    let mut tile_len = read_u32_le(&mut cursor)? as usize;
    skip(&mut cursor, 4)?;
    let data_offset = cursor.position() as usize;

    if data_offset + tile_len > data.len() {
        warn!(
            "NCGR payload truncated: {} bytes declared, {} available",
            tile_len,
            data.len() - data_offset
        );
        tile_len = data.len() - data_offset;
    }
    let payload = read_bytes(&mut cursor, tile_len)?;
    if width != 0xFFFF {
        width *= TILE_DIM;
        height *= TILE_DIM;
    }

    let bytes_per_tile = bpp.bytes_per_tile();
    if tile_len % bytes_per_tile != 0 {
        warn!(
            "NCGR payload length {} is not a whole number of {}-byte tiles",
            tile_len, bytes_per_tile
        );
    }

    let mut tiles = Vec::with_capacity(tile_len / bytes_per_tile);
    for chunk in payload.chunks_exact(bytes_per_tile) {
        let mut tile = [0u8; PIXELS_PER_TILE];
        match bpp {
            Bpp::Four => {
                for (x, index) in tile.iter_mut().enumerate() {
                    *index = (chunk[x / 2] >> ((x % 2) << 2)) & 0x0F;
                }
            }
            Bpp::Eight => tile.copy_from_slice(chunk),
        }
        tiles.push(tile);
    }

    debug!(
        "NCGR {}x{} {}bpp linear {} with {} tiles at offset {}",
        width,
        height,
        bpp.bits(),
        linear,
        tiles.len(),
        data_offset
    );
    Ok(TileSet {
        width,
        height,
        bpp,
        linear,
        tiles,
        data_offset,
        data_len: tile_len,
    })
}

/// Sample the raster pixel that tile (i, j) maps to, transparent when the
/// position falls outside the image.
fn sample(img: &RgbaImage, x: usize, y: usize) -> Rgba<u8> {
    if (x as u32) < img.width() && (y as u32) < img.height() {
        *img.get_pixel(x as u32, y as u32)
    } else {
        Rgba([0, 0, 0, 0])
    }
}

/// Re-encode one tile from a raster image into the destination buffer at
/// the tile's original payload position.
///
/// Pixels quantise by nearest colour against `palette[base..]`; indices
/// too wide for the pixel field are clamped and counted as clamp events.
pub fn write_tile(
    dest: &mut [u8],
    tiles: &TileSet,
    tile_index: usize,
    img: &RgbaImage,
    i: usize,
    j: usize,
    width: usize,
    palette: &[Rgba<u8>],
    base: usize,
    report: &mut EncodeReport,
) {
    let bytes_per_tile = tiles.bpp.bytes_per_tile();
    let mut pos = tiles.data_offset + tile_index * bytes_per_tile;
    if pos + bytes_per_tile > dest.len() {
        warn!(
            "Tile {} does not fit the destination buffer (offset {})",
            tile_index, pos
        );
        return;
    }
    let window = palette.get(base..).unwrap_or(&[]);
    if window.is_empty() {
        warn!("Empty palette window at base {}", base);
        return;
    }

    let max_index = match tiles.bpp {
        Bpp::Four => 0x0F,
        Bpp::Eight => 0xFF,
    };
    let mut quantise = |x: usize, y: usize| {
        let mut index = nearest_colour_index(window, sample(img, x, y));
        if index > max_index {
            warn!(
                "Palette index {} does not fit a {}-bit pixel, clamping",
                index,
                tiles.bpp.bits()
            );
            report.clamped_indices += 1;
            index = max_index;
        }
        index as u8
    };

    for i2 in 0..TILE_DIM {
        for j2 in (0..TILE_DIM).step_by(2) {
            let (x1, y1) = pixel_position(tiles.linear, width, i, j, i2, j2);
            let (x2, y2) = pixel_position(tiles.linear, width, i, j, i2, j2 + 1);
            let index1 = quantise(x1, y1);
            let index2 = quantise(x2, y2);
            match tiles.bpp {
                Bpp::Four => {
                    write_u8(dest, (index2 << 4) | index1, pos);
                    pos += 1;
                }
                Bpp::Eight => {
                    write_u8(dest, index1, pos);
                    write_u8(dest, index2, pos + 1);
                    pos += 2;
                }
            }
        }
    }
    report.tiles_written += 1;
}
