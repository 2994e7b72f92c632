//! # Re-encoding edited images
//!
//! The inverse of the compositor: walks the same pixel geometry as
//! decode, quantises each raster pixel back to a palette index and
//! writes packed tile bytes over the original payload offsets. Only the
//! tile data region is touched; headers and metadata stay as they are.

use std::collections::{HashMap, HashSet};

use image::RgbaImage;
use log::warn;

use crate::binary_utils::write_u8;
use crate::nitro::cells::CellBankSet;
use crate::nitro::palette::PaletteSet;
use crate::nitro::tiles::{write_tile, TileSet};
use crate::nitro::{exact_colour_index, Bpp, NitroError, TileMap, TILE_DIM};

/// Counters for one re-encode pass. Clamped and unmatched pixels are
/// also logged per occurrence; the pass keeps going so unrelated tiles
/// still get written.
#[derive(Debug, Default)]
pub struct EncodeReport {
    pub tiles_written: usize,
    /// Palette indices clamped to the pixel field width.
    pub clamped_indices: usize,
    /// Cell pixels with no exact palette match, written as index 0.
    pub unmatched_pixels: usize,
}

/// Pixel input for a cell-bank re-encode: one flat raster, or one raster
/// per exported layer keyed by its label.
pub enum CellSource {
    Flat(RgbaImage),
    Layers(HashMap<String, RgbaImage>),
}

/// Re-encode every tile of a tile store from a raster image.
pub fn write_ncgr(
    dest: &mut [u8],
    tiles: &TileSet,
    img: &RgbaImage,
    palettes: &PaletteSet,
    size: Option<(usize, usize)>,
) -> Result<EncodeReport, NitroError> {
    let (width, height) = size.unwrap_or((tiles.width, tiles.height));
    let (palette, base) = palettes.select(0);
    let mut report = EncodeReport::default();
    let mut tile_index = 0usize;
    for i in 0..height / TILE_DIM {
        for j in 0..width / TILE_DIM {
            write_tile(
                dest,
                tiles,
                tile_index,
                img,
                i,
                j,
                width,
                palette,
                base,
                &mut report,
            );
            tile_index += 1;
        }
    }
    Ok(report)
}

/// Re-encode the tiles referenced by a map from a raster image.
///
/// Flipped entries are skipped: the format convention is that every
/// referenced tile also occurs unflipped somewhere in the map, and that
/// occurrence is the one that gets written. A map violating the
/// convention leaves those tiles untouched.
pub fn write_nscr(
    dest: &mut [u8],
    tiles: &TileSet,
    map: &TileMap,
    img: &RgbaImage,
    palettes: &PaletteSet,
    size: Option<(usize, usize)>,
) -> Result<EncodeReport, NitroError> {
    let (width, height) = size.unwrap_or((map.width, map.height));
    let mut report = EncodeReport::default();
    let mut done_tiles = HashSet::new();
    let mut index = 0usize;
    for i in 0..height / TILE_DIM {
        for j in 0..width / TILE_DIM {
            let Some(&entry) = map.entries.get(index) else {
                warn!("Map entry {} is out of range {}", index, map.entries.len());
                continue;
            };
            index += 1;
            if entry.flipped() {
                continue;
            }
            if !done_tiles.insert(entry.tile) {
                continue;
            }
            let (palette, base) = palettes.select(entry.palette as u16);
            write_tile(
                dest,
                tiles,
                entry.tile as usize,
                img,
                i,
                j,
                width,
                palette,
                base,
                &mut report,
            );
        }
    }
    Ok(report)
}

/// Re-encode the tile runs referenced by a cell bank set.
///
/// The pixel source is the flat composite or the per-layer rasters the
/// compositor produced; in the layered case each cell reads from its own
/// layer. Quantisation requires an exact palette match. Flipped cells
/// are skipped like flipped map entries, and every tile is written at
/// most once.
pub fn write_ncer(
    dest: &mut [u8],
    tiles: &TileSet,
    cells: &CellBankSet,
    source: &CellSource,
    palettes: &PaletteSet,
    stem: &str,
) -> Result<EncodeReport, NitroError> {
    let bytes_per_tile = tiles.bpp.bytes_per_tile();
    let shift = cells.block_size as usize / (tiles.bpp.bits() / 4);
    let window = match tiles.bpp {
        Bpp::Four => 16,
        Bpp::Eight => usize::MAX,
    };

    let mut report = EncodeReport::default();
    let mut done_tiles = HashSet::new();
    let mut current_height = 0i64;
    for (bank_index, bank) in cells.banks.iter().enumerate() {
        if bank.width <= 0 || bank.height <= 0 || bank.duplicate {
            continue;
        }
        for cell in &bank.cells {
            if cell.attrs.flipped() {
                continue;
            }
            let img = match source {
                CellSource::Flat(img) => img,
                CellSource::Layers(layers) => {
                    let label = format!("{}_{}_{}", stem, bank_index, cell.layer.max(0));
                    layers
                        .get(&label)
                        .ok_or(NitroError::MissingLayer(label))?
                }
            };
            let (palette, base) = palettes.select(cell.palette as u16);
            let window = window.min(palette.len().saturating_sub(base));

            let mut tile = bank.partition_offset as usize / bytes_per_tile
                + ((cell.tile_offset as usize) << shift);
            for i in 0..cell.height as usize / TILE_DIM {
                for j in 0..cell.width as usize / TILE_DIM {
                    if done_tiles.insert(tile) {
                        let mut pos = tiles.data_offset + tile * bytes_per_tile;
                        if pos + bytes_per_tile > dest.len() {
                            warn!("Tile {} does not fit the destination buffer", tile);
                            tile += 1;
                            continue;
                        }
                        for i2 in 0..TILE_DIM {
                            for j2 in (0..TILE_DIM).step_by(2) {
                                let x = cell.x as i64 + (j * TILE_DIM + j2) as i64;
                                let y = current_height
                                    + cell.y as i64
                                    + (i * TILE_DIM + i2) as i64;
                                let index1 =
                                    quantise_exact(img, x, y, palette, base, window, &mut report);
                                let index2 = quantise_exact(
                                    img,
                                    x + 1,
                                    y,
                                    palette,
                                    base,
                                    window,
                                    &mut report,
                                );
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
                    tile += 1;
                }
            }
        }
        current_height += bank.height as i64;
    }
    Ok(report)
}

fn quantise_exact(
    img: &RgbaImage,
    x: i64,
    y: i64,
    palette: &[image::Rgba<u8>],
    base: usize,
    window: usize,
    report: &mut EncodeReport,
) -> u8 {
    let colour = if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        *img.get_pixel(x as u32, y as u32)
    } else {
        image::Rgba([0, 0, 0, 0])
    };
    match exact_colour_index(palette, colour, base, window) {
        Some(index) => index as u8,
        None => {
            warn!(
                "No exact palette match for ({}, {}, {}, {}) at ({}, {})",
                colour[0], colour[1], colour[2], colour[3], x, y
            );
            report.unmatched_pixels += 1;
            0
        }
    }
}
