//! # Compositing and export
//!
//! Renders decoded tile stores, maps, cell banks and model textures into
//! RGBA images, optionally with a palette swatch strip for inspection.
//! Export helpers save optimised PNGs, write cell-bank metadata sidecars
//! and drive the external layered-image merge tool.

use std::fs;
use std::path::{Path, PathBuf};

use image::{imageops, Rgba, RgbaImage};
use log::warn;
use oxipng::{InFile, OutFile};
use serde::Serialize;

use crate::nitro::cells::CellBankSet;
use crate::nitro::palette::{Palette, PaletteSet};
use crate::nitro::texture::{Model, TextureFormat};
use crate::nitro::tiles::TileSet;
use crate::nitro::{pixel_position, texture_to_image, NitroError, TileMap, TILE_DIM};

/// Width of the palette swatch strip appended beside rendered images.
const STRIP_WIDTH: u32 = 40;
/// Swatch edge length; eight swatches fit one strip row.
const SWATCH: usize = 5;

/// Merges an ordered list of labelled layer images into one layered
/// file. The reference tool is an external image editor invocation; the
/// codec only hands over file paths.
pub trait LayerMerger {
    fn merge(&self, layers: &[(String, PathBuf)], output: &Path) -> Result<(), NitroError>;
}

/// Draw one tile into the canvas. Index 0 stays untouched when
/// transparency is on; positions outside the canvas are clipped.
fn draw_tile(
    canvas: &mut RgbaImage,
    tiles: &TileSet,
    tile_index: usize,
    i: usize,
    j: usize,
    width: usize,
    palette: &[Rgba<u8>],
    base: usize,
    transparency: bool,
) {
    let Some(tile) = tiles.tiles.get(tile_index) else {
        warn!("Tile {} is out of range {}", tile_index, tiles.tiles.len());
        return;
    };
    for i2 in 0..TILE_DIM {
        for j2 in 0..TILE_DIM {
            let index = tile[i2 * TILE_DIM + j2] as usize;
            if transparency && index == 0 {
                continue;
            }
            let Some(&colour) = palette.get(base + index) else {
                warn!("Palette index {} is out of range {}", base + index, palette.len());
                continue;
            };
            let (x, y) = pixel_position(tiles.linear, width, i, j, i2, j2);
            if (x as u32) < canvas.width() && (y as u32) < canvas.height() {
                canvas.put_pixel(x as u32, y as u32, colour);
            }
        }
    }
}

/// Mirror/flip an 8x8 canvas region in place.
fn flip_region(canvas: &mut RgbaImage, x0: usize, y0: usize, x_flip: bool, y_flip: bool) {
    let mut region = RgbaImage::new(TILE_DIM as u32, TILE_DIM as u32);
    for y in 0..TILE_DIM as u32 {
        for x in 0..TILE_DIM as u32 {
            let sx = x0 as u32 + x;
            let sy = y0 as u32 + y;
            if sx < canvas.width() && sy < canvas.height() {
                region.put_pixel(x, y, *canvas.get_pixel(sx, sy));
            }
        }
    }
    if y_flip {
        region = imageops::flip_vertical(&region);
    }
    if x_flip {
        region = imageops::flip_horizontal(&region);
    }
    for y in 0..TILE_DIM as u32 {
        for x in 0..TILE_DIM as u32 {
            let dx = x0 as u32 + x;
            let dy = y0 as u32 + y;
            if dx < canvas.width() && dy < canvas.height() {
                canvas.put_pixel(dx, dy, *region.get_pixel(x, y));
            }
        }
    }
}

/// Render a tile store, optionally through a map, into a raw RGBA canvas.
pub fn render_tiles(
    tiles: &TileSet,
    map: Option<&TileMap>,
    palettes: &PaletteSet,
    width: usize,
    height: usize,
    transparency: bool,
) -> RgbaImage {
    let mut canvas = RgbaImage::new(width as u32, height as u32);
    let mut index = 0usize;
    for i in 0..height / TILE_DIM {
        for j in 0..width / TILE_DIM {
            match map {
                Some(map) => {
                    let Some(&entry) = map.entries.get(index) else {
                        warn!("Map entry {} is out of range {}", index, map.entries.len());
                        continue;
                    };
                    let (palette, base) = palettes.select(entry.palette as u16);
                    draw_tile(
                        &mut canvas,
                        tiles,
                        entry.tile as usize,
                        i,
                        j,
                        width,
                        palette,
                        base,
                        transparency,
                    );
                    if entry.x_flip || entry.y_flip {
                        flip_region(
                            &mut canvas,
                            j * TILE_DIM,
                            i * TILE_DIM,
                            entry.x_flip,
                            entry.y_flip,
                        );
                    }
                }
                None => {
                    let (palette, base) = palettes.select(0);
                    draw_tile(
                        &mut canvas,
                        tiles,
                        index,
                        i,
                        j,
                        width,
                        palette,
                        base,
                        transparency,
                    );
                }
            }
            index += 1;
        }
    }
    canvas
}

/// One exported layer of a rendered cell bank.
pub struct BankLayer {
    pub bank: usize,
    pub layer: usize,
    pub image: RgbaImage,
}

impl BankLayer {
    pub fn label(&self, stem: &str) -> String {
        format!("{}_{}_{}", stem, self.bank, self.layer)
    }
}

pub struct CellRender {
    pub canvas: RgbaImage,
    /// Per (bank, layer) canvases; empty unless layering is active.
    pub layers: Vec<BankLayer>,
    pub layered: bool,
}

/// Render every non-duplicate bank of a cell bank set, stacked
/// vertically. With `layered` on, each (bank, layer) pair also renders
/// into its own full-size canvas; layering switches itself off when no
/// bank has more than one layer.
pub fn render_cell_banks(
    cells: &CellBankSet,
    tiles: &TileSet,
    palettes: &PaletteSet,
    transparency: bool,
    layered: bool,
) -> CellRender {
    let mut width = 0i32;
    let mut height = 0i32;
    for bank in cells.banks.iter().filter(|b| !b.duplicate) {
        width = width.max(bank.width);
        height += bank.height;
    }
    let width = width.max(0) as u32;
    let height = height.max(0) as u32;
    let mut canvas = RgbaImage::new(width, height);

    let layered = layered && cells.banks.iter().any(|b| b.layer_count > 1);
    let mut layers = Vec::new();

    let bytes_per_tile = tiles.bpp.bytes_per_tile();
    let shift = cells.block_size as usize / (tiles.bpp.bits() / 4);
    let mut current_height = 0i64;
    for (bank_index, bank) in cells.banks.iter().enumerate() {
        if bank.width <= 0 || bank.height <= 0 || bank.duplicate {
            continue;
        }
        let mut bank_layers = Vec::new();
        if layered {
            for layer in 0..bank.layer_count as usize {
                bank_layers.push(BankLayer {
                    bank: bank_index,
                    layer,
                    image: RgbaImage::new(width, height),
                });
            }
        }

        for cell in &bank.cells {
            let mut tile_index = bank.partition_offset as usize / bytes_per_tile
                + ((cell.tile_offset as usize) << shift);
            let (palette, base) = palettes.select(cell.palette as u16);

            let mut cell_img = RgbaImage::new(cell.width as u32, cell.height as u32);
            for i in 0..cell.height as usize / TILE_DIM {
                for j in 0..cell.width as usize / TILE_DIM {
                    draw_tile(
                        &mut cell_img,
                        tiles,
                        tile_index,
                        i,
                        j,
                        cell.width as usize,
                        palette,
                        base,
                        transparency,
                    );
                    tile_index += 1;
                }
            }
            if cell.attrs.y_flip() {
                cell_img = imageops::flip_vertical(&cell_img);
            }
            if cell.attrs.x_flip() {
                cell_img = imageops::flip_horizontal(&cell_img);
            }

            let dest_x = cell.x as i64;
            let dest_y = current_height + cell.y as i64;
            paste(&mut canvas, &cell_img, dest_x, dest_y);
            if layered {
                if let Some(bank_layer) = bank_layers.get_mut(cell.layer.max(0) as usize) {
                    paste(&mut bank_layer.image, &cell_img, dest_x, dest_y);
                }
            }
        }
        layers.extend(bank_layers);
        current_height += bank.height as i64;
    }

    CellRender {
        canvas,
        layers,
        layered,
    }
}

/// Alpha-masked paste: only visible pixels copy over.
fn paste(canvas: &mut RgbaImage, src: &RgbaImage, x0: i64, y0: i64) {
    for (x, y, pixel) in src.enumerate_pixels() {
        if pixel[3] == 0 {
            continue;
        }
        let dx = x0 + x as i64;
        let dy = y0 + y as i64;
        if dx >= 0 && dy >= 0 && (dx as u32) < canvas.width() && (dy as u32) < canvas.height() {
            canvas.put_pixel(dx as u32, dy as u32, *pixel);
        }
    }
}

/// Render one model texture against its paired palette (by index,
/// falling back to palette 0).
pub fn render_texture(model: &Model, index: usize) -> Result<RgbaImage, NitroError> {
    let tex = model.textures.get(index).ok_or_else(|| {
        NitroError::format(
            "NSBMD",
            format!("texture index {} out of range {}", index, model.textures.len()),
        )
    })?;
    if tex.format == TextureFormat::Direct {
        return Ok(texture_to_image(tex, &[]));
    }
    let palette = model
        .palettes
        .get(index)
        .or_else(|| model.palettes.first())
        .map(|p| p.colours.as_slice())
        .unwrap_or(&[]);
    Ok(texture_to_image(tex, palette))
}

/// Append the palette swatch strip to the right of a rendered canvas.
pub fn with_palette_strip(core: &RgbaImage, palettes: &[&Palette]) -> RgbaImage {
    let strip_height: usize = palettes.iter().map(|p| SWATCH * (p.len() / 8)).sum();
    let width = core.width() + STRIP_WIDTH;
    let height = core.height().max(strip_height as u32);
    let mut canvas = RgbaImage::new(width, height);
    paste(&mut canvas, core, 0, 0);

    let mut y0 = 0usize;
    for palette in palettes {
        for (k, colour) in palette.iter().enumerate() {
            let sx = core.width() as usize + (k % 8) * SWATCH;
            let sy = y0 + (k / 8) * SWATCH;
            for dy in 0..SWATCH {
                for dx in 0..SWATCH {
                    let x = (sx + dx) as u32;
                    let y = (sy + dy) as u32;
                    if x < canvas.width() && y < canvas.height() {
                        canvas.put_pixel(x, y, *colour);
                    }
                }
            }
        }
        y0 += SWATCH * (palette.len() / 8);
    }
    canvas
}

/// Save a PNG and shrink it with oxipng, keeping the original on
/// optimisation failure.
pub fn save_optimised_png(img: &RgbaImage, path: &Path) -> Result<(), NitroError> {
    img.save(path)?;
    let temp_path = path.with_extension("temp.png");
    fs::rename(path, &temp_path)?;

    let mut options = oxipng::Options::from_preset(4);
    options.bit_depth_reduction = true;
    let result = oxipng::optimize(
        &InFile::Path(temp_path.clone()),
        &OutFile::Path(Some(path.to_path_buf())),
        &options,
    );
    match result {
        Ok(()) => {
            if let Err(e) = fs::remove_file(&temp_path) {
                warn!("Failed to remove temporary file: {}", e);
            }
        }
        Err(e) => {
            warn!("PNG optimisation failed: {}", e);
            fs::rename(&temp_path, path)?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
pub struct BankMetadata {
    pub index: usize,
    pub width: i32,
    pub height: i32,
    pub layer_count: u32,
    pub duplicate: bool,
}

/// Render a tile store (and optional map) to an optimised PNG with the
/// palette strip.
pub fn export_tiles(
    path: &Path,
    tiles: &TileSet,
    map: Option<&TileMap>,
    palettes: &PaletteSet,
    width: usize,
    height: usize,
    transparency: bool,
) -> Result<(), NitroError> {
    let core = render_tiles(tiles, map, palettes, width, height, transparency);
    let pals: Vec<&Palette> = palettes.iter().map(|(_, p)| p).collect();
    save_optimised_png(&with_palette_strip(&core, &pals), path)
}

/// Render a cell bank set to an optimised PNG plus a JSON metadata
/// sidecar. With layering requested and a merge tool available, each
/// (bank, layer) canvas is saved, merged into one layered file and the
/// intermediates removed.
pub fn export_cell_banks(
    path: &Path,
    cells: &CellBankSet,
    tiles: &TileSet,
    palettes: &PaletteSet,
    transparency: bool,
    layered: bool,
    merger: Option<&dyn LayerMerger>,
) -> Result<(), NitroError> {
    let render = render_cell_banks(cells, tiles, palettes, transparency, layered);
    let pals: Vec<&Palette> = palettes.iter().map(|(_, p)| p).collect();
    save_optimised_png(&with_palette_strip(&render.canvas, &pals), path)?;

    let metadata: Vec<BankMetadata> = cells
        .banks
        .iter()
        .enumerate()
        .map(|(index, bank)| BankMetadata {
            index,
            width: bank.width,
            height: bank.height,
            layer_count: bank.layer_count,
            duplicate: bank.duplicate,
        })
        .collect();
    let json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| NitroError::format("NCER", format!("metadata: {}", e)))?;
    fs::write(path.with_extension("json"), json)?;

    if let (true, Some(merger)) = (render.layered, merger) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut merge_inputs = vec![("palette".to_string(), path.to_path_buf())];
        for layer in &render.layers {
            let label = layer.label(&stem);
            let layer_path = path.with_file_name(format!("{}.png", label));
            layer.image.save(&layer_path)?;
            merge_inputs.push((label, layer_path));
        }
        let merged = merger.merge(&merge_inputs, &path.with_extension("psd"));
        // Intermediates only go away once the merge has consumed them.
        if merged.is_ok() {
            for (_, layer_path) in merge_inputs.iter().skip(1) {
                if let Err(e) = fs::remove_file(layer_path) {
                    warn!("Failed to remove layer file: {}", e);
                }
            }
        }
        merged?;
    }
    Ok(())
}

/// Render a model texture to an optimised PNG, with the palette strip
/// for the indexed formats.
pub fn export_texture(path: &Path, model: &Model, index: usize) -> Result<(), NitroError> {
    let core = render_texture(model, index)?;
    let img = if model.textures[index].format == TextureFormat::Direct {
        core
    } else {
        let palette = model
            .palettes
            .get(index)
            .or_else(|| model.palettes.first());
        match palette {
            Some(palette) => with_palette_strip(&core, &[&palette.colours]),
            None => core,
        }
    };
    save_optimised_png(&img, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nitro::cells::tests::{build_ncer, pack_cell};
    use crate::nitro::map::tests::build_nscr;
    use crate::nitro::palette::tests::build_nclr;
    use crate::nitro::tiles::tests::build_ncgr;
    use crate::nitro::{read_nclr, read_ncer, read_ncgr, read_nscr, Bpp};

    fn sixteen_colours() -> Vec<u16> {
        (0..16u16).collect()
    }

    fn two_tile_store() -> crate::nitro::TileSet {
        // Tile 0: pixel value x % 16; tile 1: constant 3.
        let mut payload = Vec::new();
        for x in (0..64).step_by(2) {
            let lo = (x % 16) as u8;
            let hi = ((x + 1) % 16) as u8;
            payload.push((hi << 4) | lo);
        }
        payload.extend(std::iter::repeat(0x33).take(32));
        read_ncgr(&build_ncgr(&payload, Bpp::Four, false, 2, 1)).unwrap()
    }

    #[test]
    fn renders_map_against_palette() {
        let tiles = two_tile_store();
        let map = read_nscr(&build_nscr(&[0x0000, 0x0001], 16, 8)).unwrap();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();

        let img = render_tiles(&tiles, Some(&map), &palettes, 16, 8, false);
        assert_eq!((img.width(), img.height()), (16, 8));

        // Left half is tile 0: nibble indices against the palette.
        let palette = palettes.get(0).unwrap();
        for y in 0..8u32 {
            for x in 0..8u32 {
                let index = ((y * 8 + x) % 16) as usize;
                assert_eq!(img.get_pixel(x, y), &palette[index]);
            }
        }
        // Right half is tile 1: constant index 3.
        assert_eq!(img.get_pixel(8, 0), &palette[3]);
        assert_eq!(img.get_pixel(15, 7), &palette[3]);
    }

    #[test]
    fn transparency_leaves_index_zero_unset() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let img = render_tiles(&tiles, None, &palettes, 16, 8, true);
        // Pixel 0 of tile 0 has index 0.
        assert_eq!(img.get_pixel(0, 0)[3], 0);
        assert_eq!(img.get_pixel(1, 0), &palettes.get(0).unwrap()[1]);
    }

    #[test]
    fn map_flips_mirror_the_tile() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let plain = read_nscr(&build_nscr(&[0x0000], 8, 8)).unwrap();
        let flipped = read_nscr(&build_nscr(&[0x0000 | (1 << 10)], 8, 8)).unwrap();

        let img = render_tiles(&tiles, Some(&plain), &palettes, 8, 8, false);
        let mirrored = render_tiles(&tiles, Some(&flipped), &palettes, 8, 8, false);
        for y in 0..8u32 {
            for x in 0..8u32 {
                assert_eq!(img.get_pixel(x, y), mirrored.get_pixel(7 - x, y));
            }
        }
    }

    #[test]
    fn cell_banks_render_stacked() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let ncer = build_ncer(&[
            vec![pack_cell(0, 0, 0, 0, 0, 0, 0, false, false)],
            vec![pack_cell(0, 0, 0, 0, 1, 0, 0, false, false)],
        ]);
        let cells = read_ncer(&ncer).unwrap();

        let render = render_cell_banks(&cells, &tiles, &palettes, false, false);
        assert_eq!((render.canvas.width(), render.canvas.height()), (8, 16));
        let palette = palettes.get(0).unwrap();
        // Bank 0 shows tile 0, bank 1 shows tile 1 below it.
        assert_eq!(render.canvas.get_pixel(1, 0), &palette[1]);
        assert_eq!(render.canvas.get_pixel(0, 8), &palette[3]);
    }

    #[test]
    fn duplicate_banks_are_not_rendered() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let ncer = build_ncer(&[
            vec![pack_cell(0, 0, 0, 0, 0, 0, 0, false, false)],
            vec![pack_cell(0, 0, 0, 0, 0, 0, 0, false, false)],
        ]);
        let cells = read_ncer(&ncer).unwrap();

        let render = render_cell_banks(&cells, &tiles, &palettes, false, false);
        // Only the first bank contributes height.
        assert_eq!((render.canvas.width(), render.canvas.height()), (8, 8));
    }

    #[test]
    fn layered_render_splits_overlapping_cells() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let ncer = build_ncer(&[vec![
            pack_cell(0, 0, 0, 0, 0, 0, 0, false, false),
            pack_cell(4, 0, 0, 0, 1, 0, 0, false, false),
        ]]);
        let cells = read_ncer(&ncer).unwrap();

        let render = render_cell_banks(&cells, &tiles, &palettes, false, true);
        assert!(render.layered);
        assert_eq!(render.layers.len(), 2);
        assert_eq!(render.layers[0].label("spr"), "spr_0_0");
        assert_eq!(render.layers[1].label("spr"), "spr_0_1");
        // The second layer holds only the overlapping cell.
        assert_eq!(render.layers[1].image.get_pixel(0, 0)[3], 0);
        assert_eq!(
            render.layers[1].image.get_pixel(4, 0),
            &palettes.get(0).unwrap()[3]
        );
    }

    #[test]
    fn layering_disables_when_everything_is_flat() {
        let tiles = two_tile_store();
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let ncer = build_ncer(&[vec![pack_cell(0, 0, 0, 0, 0, 0, 0, false, false)]]);
        let cells = read_ncer(&ncer).unwrap();

        let render = render_cell_banks(&cells, &tiles, &palettes, false, true);
        assert!(!render.layered);
        assert!(render.layers.is_empty());
    }

    #[test]
    fn palette_strip_extends_the_canvas() {
        let palettes = read_nclr(&build_nclr(&sixteen_colours(), false, None)).unwrap();
        let core = RgbaImage::new(16, 8);
        let pals: Vec<&Palette> = palettes.iter().map(|(_, p)| p).collect();
        let img = with_palette_strip(&core, &pals);

        assert_eq!(img.width(), 16 + STRIP_WIDTH);
        // 16 colours make two swatch rows of five pixels.
        assert_eq!(img.height(), 10);
        assert_eq!(img.get_pixel(16, 0), &palettes.get(0).unwrap()[0]);
        assert_eq!(img.get_pixel(16 + 5, 0), &palettes.get(0).unwrap()[1]);
        assert_eq!(img.get_pixel(16, 5), &palettes.get(0).unwrap()[8]);
    }
}
