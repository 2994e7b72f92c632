//! Codecs for the DS "Nitro" graphics asset formats.
//!
//! Decodes palettes, tile stores, background maps, sprite cell banks,
//! model textures and font glyph tables from their binary containers,
//! renders them to RGBA images, and re-encodes edited images back over
//! the original tile bytes so modified assets can be reinserted.

pub mod binary_utils;
pub mod nitro;

pub use nitro::{
    read_font_glyphs, read_nclr, read_ncer, read_ncgr, read_nitro_graphic, read_nsbmd, read_nscr,
    render_cell_banks, render_texture, render_tiles, write_ncer, write_ncgr, write_nscr,
    NitroError, NitroGraphic,
};
