//! # NSBMD model textures
//!
//! The TEX0 block of a model file holds a texture directory, a palette
//! directory and three data regions: standard texture data, compressed
//! (4x4 texel) texture data and the compressed textures' auxiliary
//! descriptors. Seven pixel encodings are supported; the compressed one
//! carries a per-block palette offset and blend mode.

use std::io::Cursor;

use image::{Rgba, RgbaImage};
use log::{debug, warn};

use crate::binary_utils::{read_bytes, read_string, read_u16_le, read_u32_le, read_u8, seek_to, skip};
use crate::nitro::{blend_colours, read_colour, NitroError, Palette};

/// Block signature value that marks a model-only file without textures.
const MODEL_ONLY_TAG: u16 = 0x444D; // "MD" of MDL0

/// Bits per pixel for formats 0-7.
pub const FORMAT_BPP: [usize; 8] = [0, 8, 2, 4, 8, 2, 8, 16];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    /// No texel data.
    Empty,
    /// 3-bit alpha, 5-bit palette index.
    A3I5,
    /// 2-bit palette index, four colours.
    Pal4,
    /// 4-bit palette index.
    Pal16,
    /// 8-bit palette index.
    Pal256,
    /// 4x4 texel compressed blocks.
    Compressed,
    /// 5-bit alpha, 3-bit palette index.
    A5I3,
    /// Direct 16-bit colour.
    Direct,
}

impl TextureFormat {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 7 {
            1 => TextureFormat::A3I5,
            2 => TextureFormat::Pal4,
            3 => TextureFormat::Pal16,
            4 => TextureFormat::Pal256,
            5 => TextureFormat::Compressed,
            6 => TextureFormat::A5I3,
            7 => TextureFormat::Direct,
            _ => TextureFormat::Empty,
        }
    }

    pub fn bits_per_pixel(self) -> usize {
        FORMAT_BPP[self as usize]
    }
}

/// Texel payload; only the compressed format carries descriptors.
#[derive(Clone, Debug)]
pub enum TexturePayload {
    Bytes(Vec<u8>),
    Blocks {
        /// One 32-bit word of sixteen 2-bit selectors per 4x4 block.
        texels: Vec<u32>,
        /// One per block: 14-bit palette base address and 2-bit mode.
        descriptors: Vec<u16>,
    },
}

#[derive(Clone, Debug)]
pub struct Texture {
    pub name: String,
    pub format: TextureFormat,
    pub width: usize,
    pub height: usize,
    /// Texel data size in bytes.
    pub size: usize,
    /// Absolute payload position in the source binary.
    pub offset: usize,
    pub payload: TexturePayload,
}

#[derive(Clone, Debug)]
pub struct ModelPalette {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub colours: Palette,
}

pub struct Model {
    pub textures: Vec<Texture>,
    pub palettes: Vec<ModelPalette>,
}

/// Decode the texture/palette directory of an NSBMD model file.
///
/// A model without a texture block yields `Ok(None)`.
pub fn read_nsbmd(data: &[u8]) -> Result<Option<Model>, NitroError> {
    let mut cursor = Cursor::new(data);

    seek_to(&mut cursor, 20)?;
    let block_offset = read_u16_le(&mut cursor)? as u64;
    if block_offset == MODEL_ONLY_TAG as u64 {
        return Ok(None);
    }

    seek_to(&mut cursor, block_offset + 4)?;
    let block_size = read_u32_le(&mut cursor)? as u64;
    let block_limit = block_offset + block_size;
    skip(&mut cursor, 4)?;
    let _tex_data_size = read_u16_le(&mut cursor)? as u64 * 8;
    skip(&mut cursor, 6)?;
    let tex_data_offset = read_u32_le(&mut cursor)? as u64 + block_offset;
    skip(&mut cursor, 4)?;
    let _sp_tex_size = read_u16_le(&mut cursor)? as u64 * 8;
    skip(&mut cursor, 6)?;
    let sp_tex_offset = read_u32_le(&mut cursor)? as u64 + block_offset;
    let sp_data_offset = read_u32_le(&mut cursor)? as u64 + block_offset;
    skip(&mut cursor, 4)?;
    let _pal_data_size = read_u16_le(&mut cursor)? as u64 * 8;
    skip(&mut cursor, 2)?;
    let pal_def_offset = read_u32_le(&mut cursor)? as u64 + block_offset;
    let pal_data_offset = read_u32_le(&mut cursor)? as u64 + block_offset;

    // Texture directory.
    skip(&mut cursor, 1)?;
    let tex_count = read_u8(&mut cursor)? as usize;
    let directory_pos = cursor.position();
    seek_to(&mut cursor, pal_def_offset + 1)?;
    let pal_count = read_u8(&mut cursor)? as usize;
    seek_to(&mut cursor, directory_pos)?;
    debug!("NSBMD {} textures, {} palettes", tex_count, pal_count);

    skip(&mut cursor, 14 + tex_count as i64 * 4)?;
    let mut headers = Vec::with_capacity(tex_count);
    for _ in 0..tex_count {
        let offset = read_u16_le(&mut cursor)? as u64 * 8;
        let param = read_u16_le(&mut cursor)?;
        skip(&mut cursor, 4)?;
        let format = TextureFormat::from_bits(param >> 10);
        let width = 8usize << ((param >> 4) & 7);
        let height = 8usize << ((param >> 7) & 7);
        let size = width * height * format.bits_per_pixel() / 8;
        let data_offset = if format == TextureFormat::Compressed {
            offset + sp_tex_offset
        } else {
            offset + tex_data_offset
        };
        headers.push((format, width, height, size, data_offset));
    }
    let mut names = Vec::with_capacity(tex_count);
    for _ in 0..tex_count {
        names.push(read_string(&mut cursor, 16)?);
    }

    // Palette directory.
    seek_to(&mut cursor, pal_def_offset + 2 + 14 + pal_count as u64 * 4)?;
    let mut pal_offsets = Vec::with_capacity(pal_count);
    for _ in 0..pal_count {
        pal_offsets.push(read_u16_le(&mut cursor)? as u64 * 8 + pal_data_offset);
        skip(&mut cursor, 2)?;
    }
    // Palette sizes: gap to the next distinct offset, block end for the
    // last one. Coincident offsets share a palette and a size.
    let mut pal_sizes = vec![0usize; pal_count];
    for i in 0..pal_count {
        let mut next = i + 1;
        while next < pal_count && pal_offsets[next] == pal_offsets[i] {
            next += 1;
        }
        let end = if next != pal_count {
            pal_offsets[next]
        } else {
            block_limit
        };
        pal_sizes[i] = end.saturating_sub(pal_offsets[i]) as usize;
    }

    let mut palettes = Vec::with_capacity(pal_count);
    for i in 0..pal_count {
        let name = read_string(&mut cursor, 16)?;
        palettes.push(ModelPalette {
            name,
            offset: pal_offsets[i] as usize,
            size: pal_sizes[i],
            colours: Vec::new(),
        });
    }
    for palette in &mut palettes {
        seek_to(&mut cursor, palette.offset as u64)?;
        let mut colours = Vec::with_capacity(palette.size / 2);
        for _ in 0..palette.size / 2 {
            colours.push(read_colour(read_u16_le(&mut cursor)?));
        }
        palette.colours = colours;
    }

    // Texture payloads. Compressed textures consume their descriptors
    // from a shared cursor over the auxiliary region.
    let mut textures = Vec::with_capacity(tex_count);
    let mut sp_cursor = sp_data_offset;
    for (i, &(format, width, height, size, offset)) in headers.iter().enumerate() {
        let payload = if format == TextureFormat::Compressed {
            let descriptor_bytes = (size >> 1) as u64;
            seek_to(&mut cursor, sp_cursor)?;
            let mut descriptors = Vec::with_capacity(size >> 2);
            for _ in 0..descriptor_bytes / 2 {
                descriptors.push(read_u16_le(&mut cursor)?);
            }
            sp_cursor += descriptor_bytes;

            seek_to(&mut cursor, offset as u64)?;
            let mut texels = Vec::with_capacity(size / 4);
            for _ in 0..size / 4 {
                texels.push(read_u32_le(&mut cursor)?);
            }
            TexturePayload::Blocks {
                texels,
                descriptors,
            }
        } else {
            seek_to(&mut cursor, offset as u64)?;
            TexturePayload::Bytes(read_bytes(&mut cursor, size)?)
        };
        textures.push(Texture {
            name: names[i].clone(),
            format,
            width,
            height,
            size,
            offset: offset as usize,
            payload,
        });
        debug!(
            "Texture {} {:?} {}x{} ({} bytes)",
            names[i], format, width, height, size
        );
    }

    Ok(Some(Model { textures, palettes }))
}

/// Alpha expansion for the translucent formats: a 3 or 5 bit field
/// scales to 8 bits as `((a * 4) + (a / 2)) << 3`, saturating for the
/// wider field.
fn expand_alpha(a: u8) -> u8 {
    let expanded = ((a as u32 * 4) + (a as u32 / 2)) << 3;
    expanded.min(255) as u8
}

fn palette_colour(palette: &[Rgba<u8>], index: usize) -> Rgba<u8> {
    match palette.get(index) {
        Some(&colour) => colour,
        None => {
            warn!("Palette index {} is out of range {}", index, palette.len());
            Rgba([0, 0, 0, 255])
        }
    }
}

/// Decode a texture's pixels against a palette (ignored for the direct
/// colour format). Out-of-range palette indices become opaque black.
pub fn texture_to_image(tex: &Texture, palette: &[Rgba<u8>]) -> RgbaImage {
    let mut img = RgbaImage::new(tex.width as u32, tex.height as u32);
    match (&tex.payload, tex.format) {
        (_, TextureFormat::Empty) => {}
        (TexturePayload::Bytes(data), TextureFormat::A3I5) => {
            for (x, &byte) in data.iter().enumerate() {
                let index = (byte & 0x1F) as usize;
                let alpha = expand_alpha((byte >> 5) & 7);
                let colour = palette_colour(palette, index);
                put_flat(&mut img, tex.width, x, Rgba([colour[0], colour[1], colour[2], alpha]));
            }
        }
        (TexturePayload::Bytes(data), TextureFormat::A5I3) => {
            for (x, &byte) in data.iter().enumerate() {
                let index = (byte & 0x07) as usize;
                let alpha = expand_alpha((byte >> 3) & 0x1F);
                let colour = palette_colour(palette, index);
                put_flat(&mut img, tex.width, x, Rgba([colour[0], colour[1], colour[2], alpha]));
            }
        }
        (TexturePayload::Bytes(data), TextureFormat::Pal4) => {
            for x in 0..tex.width * tex.height {
                let index = (data[x / 4] >> ((x % 4) << 1)) & 3;
                put_flat(&mut img, tex.width, x, palette_colour(palette, index as usize));
            }
        }
        (TexturePayload::Bytes(data), TextureFormat::Pal16) => {
            for x in 0..tex.width * tex.height {
                let index = (data[x / 2] >> ((x % 2) << 2)) & 0x0F;
                put_flat(&mut img, tex.width, x, palette_colour(palette, index as usize));
            }
        }
        (TexturePayload::Bytes(data), TextureFormat::Pal256) => {
            for (x, &index) in data.iter().enumerate() {
                put_flat(&mut img, tex.width, x, palette_colour(palette, index as usize));
            }
        }
        (TexturePayload::Bytes(data), TextureFormat::Direct) => {
            for x in 0..tex.width * tex.height {
                let raw = u16::from_le_bytes([data[x * 2], data[x * 2 + 1]]);
                let mut colour = read_colour(raw);
                colour[3] = if raw & 0x8000 != 0 { 0xFF } else { 0 };
                put_flat(&mut img, tex.width, x, colour);
            }
        }
        (
            TexturePayload::Blocks {
                texels,
                descriptors,
            },
            TextureFormat::Compressed,
        ) => {
            decode_blocks(&mut img, tex, texels, descriptors, palette);
        }
        (_, format) => {
            warn!("Texture payload does not match format {:?}", format);
        }
    }
    img
}

fn put_flat(img: &mut RgbaImage, width: usize, flat: usize, colour: Rgba<u8>) {
    let x = (flat % width) as u32;
    let y = (flat / width) as u32;
    if x < img.width() && y < img.height() {
        img.put_pixel(x, y, colour);
    }
}

/// 4x4 texel blocks: two selector bits per texel; the descriptor picks
/// the block's slice of the palette and how selectors 2/3 resolve.
fn decode_blocks(
    img: &mut RgbaImage,
    tex: &Texture,
    texels: &[u32],
    descriptors: &[u16],
    palette: &[Rgba<u8>],
) {
    let blocks_w = tex.width / 4;
    let blocks_h = tex.height / 4;
    for by in 0..blocks_h {
        for bx in 0..blocks_w {
            let block = by * blocks_w + bx;
            let (Some(&word), Some(&descriptor)) = (texels.get(block), descriptors.get(block))
            else {
                warn!("Compressed block {} has no data", block);
                continue;
            };
            let base = ((descriptor & 0x3FFF) as usize) << 1;
            let mode = (descriptor >> 14) & 3;
            for row in 0..4 {
                for col in 0..4 {
                    let texel = (word >> ((row * 4 + col) * 2)) & 3;
                    let colour = match (mode, texel) {
                        (0, 3) | (1, 3) => Rgba([0xFF, 0xFF, 0xFF, 0]),
                        (1, 2) => blend_colours(
                            palette_colour(palette, base),
                            palette_colour(palette, base + 1),
                            1,
                            1,
                            2,
                        ),
                        (3, 2) => blend_colours(
                            palette_colour(palette, base),
                            palette_colour(palette, base + 1),
                            5,
                            3,
                            8,
                        ),
                        (3, 3) => blend_colours(
                            palette_colour(palette, base),
                            palette_colour(palette, base + 1),
                            3,
                            5,
                            8,
                        ),
                        _ => palette_colour(palette, base + texel as usize),
                    };
                    img.put_pixel((bx * 4 + col) as u32, (by * 4 + row) as u32, colour);
                }
            }
        }
    }
}
