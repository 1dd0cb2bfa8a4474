//! Conversions between replacement PNGs and the console's texel conventions.
//!
//! Replacement images are stored with a repurposed alpha channel: 0 marks opaque texels,
//! 255 marks semi-transparent ones and `(0, 0, 0, 0)` is fully transparent. Opaque or
//! semi-transparent black is nudged to `(1, 1, 1)` so it never collides with the
//! transparent sentinel.

use std::path::Path;

use bitflags::bitflags;
use image::{Rgba, RgbaImage};
use vram_model::TextureMode;

use crate::TrackerError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AlphaFlags: u8 {
        const OPAQUE = 1 << 0;
        const SEMI_TRANSPARENT = 1 << 1;
        const TRANSPARENT = 1 << 2;
    }
}

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Decoded replacement with its full mip chain.
#[derive(Debug, Clone, PartialEq)]
pub struct HdImage {
    pub levels: Vec<RgbaImage>,
    pub alpha_flags: AlphaFlags,
}

impl HdImage {
    pub fn width(&self) -> u32 {
        self.levels.first().map_or(0, RgbaImage::width)
    }

    pub fn height(&self) -> u32 {
        self.levels.first().map_or(0, RgbaImage::height)
    }

    /// Single transparent texel returned for handles that resolve to nothing.
    pub fn placeholder() -> Self {
        Self {
            levels: vec![RgbaImage::from_pixel(1, 1, TRANSPARENT)],
            alpha_flags: AlphaFlags::TRANSPARENT,
        }
    }
}

/// Reclassifies a straight-alpha image into the console alpha encoding.
pub fn convert_to_psx(source: &RgbaImage) -> (RgbaImage, AlphaFlags) {
    let mut flags = AlphaFlags::empty();
    let mut result = RgbaImage::new(source.width(), source.height());
    for (dst, src) in result.pixels_mut().zip(source.pixels()) {
        let [r, g, b, a] = src.0;
        let black = r == 0 && g == 0 && b == 0;
        *dst = match a {
            0 => {
                flags |= AlphaFlags::TRANSPARENT;
                TRANSPARENT
            }
            255 => {
                flags |= AlphaFlags::OPAQUE;
                if black { Rgba([1, 1, 1, 0]) } else { Rgba([r, g, b, 0]) }
            }
            _ => {
                flags |= AlphaFlags::SEMI_TRANSPARENT;
                if black { Rgba([1, 1, 1, 255]) } else { Rgba([r, g, b, 255]) }
            }
        };
    }
    (result, flags)
}

/// Halves both dimensions, averaging only the non-transparent texels of each 2x2
/// block. Blocks with more than two transparent texels stay transparent.
pub fn generate_mip(higher: &RgbaImage) -> RgbaImage {
    let width = higher.width() / 2;
    let height = higher.height() / 2;
    RgbaImage::from_fn(width, height, |x, y| {
        let block = [
            higher.get_pixel(x * 2, y * 2),
            higher.get_pixel(x * 2 + 1, y * 2),
            higher.get_pixel(x * 2, y * 2 + 1),
            higher.get_pixel(x * 2 + 1, y * 2 + 1),
        ];
        let transparent = block.iter().filter(|texel| ***texel == TRANSPARENT).count();
        if transparent > 2 {
            return TRANSPARENT;
        }
        let mut sums = [0u32; 4];
        for texel in block {
            for (sum, channel) in sums.iter_mut().zip(texel.0) {
                *sum += u32::from(channel);
            }
        }
        let divisor = (4 - transparent) as u32;
        Rgba(sums.map(|sum| (sum / divisor) as u8))
    })
}

/// Converts a decoded replacement and appends mips while both dimensions stay even.
pub fn prepare_levels(source: &RgbaImage) -> HdImage {
    let (base, alpha_flags) = convert_to_psx(source);
    let mut levels = vec![base];
    while let Some(last) = levels.last()
        && last.width() % 2 == 0
        && last.height() % 2 == 0
        && last.width() > 0
        && last.height() > 0
    {
        let next = generate_mip(last);
        levels.push(next);
    }
    HdImage {
        levels,
        alpha_flags,
    }
}

/// Decodes a replacement PNG and prepares its mip chain.
pub fn load_replacement(path: &Path) -> Result<HdImage, TrackerError> {
    let decoded = image::open(path)?.to_rgba8();
    Ok(prepare_levels(&decoded))
}

/// Expands an upload's VRAM words into a straight-alpha image for dumping.
///
/// Paletted modes without a palette dump the raw indices as grayscale.
pub fn dump_rgba(
    pixels: &[u16],
    width: u32,
    height: u32,
    mode: TextureMode,
    palette: Option<&[u16]>,
) -> Option<RgbaImage> {
    if mode == TextureMode::None {
        return None;
    }
    let shift = mode.shift();
    let per_word = 1u32 << shift;
    let bits = 16 >> shift;
    let mask = ((1u32 << bits) - 1) as u16;

    let mut bytes = Vec::with_capacity((width * per_word * height * 4) as usize);
    for &word in pixels.iter().take((width * height) as usize) {
        for part in 0..per_word {
            let index = (word >> (part * bits)) & mask;
            let texel = match (mode, palette) {
                (TextureMode::Abgr1555, _) => abgr1555_to_rgba(index),
                (_, Some(palette)) => abgr1555_to_rgba(palette.get(index as usize).copied().unwrap_or(0)),
                (_, None) => {
                    let gray = (255 * u32::from(index) / u32::from(mask)) as u8;
                    [gray, gray, gray, 255]
                }
            };
            bytes.extend_from_slice(&texel);
        }
    }
    RgbaImage::from_raw(width * per_word, height, bytes)
}

/// Fully transparent only for `0x0000`; any set mask bit dumps as half alpha.
fn abgr1555_to_rgba(word: u16) -> [u8; 4] {
    let channel = |shift: u16| (u32::from((word >> shift) & 0x1f) * 255 / 31) as u8;
    let (r, g, b) = (channel(0), channel(5), channel(10));
    let a = if word & 0x8000 != 0 {
        127
    } else if r == 0 && g == 0 && b == 0 {
        0
    } else {
        255
    };
    [r, g, b, a]
}
