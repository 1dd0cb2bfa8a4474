//! Shared value types for the emulated 1MB VRAM.
//!
//! - `Rect`: native-pixel rectangle arithmetic used by every layer above.
//! - `status`: the per-block hazard word (`StatusFlags`) and its ownership field.
//! - `pixel`: conversions between the 16-bit VRAM word and packed RGBA8.

use serde::{Deserialize, Serialize};

mod pixel;
mod status;

pub use pixel::{
    FbColor, VRAM_LSB_SHIFT, fbcolor_to_rgba8, fbcolor_to_rgba32f, rgba8_to_vram_word,
    vram_word_to_rgba8,
};
pub use status::{Ownership, StatusFlags};

pub const FB_WIDTH: u32 = 1024;
pub const FB_HEIGHT: u32 = 512;
pub const BLOCK_WIDTH: u32 = 8;
pub const BLOCK_HEIGHT: u32 = 8;
pub const NUM_BLOCKS_X: u32 = FB_WIDTH / BLOCK_WIDTH;
pub const NUM_BLOCKS_Y: u32 = FB_HEIGHT / BLOCK_HEIGHT;
pub const VRAM_PIXELS: usize = (FB_WIDTH * FB_HEIGHT) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Inclusive block coordinates covered by a rect. Coordinates are not wrapped;
/// callers fold them onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub x_begin: u32,
    pub x_end: u32,
    pub y_begin: u32,
    pub y_end: u32,
}

impl BlockRange {
    pub fn iter(self) -> impl Iterator<Item = (u32, u32)> {
        (self.y_begin..=self.y_end)
            .flat_map(move |y| (self.x_begin..=self.x_end).map(move |x| (x, y)))
    }

    pub const fn width(self) -> u32 {
        self.x_end - self.x_begin + 1
    }

    pub const fn height(self) -> u32 {
        self.y_end - self.y_begin + 1
    }
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const FULL_VRAM: Rect = Rect::new(0, 0, FB_WIDTH, FB_HEIGHT);

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        let x_begin = self.x.max(other.x);
        let x_end = self.right().min(other.right());
        let y_begin = self.y.max(other.y);
        let y_end = self.bottom().min(other.bottom());
        x_begin < x_end && y_begin < y_end
    }

    /// Clipped intersection. Disjoint rects produce a zero-area rect anchored at
    /// the max of both origins.
    pub fn scissor(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    pub fn extend_bounding_box(&mut self, other: &Rect) {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        *self = Rect::new(x0, y0, x1 - x0, y1 - y0);
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let mut result = *self;
        result.extend_bounding_box(other);
        result
    }

    pub fn offset(&self, dx: u32, dy: u32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn scaled(&self, scale: u32) -> Rect {
        Rect::new(
            self.x * scale,
            self.y * scale,
            self.width * scale,
            self.height * scale,
        )
    }

    /// Block range of a non-empty rect.
    pub fn blocks(&self) -> BlockRange {
        debug_assert!(!self.is_empty(), "block range of an empty rect");
        BlockRange {
            x_begin: self.x / BLOCK_WIDTH,
            x_end: (self.x + self.width - 1) / BLOCK_WIDTH,
            y_begin: self.y / BLOCK_HEIGHT,
            y_end: (self.y + self.height - 1) / BLOCK_HEIGHT,
        }
    }

    /// The rect grown outwards to block boundaries.
    pub fn block_aligned(&self) -> Rect {
        let x0 = self.x & !(BLOCK_WIDTH - 1);
        let y0 = self.y & !(BLOCK_HEIGHT - 1);
        let x1 = ((self.x + self.width - 1) | (BLOCK_WIDTH - 1)) + 1;
        let y1 = ((self.y + self.height - 1) | (BLOCK_HEIGHT - 1)) + 1;
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn wraps_vram(&self) -> bool {
        self.right() > FB_WIDTH || self.bottom() > FB_HEIGHT
    }

    /// Up to four rects inside VRAM covering the same texels as this one once wrapped.
    pub fn split_at_vram_edges(&self) -> impl Iterator<Item = Rect> {
        fn spans(start: u32, length: u32, limit: u32) -> [(u32, u32); 2] {
            let start = start % limit;
            let length = length.min(limit);
            let first = length.min(limit - start);
            [(start, first), (0, length - first)]
        }
        let columns = spans(self.x, self.width, FB_WIDTH);
        let rows = spans(self.y, self.height, FB_HEIGHT);
        rows.into_iter()
            .flat_map(move |(y, height)| {
                columns
                    .into_iter()
                    .map(move |(x, width)| Rect::new(x, y, width, height))
            })
            .filter(|rect| !rect.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Unscaled,
    Scaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Compute,
    Transfer,
    Fragment,
    FragmentTexture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureMode {
    #[default]
    None,
    Palette4bpp,
    Palette8bpp,
    Abgr1555,
}

impl TextureMode {
    pub const fn is_paletted(self) -> bool {
        matches!(self, TextureMode::Palette4bpp | TextureMode::Palette8bpp)
    }

    /// Horizontal texel-to-VRAM-word shift.
    pub const fn shift(self) -> u32 {
        match self {
            TextureMode::Palette4bpp => 2,
            TextureMode::Palette8bpp => 1,
            TextureMode::None | TextureMode::Abgr1555 => 0,
        }
    }

    pub const fn palette_width(self) -> u32 {
        match self {
            TextureMode::Palette8bpp => 256,
            _ => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SemiTransparentMode {
    #[default]
    None,
    Average,
    Add,
    Sub,
    AddQuarter,
}

impl SemiTransparentMode {
    /// Decodes the GP0 blend field; values outside 0..=3 disable blending.
    pub const fn from_blend_mode(blend_mode: i32) -> Self {
        match blend_mode {
            0 => SemiTransparentMode::Average,
            1 => SemiTransparentMode::Add,
            2 => SemiTransparentMode::Sub,
            3 => SemiTransparentMode::AddQuarter,
            _ => SemiTransparentMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureWindow {
    pub mask_x: u8,
    pub mask_y: u8,
    pub or_x: u8,
    pub or_y: u8,
}

impl Default for TextureWindow {
    fn default() -> Self {
        Self::OPEN
    }
}

impl TextureWindow {
    pub const OPEN: TextureWindow = TextureWindow {
        mask_x: 0xff,
        mask_y: 0xff,
        or_x: 0,
        or_y: 0,
    };

    /// Builds the window from the GP0(E2) register fields, given in 8-texel units.
    pub const fn from_registers(tww: u32, twh: u32, twx: u32, twy: u32) -> Self {
        Self {
            mask_x: !(tww << 3) as u8,
            mask_y: !(twh << 3) as u8,
            or_x: ((twx & tww) << 3) as u8,
            or_y: ((twy & twh) << 3) as u8,
        }
    }

    pub const fn is_open(&self) -> bool {
        self.mask_x == 0xff && self.mask_y == 0xff
    }
}
