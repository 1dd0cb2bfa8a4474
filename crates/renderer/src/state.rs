//! Emulated GPU register state and the value types the surrounding emulator feeds in.

use serde::{Deserialize, Serialize};
use vram_model::{Rect, SemiTransparentMode, TextureMode, TextureWindow};

/// One input vertex in VRAM pixel space, before the draw offset is applied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    /// Perspective weight, normally 1.0.
    pub w: f32,
    /// `0x00BBGGRR`.
    pub color: u32,
    pub u: u16,
    pub v: u16,
}

impl Vertex {
    pub const fn new(x: f32, y: f32, color: u32) -> Self {
        Self {
            x,
            y,
            w: 1.0,
            color,
            u: 0,
            v: 0,
        }
    }

    pub const fn with_uv(mut self, u: u16, v: u16) -> Self {
        self.u = u;
        self.v = v;
        self
    }
}

/// Horizontal resolution selected by GP1(08h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WidthMode {
    Width256,
    #[default]
    Width320,
    Width368,
    Width512,
    Width640,
}

impl WidthMode {
    /// GPU clock cycles per output pixel.
    pub const fn clock_divider(self) -> i32 {
        match self {
            WidthMode::Width256 => 10,
            WidthMode::Width320 => 8,
            WidthMode::Width368 => 7,
            WidthMode::Width512 => 5,
            WidthMode::Width640 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanoutMode {
    /// 15-bit color, no dithering applied at scanout.
    #[default]
    Abgr1555,
    /// 15-bit color with the ordered dither applied at scanout.
    Abgr1555Dither,
    /// 24-bit color packed into 16-bit words.
    Bgr24,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanoutFilter {
    #[default]
    None,
    /// Scan out the unscaled domain, which the resolve has supersampled.
    Ssaa,
    /// Smooth 24-bit chroma the way MDEC output expects.
    MdecYuv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DisplayMode {
    /// Displayed VRAM area in native pixels.
    pub rect: Rect,
    pub scanout_mode: ScanoutMode,
    pub is_pal: bool,
    pub is_480i: bool,
    pub width_mode: WidthMode,
}

/// Output placement of the displayed area, relative to the visible screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Texel footprint of the primitive being drawn, in texture-page texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UvLimits {
    pub min_u: u16,
    pub min_v: u16,
    pub max_u: u16,
    pub max_v: u16,
}

impl Default for UvLimits {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl UvLimits {
    /// Never clamps; the whole page may be sampled.
    pub const UNBOUNDED: UvLimits = UvLimits {
        min_u: 0,
        min_v: 0,
        max_u: u16::MAX,
        max_v: u16::MAX,
    };

    /// Limits for one primitive under `window`.
    ///
    /// Quads get a one-texel offset on axes where the texture runs backwards across the
    /// screen, so that flipped sprites still sample the intended texels when upscaled.
    pub fn for_primitive(window: TextureWindow, vertices: &[Vertex], quad: bool) -> Self {
        if !window.is_open() || vertices.is_empty() {
            return Self::UNBOUNDED;
        }
        let (off_u, off_v) = if quad && vertices.len() >= 3 {
            flip_offset(&vertices[..3])
        } else {
            (0, 0)
        };

        let mut limits = UvLimits {
            min_u: u16::MAX,
            min_v: u16::MAX,
            max_u: 0,
            max_v: 0,
        };
        for vertex in vertices {
            limits.min_u = limits.min_u.min(vertex.u);
            limits.min_v = limits.min_v.min(vertex.v);
            limits.max_u = limits.max_u.max(vertex.u);
            limits.max_v = limits.max_v.max(vertex.v);
        }

        let (min_u, max_u) = finalize_axis(limits.min_u, limits.max_u, off_u);
        let (min_v, max_v) = finalize_axis(limits.min_v, limits.max_v, off_v);
        UvLimits {
            min_u,
            min_v,
            max_u,
            max_v,
        }
    }

    /// Whether the footprint fits inside one 256x256 page.
    pub const fn within_page(&self) -> bool {
        self.max_u <= 255 && self.max_v <= 255 && self.min_u <= self.max_u && self.min_v <= self.max_v
    }
}

fn finalize_axis(min: u16, max: u16, offset: u16) -> (u16, u16) {
    let min = min.wrapping_add(offset);
    let mut max = max.wrapping_add(offset);
    if max > min {
        max -= 1;
    }
    // Same page in both limits: wrap max into it.
    if max & 0xff00 == min & 0xff00 {
        max &= 0xff;
    }
    (min, max)
}

/// Texture offsets for X- and Y-flipped primitives, from the UV screen-space derivatives.
fn flip_offset(vertices: &[Vertex]) -> (u16, u16) {
    let [a, b, c] = [vertices[0], vertices[1], vertices[2]];
    let (abx, aby) = (b.x - a.x, b.y - a.y);
    let (bcx, bcy) = (c.x - b.x, c.y - b.y);
    let (cax, cay) = (a.x - c.x, a.y - c.y);

    let area = bcx * cay - bcy * cax;
    let (ua, ub, uc) = (f32::from(a.u), f32::from(b.u), f32::from(c.u));
    let (va, vb, vc) = (f32::from(a.v), f32::from(b.v), f32::from(c.v));
    let texture_area = (ub - ua) * (vc - va) - (uc - ua) * (vb - va);
    if area == 0.0 || texture_area == 0.0 {
        return (0, 0);
    }

    let dudx = (-aby * uc - bcy * ua - cay * ub) / area;
    let dvdx = (-aby * vc - bcy * va - cay * vb) / area;
    let dudy = (abx * uc + bcx * ua + cax * ub) / area;
    let dvdy = (abx * vc + bcx * va + cax * vb) / area;

    let flipped = |dx: f32, dy: f32| (dx < 0.0 && dy == 0.0) || (dy < 0.0 && dx == 0.0);
    (u16::from(flipped(dudx, dudy)), u16::from(flipped(dvdx, dvdy)))
}

/// Effective rect selected by a masked texture window: the power-of-two span covering the
/// mask, aligned by the OR bits.
pub fn compute_window_rect(window: TextureWindow) -> Rect {
    let axis = |mask: u8, or: u8| {
        let bits = u32::BITS - u32::from(mask).leading_zeros();
        let size = 1u32 << bits;
        (u32::from(or) & !(size - 1), size)
    };
    let (x, width) = axis(window.mask_x, window.or_x);
    let (y, height) = axis(window.mask_y, window.or_y);
    Rect::new(x, y, width, height)
}

/// Everything a save state needs to rebuild the renderer besides VRAM itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderState {
    pub display_mode: DisplayMode,
    pub texture_window: TextureWindow,
    pub cached_window_rect: Rect,
    pub draw_rect: Rect,
    pub draw_offset_x: i32,
    pub draw_offset_y: i32,
    pub palette_offset_x: u32,
    pub palette_offset_y: u32,
    pub texture_offset_x: u32,
    pub texture_offset_y: u32,

    pub texture_mode: TextureMode,
    pub semi_transparent: SemiTransparentMode,
    pub display_filter: ScanoutFilter,
    pub uv_limits: UvLimits,

    pub force_mask_bit: bool,
    pub texture_color_modulate: bool,
    pub mask_test: bool,
    pub display_on: bool,
    pub dither: bool,
    pub dither_native_resolution: bool,
    pub adaptive_smoothing: bool,
    pub crop_overscan: bool,

    pub horiz_start: i32,
    pub horiz_end: i32,
    pub vert_start: i32,
    pub vert_end: i32,
    pub offset_cycles: i32,
    pub slstart: i32,
    pub slend: i32,
    pub slstart_pal: i32,
    pub slend_pal: i32,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            display_mode: DisplayMode::default(),
            texture_window: TextureWindow::OPEN,
            cached_window_rect: compute_window_rect(TextureWindow::OPEN),
            draw_rect: Rect::default(),
            draw_offset_x: 0,
            draw_offset_y: 0,
            palette_offset_x: 0,
            palette_offset_y: 0,
            texture_offset_x: 0,
            texture_offset_y: 0,
            texture_mode: TextureMode::None,
            semi_transparent: SemiTransparentMode::None,
            display_filter: ScanoutFilter::None,
            uv_limits: UvLimits::UNBOUNDED,
            force_mask_bit: false,
            texture_color_modulate: false,
            mask_test: false,
            display_on: false,
            dither: false,
            dither_native_resolution: false,
            adaptive_smoothing: true,
            crop_overscan: false,
            horiz_start: 0x200,
            horiz_end: 0xc00,
            vert_start: 0x10,
            vert_end: 0x100,
            offset_cycles: 0,
            slstart: 0,
            slend: 239,
            slstart_pal: 0,
            slend_pal: 287,
        }
    }
}

/// Raw unscaled VRAM, one 32-bit word per pixel in row-major order, plus the render state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveState {
    pub vram: Vec<u32>,
    pub state: RenderState,
}

/// Work counters since the last `reset_counters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub render_passes: u64,
    pub fragment_readback_pixels: u64,
    pub fragment_writeout_pixels: u64,
    pub draw_calls: u64,
    /// Draws sampling a replacement texture.
    pub hd_draw_calls: u64,
    pub vertices: u64,
    pub native_draw_calls: u64,
}

pub(crate) fn bump(counter: &mut u64, amount: u64) {
    *counter = counter.checked_add(amount).expect("counter overflow");
}
