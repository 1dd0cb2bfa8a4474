//! Plain-data layouts shared by the renderer and every backend. Field order matches the
//! WGSL declarations.

use bytemuck::{Pod, Zeroable};
use vram_model::Rect;

/// Ordered dither offsets, row-major 4x4, biased by +4.
pub const DITHER_LUT: [u8; 16] = [0, 4, 1, 5, 6, 2, 7, 3, 1, 5, 0, 4, 7, 3, 6, 2];

/// Texture shift value marking an untextured vertex.
pub const UNTEXTURED: i16 = -1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PrimitiveVertex {
    /// Native VRAM pixels; `w` is the perspective weight.
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
    /// `0xMMBBGGRR`, top byte set when the mask bit is forced.
    pub color: u32,
    /// `mask_x, mask_y, or_x, or_y` in texel units.
    pub window: [u8; 4],
    pub pal_x: i16,
    pub pal_y: i16,
    /// Texture shift (0, 1, 2) or [`UNTEXTURED`].
    pub params: i16,
    pub _pad: i16,
    pub u: i16,
    pub v: i16,
    pub base_u: i16,
    pub base_v: i16,
    pub min_u: u16,
    pub min_v: u16,
    pub max_u: u16,
    pub max_v: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ResolvePush {
    pub scale: u32,
    pub _pad: [u32; 3],
}

impl ResolvePush {
    pub const fn new(scale: u32) -> Self {
        Self {
            scale,
            _pad: [0; 3],
        }
    }
}

/// Native-pixel rect, one per workgroup layer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct BlockRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<Rect> for BlockRect {
    fn from(rect: Rect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
    }
}

/// One non-overlapping block copy in target pixels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct BlitInfo {
    pub src_offset: [u32; 2],
    pub dst_offset: [u32; 2],
    pub extent: [u32; 2],
    pub mask_or: u32,
    pub _pad: u32,
}

impl BlitInfo {
    pub const fn new(src_offset: [u32; 2], dst_offset: [u32; 2], extent: [u32; 2], mask_or: u32) -> Self {
        Self {
            src_offset,
            dst_offset,
            extent,
            mask_or,
            _pad: 0,
        }
    }
}

/// Overlapping copy in native pixels, expanded by `scale` on the scaled image.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct CachedBlitPush {
    pub src_offset: [u32; 2],
    pub dst_offset: [u32; 2],
    pub extent: [u32; 2],
    pub scale: u32,
    pub mask_or: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct CopyToVramPush {
    /// Destination rect in native pixels.
    pub rect: [u32; 4],
    /// First 16-bit element of the rect in the upload buffer.
    pub offset: u32,
    pub mask_or: u32,
    pub _pad: [u32; 2],
}

impl CopyToVramPush {
    pub const fn new(rect: Rect, offset: u32, mask_or: u32) -> Self {
        Self {
            rect: [rect.x, rect.y, rect.width, rect.height],
            offset,
            mask_or,
            _pad: [0; 2],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct MipmapPush {
    /// Region in native pixels.
    pub rect: [u32; 4],
    /// Scale of level 0.
    pub scale: u32,
    /// Destination level, or the source level for the blur pass.
    pub level: u32,
    pub _pad: [u32; 2],
}

impl MipmapPush {
    pub const fn new(rect: Rect, scale: u32, level: u32) -> Self {
        Self {
            rect: [rect.x, rect.y, rect.width, rect.height],
            scale,
            level,
            _pad: [0; 2],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ScanoutPush {
    /// Source rect in native pixels.
    pub src: [u32; 4],
    /// Where the source lands in the output image, in output pixels.
    pub dst_offset: [i32; 2],
    pub dst_extent: [u32; 2],
    pub scale: u32,
    pub dither_shift: u32,
    pub _pad: [u32; 2],
}

impl ScanoutPush {
    pub const fn new(
        src: Rect,
        dst_offset: [i32; 2],
        dst_extent: [u32; 2],
        scale: u32,
        dither_shift: u32,
    ) -> Self {
        Self {
            src: [src.x, src.y, src.width, src.height],
            dst_offset,
            dst_extent,
            scale,
            dither_shift,
            _pad: [0; 2],
        }
    }
}

/// Replacement texture sampled in place of VRAM texels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct HdTexturePush {
    /// VRAM area the replacement stands in for, in VRAM words.
    pub vram_rect: [u32; 4],
    /// Region of level 0 covering `vram_rect`, in replacement texels.
    pub texel_rect: [u32; 4],
    /// Level 0 extent.
    pub extent: [u32; 2],
    pub levels: u32,
    pub _pad: u32,
}

impl HdTexturePush {
    pub const fn new(vram_rect: Rect, texel_rect: Rect, extent: [u32; 2], levels: u32) -> Self {
        Self {
            vram_rect: [vram_rect.x, vram_rect.y, vram_rect.width, vram_rect.height],
            texel_rect: [texel_rect.x, texel_rect.y, texel_rect.width, texel_rect.height],
            extent,
            levels,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_shader_strides() {
        assert_eq!(std::mem::size_of::<PrimitiveVertex>(), 48);
        assert_eq!(std::mem::size_of::<BlitInfo>(), 32);
        assert_eq!(std::mem::size_of::<CachedBlitPush>(), 32);
        assert_eq!(std::mem::size_of::<CopyToVramPush>(), 32);
        assert_eq!(std::mem::size_of::<MipmapPush>(), 32);
        assert_eq!(std::mem::size_of::<ScanoutPush>(), 48);
        assert_eq!(std::mem::size_of::<HdTexturePush>(), 48);
        assert_eq!(std::mem::size_of::<ResolvePush>() % 16, 0);
    }
}
