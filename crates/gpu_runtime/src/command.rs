//! Command vocabulary shared by every backend.
//!
//! Commands are recorded in order and executed on `submit`. Host writes to a mapped
//! upload buffer are visible to every command that executes after the buffer is
//! unmapped, including commands recorded before the write.

use bitflags::bitflags;
use smallvec::SmallVec;
use vram_model::{Rect, SemiTransparentMode};

use crate::error::GpuError;
use crate::key::{BufferHandle, ImageHandle};
use crate::program::{HdTexturePush, PrimitiveVertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// One VRAM word per texel.
    R32Uint,
    /// Packed `0xAABBGGRR`.
    Rgba8,
    R8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub format: ImageFormat,
}

impl ImageDesc {
    pub const fn new(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            levels: 1,
            format,
        }
    }

    pub const fn with_levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    pub fn level_texels(&self, level: u32) -> usize {
        let (width, height) = self.level_extent(level);
        width as usize * height as usize
    }

    /// Texel offset of `level` when every level is stored back to back.
    pub fn level_offset(&self, level: u32) -> usize {
        (0..level).map(|previous| self.level_texels(previous)).sum()
    }

    pub fn total_texels(&self) -> usize {
        self.level_offset(self.levels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Host-written, read by dispatches and buffer-to-image copies.
    Upload,
    /// Written by image-to-buffer copies, read by the host after `submit`.
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_image_dimension_2d: u32,
    /// Largest number of 16-bit elements a single upload dispatch may address.
    pub max_texel_buffer_elements: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_image_dimension_2d: 16384,
            max_texel_buffer_elements: 1 << 27,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const COMPUTE = 1 << 0;
        const TRANSFER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const TRANSFER_READ = 1 << 2;
        const TRANSFER_WRITE = 1 << 3;
        const COLOR_ATTACHMENT_READ = 1 << 4;
        const COLOR_ATTACHMENT_WRITE = 1 << 5;
        const INPUT_ATTACHMENT_READ = 1 << 6;
    }
}

/// Global execution and memory dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Barrier {
    pub src_stages: PipelineStages,
    pub src_access: Access,
    pub dst_stages: PipelineStages,
    pub dst_access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    /// Clears color to `color` and depth to `depth`.
    Clear { color: [f32; 4], depth: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassDesc {
    /// Scaled framebuffer, level 0.
    pub target: ImageHandle,
    /// Unscaled framebuffer sampled by textured programs.
    pub vram: ImageHandle,
    /// Render area in target pixels.
    pub area: Rect,
    pub load: LoadOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterProgram {
    Flat,
    Textured,
    /// Textured primitive that is semi-transparent: only texels without the mask bit.
    TexturedOpaqueTexels,
    /// Fixed-function blended pass; textured variants keep only semi-transparent texels.
    SemiTransparent {
        textured: bool,
        mode: SemiTransparentMode,
    },
    /// Programmable blend reading the current target texel. Skips texels whose
    /// destination mask bit is set.
    Feedback {
        textured: bool,
        mode: SemiTransparentMode,
    },
}

impl RasterProgram {
    pub const fn reads_target(self) -> bool {
        matches!(self, RasterProgram::Feedback { .. })
    }

    pub const fn is_textured(self) -> bool {
        match self {
            RasterProgram::Flat => false,
            RasterProgram::Textured | RasterProgram::TexturedOpaqueTexels => true,
            RasterProgram::SemiTransparent { textured, .. }
            | RasterProgram::Feedback { textured, .. } => textured,
        }
    }
}

/// Replacement image a textured draw samples before falling back to VRAM.
///
/// `image` is an `Rgba8` image with every level of the replacement. Texels equal to
/// `0xff000000` or outside `params.texel_rect` fall through to VRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HdSampling {
    pub image: ImageHandle,
    pub params: HdTexturePush,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub program: RasterProgram,
    /// Scissor in target pixels.
    pub scissor: Rect,
    pub vertices: Vec<PrimitiveVertex>,
    pub hd: Option<HdSampling>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyPass {
    /// Level 0 into level 1.
    First,
    Middle,
    /// Last level into the bias image.
    Blur,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanoutProgram {
    Scaled { dither: bool },
    Unscaled { dither: bool },
    Bpp24 { yuv: bool },
    Adaptive { dither: bool },
}

/// Compute programs and their image bindings, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeProgram {
    /// `[scaled, unscaled]`, storage: `BlockRect` list, push: `ResolvePush`.
    ResolveToScaled,
    /// `[unscaled, scaled]`, storage: `BlockRect` list, push: `ResolvePush`.
    ResolveToUnscaled,
    /// `[target]`, storage: `BlitInfo` list, push: `ResolvePush`.
    BlitVram { scaled: bool, masked: bool },
    /// `[target]`, push: `CachedBlitPush`. Runs as one serialized workgroup.
    BlitVramCached { scaled: bool, masked: bool },
    /// `[unscaled]` plus the upload buffer, push: `CopyToVramPush`.
    CopyToVram { masked: bool },
    /// `[scaled]` for `First`/`Middle`, `[bias, scaled]` for `Blur`, push: `MipmapPush`.
    Mipmap(EnergyPass),
    /// `[output, source]`, or `[output, scaled, bias]` for `Adaptive`, push: `ScanoutPush`.
    Scanout(ScanoutProgram),
}

impl ComputeProgram {
    pub const fn image_count(self) -> usize {
        match self {
            ComputeProgram::ResolveToScaled | ComputeProgram::ResolveToUnscaled => 2,
            ComputeProgram::BlitVram { .. }
            | ComputeProgram::BlitVramCached { .. }
            | ComputeProgram::CopyToVram { .. } => 1,
            ComputeProgram::Mipmap(EnergyPass::Blur) => 2,
            ComputeProgram::Mipmap(_) => 1,
            ComputeProgram::Scanout(ScanoutProgram::Adaptive { .. }) => 3,
            ComputeProgram::Scanout(_) => 2,
        }
    }

    pub const fn needs_buffer(self) -> bool {
        matches!(self, ComputeProgram::CopyToVram { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeDispatch {
    pub program: ComputeProgram,
    pub images: SmallVec<[ImageHandle; 4]>,
    pub buffer: Option<BufferHandle>,
    pub push: Vec<u8>,
    pub storage: Vec<u8>,
    pub groups: [u32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Barrier),
    /// Fills every level with `value`.
    ClearImage {
        image: ImageHandle,
        value: u32,
    },
    Dispatch(ComputeDispatch),
    /// Copies `region` of `level` into the buffer as tightly packed `u32` texels.
    CopyImageToBuffer {
        image: ImageHandle,
        level: u32,
        region: Rect,
        buffer: BufferHandle,
    },
    /// Copies tightly packed `u32` texels from the buffer into `region` of `level`.
    CopyBufferToImage {
        buffer: BufferHandle,
        image: ImageHandle,
        level: u32,
        region: Rect,
    },
    BeginRenderPass(RenderPassDesc),
    Draw(DrawCall),
    /// Makes attachment writes so far visible to `Feedback` programs.
    PixelBarrier,
    EndRenderPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub submits: u64,
    pub barriers: u64,
    pub dispatches: u64,
    pub render_passes: u64,
    pub draws: u64,
    /// Draws sampling a replacement texture.
    pub hd_draws: u64,
    pub pixel_barriers: u64,
}

/// Explicit-barrier command recording service.
pub trait GpuDevice {
    fn limits(&self) -> DeviceLimits;

    fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, GpuError>;
    fn release_image(&mut self, image: ImageHandle) -> Result<(), GpuError>;
    fn image_desc(&self, image: ImageHandle) -> Result<ImageDesc, GpuError>;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle, GpuError>;
    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), GpuError>;
    /// Host view of an upload buffer until `unmap_buffer`.
    fn map_buffer(&mut self, buffer: BufferHandle) -> Result<&mut [u8], GpuError>;
    fn unmap_buffer(&mut self, buffer: BufferHandle) -> Result<(), GpuError>;
    /// Contents of a readback buffer as of the last `submit`.
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError>;

    fn record(&mut self, command: Command) -> Result<(), GpuError>;
    /// Executes everything recorded so far and waits for completion.
    fn submit(&mut self) -> Result<(), GpuError>;

    fn stats(&self) -> DeviceStats;
}
