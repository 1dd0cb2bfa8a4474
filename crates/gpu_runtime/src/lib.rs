//! Explicit-barrier GPU command runtime.
//!
//! The renderer records [`Command`]s against a [`GpuDevice`] and executes them with
//! `submit`. Images are 2D arrays of `u32` texels (VRAM words or packed RGBA8) and
//! every post-processing step is a [`ComputeProgram`], so both backends share one
//! binding model:
//! - [`SoftwareGpu`] runs every command except rasterization on host memory.
//! - `WgpuDevice` (feature `wgpu-backend`) runs everything on a wgpu device.

mod command;
mod error;
mod key;
mod program;
mod slots;
mod software;
mod validate;
#[cfg(feature = "wgpu-backend")]
mod wgpu_backend;

pub use command::{
    Access, Barrier, BufferUsage, Command, ComputeDispatch, ComputeProgram, DeviceLimits,
    DeviceStats, DrawCall, EnergyPass, GpuDevice, HdSampling, ImageDesc, ImageFormat, LoadOp,
    PipelineStages, RasterProgram, RenderPassDesc, ScanoutProgram,
};
pub use error::GpuError;
pub use key::{BufferHandle, GenerationId, Id, ImageHandle, ResourceKey, SlotId};
pub use program::{
    BlitInfo, BlockRect, CachedBlitPush, CopyToVramPush, DITHER_LUT, HdTexturePush, MipmapPush,
    PrimitiveVertex, ResolvePush, ScanoutPush, UNTEXTURED,
};
pub use slots::SlotError;
pub use software::SoftwareGpu;
#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuDevice;

#[cfg(test)]
mod wgsl_tests;
