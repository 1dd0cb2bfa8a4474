//! Batching PS1 GPU renderer.
//!
//! `Renderer` turns emulated GPU primitives and VRAM transfers into explicit-barrier
//! commands on a [`GpuDevice`]. Hazards between the scaled and unscaled framebuffers are
//! tracked by an [`FbAtlas`]; the renderer is its listener.
//!
//! Internal architecture overview:
//! - `renderer_core`: listener callbacks, barriers, resolve and blit batching, render passes.
//! - `renderer_init`: image allocation, save-state restore and capture.
//! - `renderer_draw`: state setters, vertex building, primitive queues.
//! - `renderer_vram`: VRAM blits, CPU uploads and readbacks.
//! - `renderer_hd`: replacement texture upload, binding and release.
//! - `renderer_scanout`: display rect, scanout programs, adaptive-smoothing mipmaps.
//! - `queue`/`state`: queue layout and value types shared by the modules above.

use atlas::FbAtlas;
use gpu_runtime::{GpuDevice, GpuError};

mod queue;
mod renderer_core;
mod renderer_draw;
mod renderer_hd;
mod renderer_init;
mod renderer_scanout;
mod renderer_vram;
mod state;

pub use renderer_hd::HdTextureBinding;
pub use renderer_vram::UploadHandle;
pub use state::{
    Counters, DisplayMode, DisplayRect, RenderState, SaveState, ScanoutFilter, ScanoutMode,
    UvLimits, Vertex, WidthMode, compute_window_rect,
};

use renderer_core::RendererCore;

#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("save state holds {actual} VRAM words, expected {expected}")]
    InvalidSaveState { expected: usize, actual: usize },
    #[error("host buffer holds {actual} pixels, expected at least {expected}")]
    HostBufferTooSmall { expected: usize, actual: usize },
    #[error("upload buffer is not aligned to 16-bit pixels")]
    UnalignedUpload,
    #[error("replacement texture has no texels")]
    EmptyHdTexture,
}

/// Host copy of a scaled or scanned-out image, packed `0xAABBGGRR` per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl HostImage {
    /// Pixels as RGBA8 bytes, row-major.
    pub fn to_rgba8_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|pixel| pixel.to_le_bytes()).collect()
    }
}

pub struct Renderer<D: GpuDevice> {
    atlas: FbAtlas,
    core: RendererCore<D>,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn device(&self) -> &D {
        &self.core.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.core.device
    }

    /// Effective upscaling factor after clamping to the device limits.
    pub fn scaling(&self) -> u32 {
        self.core.scaling
    }

    pub fn render_state(&self) -> &RenderState {
        &self.core.state
    }

    pub fn counters(&self) -> Counters {
        self.core.counters
    }

    pub fn reset_counters(&mut self) {
        self.core.counters = Counters::default();
    }

    pub fn atlas(&self) -> &FbAtlas {
        &self.atlas
    }

    /// Closes the open render pass, flushes queued compute work, submits everything and
    /// waits.
    pub fn flush(&mut self) -> Result<(), RendererError> {
        self.atlas.flush_render_pass(&mut self.core);
        self.core.flush_blits();
        self.core.flush_resolves();
        self.core.submit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
