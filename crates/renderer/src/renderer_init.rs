//! Renderer construction, save-state restore and capture.

use atlas::FbAtlas;
use gpu_runtime::{BufferUsage, Command, GpuDevice, ImageDesc, ImageFormat};
use tracing::{debug, info};
use vram_model::{Domain, FB_HEIGHT, FB_WIDTH, Rect, VRAM_PIXELS};

use crate::queue::RenderQueue;
use crate::renderer_core::RendererCore;
use crate::state::{Counters, RenderState, SaveState};
use crate::{Renderer, RendererError};

const VRAM_BYTES: u64 = VRAM_PIXELS as u64 * 4;

/// Largest power-of-two factor at most `requested` whose scaled framebuffer fits
/// `max_dimension`.
pub(crate) fn effective_scaling(requested: u32, max_dimension: u32) -> u32 {
    let mut scaling = 1u32 << requested.max(1).ilog2();
    while scaling > 1 && FB_WIDTH * scaling > max_dimension {
        scaling >>= 1;
    }
    scaling
}

impl<D: GpuDevice> Renderer<D> {
    /// Allocates the framebuffers on `device`. `save_state` restores VRAM and every render
    /// state field.
    pub fn new(
        mut device: D,
        scaling: u32,
        save_state: Option<&SaveState>,
    ) -> Result<Self, RendererError> {
        if let Some(save_state) = save_state
            && save_state.vram.len() != VRAM_PIXELS
        {
            return Err(RendererError::InvalidSaveState {
                expected: VRAM_PIXELS,
                actual: save_state.vram.len(),
            });
        }

        let limits = device.limits();
        let effective = effective_scaling(scaling, limits.max_image_dimension_2d);
        if effective != scaling {
            info!(
                "[renderer] internal resolution {}x is not supported, using {}x",
                scaling, effective
            );
        }
        let scaled_levels = effective.trailing_zeros() + 1;

        let unscaled = device.create_image(ImageDesc::new(FB_WIDTH, FB_HEIGHT, ImageFormat::R32Uint))?;
        let bias = device.create_image(ImageDesc::new(FB_WIDTH, FB_HEIGHT, ImageFormat::R8))?;
        let scaled = device.create_image(
            ImageDesc::new(FB_WIDTH * effective, FB_HEIGHT * effective, ImageFormat::Rgba8)
                .with_levels(scaled_levels),
        )?;

        let mut renderer = Self {
            atlas: FbAtlas::new(),
            core: RendererCore {
                device,
                scaling: effective,
                scaled_levels,
                scaled,
                unscaled,
                bias,
                scanout: None,
                last_scanout: None,
                state: RenderState::default(),
                queue: RenderQueue::default(),
                counters: Counters::default(),
                primitive_index: 0,
                commands: Vec::new(),
                retired_buffers: Vec::new(),
                hd_texture: None,
                retired_images: Vec::new(),
            },
        };

        for image in [scaled, unscaled, bias] {
            renderer.core.record(Command::ClearImage { image, value: 0 });
        }
        if let Some(save_state) = save_state {
            renderer.restore(save_state)?;
        }
        renderer.core.reset_scissor_queue();
        renderer.flush()?;
        debug!(
            "[renderer] created {}x{} scaled framebuffer with {} levels",
            FB_WIDTH * effective,
            FB_HEIGHT * effective,
            scaled_levels
        );
        Ok(renderer)
    }

    fn restore(&mut self, save_state: &SaveState) -> Result<(), RendererError> {
        let state = save_state.state.clone();
        self.atlas
            .set_texture_offset(state.texture_offset_x, state.texture_offset_y);
        self.atlas.set_texture_mode(state.texture_mode);
        self.atlas.set_draw_rect(state.draw_rect);
        self.atlas
            .set_palette_offset(state.palette_offset_x, state.palette_offset_y);
        self.atlas.set_texture_window(state.cached_window_rect);
        self.core.state = state;

        self.atlas
            .write_transfer(Domain::Unscaled, Rect::FULL_VRAM, &mut self.core);

        let buffer = self.core.device.create_buffer(VRAM_BYTES, BufferUsage::Upload)?;
        let mapped = self.core.device.map_buffer(buffer)?;
        for (bytes, word) in mapped.chunks_exact_mut(4).zip(&save_state.vram) {
            bytes.copy_from_slice(&word.to_le_bytes());
        }
        self.core.device.unmap_buffer(buffer)?;
        self.core.record(Command::CopyBufferToImage {
            buffer,
            image: self.core.unscaled,
            level: 0,
            region: Rect::FULL_VRAM,
        });
        self.core.retired_buffers.push(buffer);
        Ok(())
    }

    /// Snapshot of unscaled VRAM (resolved from the scaled domain where needed) and the
    /// full render state.
    pub fn save_vram_state(&mut self) -> Result<SaveState, RendererError> {
        self.atlas.flush_render_pass(&mut self.core);
        let vram = self.read_unscaled(Rect::FULL_VRAM)?;
        Ok(SaveState {
            vram,
            state: self.core.state.clone(),
        })
    }
}
