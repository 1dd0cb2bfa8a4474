//! The renderer and texture tracker driven as one unit.

use std::sync::Arc;

use gpu_runtime::{GpuDevice, ImageHandle};
use renderer::{
    HdTextureBinding, RenderState, Renderer, RendererError, SaveState, UvLimits, Vertex,
};
use serde::{Deserialize, Serialize};
use texture_tracker::{HdImage, TextureTracker, TrackerError, TrackerSaveState, UsedMode};
use tracing::{debug, info, trace};
use vram_model::{FB_WIDTH, FbColor, Rect, TextureMode, VRAM_PIXELS};

use crate::config::{ConfigError, DitherMode, GpuConfig};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Renderer(#[from] RendererError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSaveState {
    pub renderer: SaveState,
    pub tracker: Option<TrackerSaveState>,
}

/// Owns everything one emulated GPU needs. Every VRAM mutation goes through here so the
/// tracker sees the same writes as the renderer.
pub struct Session<D: GpuDevice> {
    config: GpuConfig,
    renderer: Renderer<D>,
    tracker: Option<TextureTracker>,
    /// Replacements uploaded to the device, keyed by the tracker's image.
    hd_images: Vec<(Arc<HdImage>, ImageHandle)>,
    frame: u64,
}

/// VRAM words a primitive with these vertices samples, clamped to its texture page.
pub(crate) fn sampled_rect(state: &RenderState, vertices: &[Vertex]) -> Option<Rect> {
    let first = vertices.first()?;
    let (mut min_u, mut max_u, mut min_v, mut max_v) = (first.u, first.u, first.v, first.v);
    for vertex in vertices {
        min_u = min_u.min(vertex.u);
        max_u = max_u.max(vertex.u);
        min_v = min_v.min(vertex.v);
        max_v = max_v.max(vertex.v);
    }
    let clamp = |value: u16| u32::from(value.min(255));
    let shift = state.texture_mode.shift();
    let left = state.texture_offset_x + (clamp(min_u) >> shift);
    let right = state.texture_offset_x + (clamp(max_u) >> shift) + 1;
    let top = state.texture_offset_y + clamp(min_v);
    let bottom = state.texture_offset_y + clamp(max_v) + 1;
    let rect = Rect::new(left, top, right - left, bottom - top).scissor(&Rect::FULL_VRAM);
    (!rect.is_empty()).then_some(rect)
}

impl<D: GpuDevice> Session<D> {
    pub fn new(device: D, config: GpuConfig) -> Result<Self, SessionError> {
        Self::build(device, config, None)
    }

    /// Rebuilds a session from `save_state`. The tracker state is only restored when the
    /// config enables tracking.
    pub fn restore(
        device: D,
        config: GpuConfig,
        save_state: &SessionSaveState,
    ) -> Result<Self, SessionError> {
        let mut session = Self::build(device, config, Some(&save_state.renderer))?;
        if let (Some(tracker), Some(state)) = (session.tracker.as_mut(), &save_state.tracker) {
            tracker.load_state(state)?;
        }
        Ok(session)
    }

    fn build(
        device: D,
        config: GpuConfig,
        save_state: Option<&SaveState>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let mut renderer = Renderer::new(device, config.internal_resolution, save_state)?;
        config.apply(&mut renderer);
        let tracker = if config.texture_tracking_enabled() {
            Some(TextureTracker::new(config.texture_replacement.clone())?)
        } else {
            None
        };
        info!(
            "[session] {}x internal resolution, texture tracking {}",
            renderer.scaling(),
            if tracker.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            renderer,
            tracker,
            hd_images: Vec::new(),
            frame: 0,
        })
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Renderer<D> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer<D> {
        &mut self.renderer
    }

    pub fn tracker(&self) -> Option<&TextureTracker> {
        self.tracker.as_ref()
    }

    pub fn tracker_mut(&mut self) -> Option<&mut TextureTracker> {
        self.tracker.as_mut()
    }

    /// Frames finished with `end_frame`.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Primitive dither bit, ignored when dithering is disabled in the config.
    pub fn set_dither(&mut self, enable: bool) {
        self.renderer
            .set_dither(enable && self.config.dither_mode != DitherMode::Disabled);
    }

    pub fn draw_triangle(&mut self, vertices: &[Vertex; 3]) -> Result<(), SessionError> {
        self.prepare_primitive(vertices, false)?;
        self.renderer.draw_triangle(vertices)?;
        Ok(())
    }

    pub fn draw_quad(&mut self, vertices: &[Vertex; 4]) -> Result<(), SessionError> {
        self.prepare_primitive(vertices, true)?;
        self.renderer.draw_quad(vertices)?;
        Ok(())
    }

    pub fn draw_line(&mut self, vertices: &[Vertex; 2]) -> Result<(), SessionError> {
        self.renderer.set_uv_limits(UvLimits::UNBOUNDED);
        self.renderer.set_hd_texture(None)?;
        self.renderer.draw_line(vertices)?;
        Ok(())
    }

    fn prepare_primitive(&mut self, vertices: &[Vertex], quad: bool) -> Result<(), SessionError> {
        let state = self.renderer.render_state();
        if state.texture_mode == TextureMode::None {
            self.renderer.set_uv_limits(UvLimits::UNBOUNDED);
            self.renderer.set_hd_texture(None)?;
            return Ok(());
        }
        let limits = UvLimits::for_primitive(state.texture_window, vertices, quad);
        let binding = self.note_texture_use(vertices)?;
        self.renderer.set_hd_texture(binding)?;
        self.renderer.set_uv_limits(limits);
        Ok(())
    }

    /// Lets the tracker dump what the primitive samples and finds the replacement it
    /// samples instead, uploading the replacement on first use.
    fn note_texture_use(&mut self, vertices: &[Vertex]) -> Result<Option<HdTextureBinding>, SessionError> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(None);
        };
        let state = self.renderer.render_state();
        let Some(rect) = sampled_rect(state, vertices) else {
            return Ok(None);
        };
        let mode = UsedMode {
            mode: state.texture_mode,
            palette_offset_x: state.palette_offset_x,
            palette_offset_y: state.palette_offset_y,
        };
        let lookup = tracker.get_hd_texture_index(
            rect,
            mode,
            state.texture_offset_x,
            state.texture_offset_y,
        )?;
        if lookup.handle.is_none() || !tracker.replacement_enabled() {
            return Ok(None);
        }
        let Some(texture) = tracker.resolve_hd_texture(lookup.handle) else {
            return Ok(None);
        };

        let known = self
            .hd_images
            .iter()
            .find(|(image, _)| Arc::ptr_eq(image, &texture.image))
            .map(|&(_, handle)| handle);
        let image = match known {
            Some(handle) => handle,
            None => {
                let levels: Vec<Vec<u32>> = texture
                    .image
                    .levels
                    .iter()
                    .map(|level| level.pixels().map(|pixel| u32::from_le_bytes(pixel.0)).collect())
                    .collect();
                let handle = self.renderer.upload_hd_texture(
                    texture.image.width(),
                    texture.image.height(),
                    &levels,
                )?;
                self.hd_images.push((texture.image.clone(), handle));
                handle
            }
        };
        trace!(
            "[session] {:?} samples replacement {:?} for {:?}",
            rect, image, texture.vram_rect
        );
        Ok(Some(HdTextureBinding {
            image,
            vram_rect: texture.vram_rect,
            texel_rect: texture.texel_rect,
        }))
    }

    /// Releases uploaded replacements the tracker no longer holds.
    fn release_stale_replacements(&mut self) -> Result<(), SessionError> {
        self.renderer.set_hd_texture(None)?;
        let renderer = &mut self.renderer;
        self.hd_images.retain(|(image, handle)| {
            let live = Arc::strong_count(image) > 1;
            if !live {
                renderer.release_hd_texture(*handle);
            }
            live
        });
        Ok(())
    }

    /// CPU to VRAM transfer of row-major `pixels` into `rect`.
    pub fn upload_vram(&mut self, rect: Rect, pixels: &[u16]) -> Result<(), SessionError> {
        self.renderer.upload_vram(rect, pixels)?;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.upload(rect, pixels)?;
        }
        Ok(())
    }

    pub fn blit_vram(&mut self, dst: Rect, src: Rect) -> Result<(), SessionError> {
        self.renderer.blit_vram(dst, src)?;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.blit(dst, src);
        }
        Ok(())
    }

    pub fn fill_rect(&mut self, rect: Rect, color: FbColor) -> Result<(), SessionError> {
        self.renderer.clear_rect(rect, color)?;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.clear_region(rect.scissor(&Rect::FULL_VRAM));
        }
        Ok(())
    }

    /// VRAM to CPU transfer of `rect` into `vram`, a full 1024x512 host copy.
    pub fn read_vram(&mut self, rect: Rect, vram: &mut [u16]) -> Result<(), SessionError> {
        self.renderer.copy_vram_to_cpu_synchronous(rect, vram)?;
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(());
        };
        if rect.is_empty() || rect.wraps_vram() || vram.len() < VRAM_PIXELS {
            return Ok(());
        }
        let pixels: Vec<u16> = (rect.y..rect.bottom())
            .flat_map(|y| {
                let start = (y * FB_WIDTH + rect.x) as usize;
                vram[start..start + rect.width as usize].iter().copied()
            })
            .collect();
        tracker.notify_readback(rect, &pixels)?;
        Ok(())
    }

    pub fn prepare_frame(&mut self) {
        self.renderer.reset_counters();
    }

    /// Submits the frame and lets the tracker install finished loads.
    pub fn end_frame(&mut self) -> Result<(), SessionError> {
        self.renderer.flush()?;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.end_frame();
            tracker.on_queues_reset()?;
        }
        self.release_stale_replacements()?;
        self.frame = self.frame.checked_add(1).expect("frame counter overflow");
        let counters = self.renderer.counters();
        debug!(
            "[session] frame {}: {} render passes, {} draw calls ({} replaced), {} vertices",
            self.frame,
            counters.render_passes,
            counters.draw_calls,
            counters.hd_draw_calls,
            counters.vertices
        );
        Ok(())
    }

    pub fn save_state(&mut self) -> Result<SessionSaveState, SessionError> {
        Ok(SessionSaveState {
            renderer: self.renderer.save_vram_state()?,
            tracker: self.tracker.as_ref().map(TextureTracker::save_state),
        })
    }
}
