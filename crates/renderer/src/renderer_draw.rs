//! Primitive state setters and submission.
//!
//! Every primitive is expanded into `PrimitiveVertex` records with its depth token and
//! texture parameters, then queued by program. Nothing is drawn until the atlas flushes
//! the render pass.

use gpu_runtime::{PrimitiveVertex, UNTEXTURED};
use smallvec::SmallVec;
use vram_model::{
    FB_HEIGHT, FB_WIDTH, FbColor, Rect, SemiTransparentMode, TextureMode, TextureWindow,
};

use crate::queue::{PrimitiveQueue, SemiTransparentState};
use crate::state::{UvLimits, Vertex, bump, compute_window_rect};
use crate::{Renderer, RendererError};

/// Quad corners as two triangles.
const QUAD_TRIANGLES: [usize; 6] = [0, 1, 2, 3, 2, 1];

/// Neutral modulation color for unmodulated textures.
const TEXTURE_NEUTRAL: u32 = 0x80_8080;

impl<D: gpu_runtime::GpuDevice> Renderer<D> {
    pub fn set_draw_rect(&mut self, rect: Rect) {
        self.atlas.set_draw_rect(rect);
        self.core.state.draw_rect = rect;
        let scaled = rect.scaled(self.core.scaling);
        if self.core.queue.scissors.last() != Some(&scaled) {
            self.core.queue.scissors.push(scaled);
        }
    }

    pub fn set_draw_offset(&mut self, x: i32, y: i32) {
        self.core.state.draw_offset_x = x;
        self.core.state.draw_offset_y = y;
    }

    pub fn set_texture_window(&mut self, window: TextureWindow) {
        self.core.state.texture_window = window;
        self.core.state.cached_window_rect = compute_window_rect(window);
    }

    pub fn set_texture_offset(&mut self, x: u32, y: u32) {
        self.atlas.set_texture_offset(x, y);
        self.core.state.texture_offset_x = x;
        self.core.state.texture_offset_y = y;
    }

    pub fn set_palette_offset(&mut self, x: u32, y: u32) {
        self.atlas.set_palette_offset(x, y);
        self.core.state.palette_offset_x = x;
        self.core.state.palette_offset_y = y;
    }

    pub fn set_texture_mode(&mut self, mode: TextureMode) {
        self.atlas.set_texture_mode(mode);
        self.core.state.texture_mode = mode;
    }

    pub fn set_semi_transparent(&mut self, mode: SemiTransparentMode) {
        self.core.state.semi_transparent = mode;
    }

    pub fn set_mask_test(&mut self, enable: bool) {
        self.core.state.mask_test = enable;
    }

    pub fn set_force_mask_bit(&mut self, enable: bool) {
        self.core.state.force_mask_bit = enable;
    }

    pub fn set_dither(&mut self, enable: bool) {
        self.core.state.dither = enable;
    }

    pub fn set_texture_color_modulate(&mut self, enable: bool) {
        self.core.state.texture_color_modulate = enable;
    }

    pub fn set_uv_limits(&mut self, limits: UvLimits) {
        self.core.state.uv_limits = limits;
    }

    pub fn set_adaptive_smoothing(&mut self, enable: bool) {
        self.core.state.adaptive_smoothing = enable;
    }

    pub fn draw_triangle(&mut self, vertices: &[Vertex; 3]) -> Result<(), RendererError> {
        if self.core.state.draw_rect.is_empty() {
            return Ok(());
        }
        self.core.last_scanout = None;
        bump(&mut self.core.counters.native_draw_calls, 1);

        let attribs = self.build_attribs(vertices);
        let scissor = self.core.queue.current_scissor();
        self.queue_triangles(&attribs, scissor);
        self.core.commit()?;
        Ok(())
    }

    pub fn draw_quad(&mut self, vertices: &[Vertex; 4]) -> Result<(), RendererError> {
        if self.core.state.draw_rect.is_empty() {
            return Ok(());
        }
        self.core.last_scanout = None;
        bump(&mut self.core.counters.native_draw_calls, 1);

        let attribs = self.build_attribs(vertices);
        let scissor = self.core.queue.current_scissor();
        let triangles = QUAD_TRIANGLES.map(|index| attribs[index]);
        self.queue_triangles(&triangles, scissor);
        self.core.commit()?;
        Ok(())
    }

    pub fn draw_line(&mut self, vertices: &[Vertex; 2]) -> Result<(), RendererError> {
        self.draw_quad(&build_line_quad(vertices))
    }

    /// Fills `rect` with `color`, ignoring the draw area and mask state.
    pub fn clear_rect(&mut self, rect: Rect, color: FbColor) -> Result<(), RendererError> {
        let rect = rect.scissor(&Rect::FULL_VRAM);
        if rect.is_empty() {
            return Ok(());
        }
        self.core.last_scanout = None;
        self.atlas.clear_rect(rect, color, &mut self.core);
        self.core.commit()?;
        Ok(())
    }

    /// Texture footprint handed to the atlas for the primitive being built.
    fn sampled_texture_window(&self) -> Rect {
        let state = &self.core.state;
        let shift = state.texture_mode.shift();
        if state.texture_window.is_open() {
            let limits = state.uv_limits;
            if !limits.within_page() {
                return Rect::new(0, 0, 256 >> shift, 256);
            }
            let min_u = u32::from(limits.min_u) >> shift;
            let max_u = (u32::from(limits.max_u) + (1 << shift) - 1) >> shift;
            Rect::new(
                min_u,
                u32::from(limits.min_v),
                max_u - min_u + 1,
                u32::from(limits.max_v - limits.min_v) + 1,
            )
        } else {
            let window = state.cached_window_rect;
            Rect::new(
                window.x >> shift,
                window.y,
                (window.width >> shift).max(1),
                window.height,
            )
        }
    }

    /// Builds GPU vertices for one primitive and reserves its depth token, which also
    /// queues the primitive's bounding box into the render pass.
    fn build_attribs(&mut self, vertices: &[Vertex]) -> SmallVec<[PrimitiveVertex; 4]> {
        let textured = self.core.state.texture_mode != TextureMode::None;
        if textured {
            let window = self.sampled_texture_window();
            self.atlas.set_texture_window(window);
        }

        let state = &self.core.state;
        let offset_x = state.draw_offset_x as f32;
        let offset_y = state.draw_offset_y as f32;
        let (mut min_x, mut min_y) = (FB_WIDTH as f32, FB_HEIGHT as f32);
        let (mut max_x, mut max_y) = (0.0f32, 0.0f32);
        for vertex in vertices {
            let (x, y) = (vertex.x + offset_x, vertex.y + offset_y);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let min_x = min_x.max(0.0).floor() as u32;
        let min_y = min_y.max(0.0).floor() as u32;
        let max_x = max_x.min(FB_WIDTH as f32).ceil() as u32;
        let max_y = max_y.min(FB_HEIGHT as f32).ceil() as u32;
        let rect = Rect::new(
            min_x,
            min_y,
            max_x.saturating_sub(min_x),
            max_y.saturating_sub(min_y),
        );

        let z = self.allocate_depth(rect);

        let state = &self.core.state;
        let window = state.texture_window;
        let limits = state.uv_limits;
        let params = if textured {
            state.texture_mode.shift() as i16
        } else {
            UNTEXTURED
        };
        let mask = if state.force_mask_bit { 0xff00_0000 } else { 0 };
        vertices
            .iter()
            .map(|vertex| {
                let color = if textured && !state.texture_color_modulate {
                    TEXTURE_NEUTRAL
                } else {
                    vertex.color & 0xff_ffff
                };
                PrimitiveVertex {
                    x: vertex.x + offset_x,
                    y: vertex.y + offset_y,
                    z,
                    w: vertex.w,
                    color: color | mask,
                    window: [window.mask_x, window.mask_y, window.or_x, window.or_y],
                    pal_x: state.palette_offset_x as i16,
                    pal_y: state.palette_offset_y as i16,
                    params,
                    _pad: 0,
                    u: vertex.u as i16,
                    v: vertex.v as i16,
                    base_u: state.texture_offset_x as i16,
                    base_v: state.texture_offset_y as i16,
                    min_u: limits.min_u,
                    min_v: limits.min_v,
                    max_u: limits.max_u,
                    max_v: limits.max_v,
                }
            })
            .collect()
    }

    fn allocate_depth(&mut self, rect: Rect) -> f32 {
        self.atlas.write_fragment(rect, &mut self.core);
        self.core.next_depth()
    }

    /// Batchable queue for the current state, if any.
    fn select_queue(&mut self) -> Option<&mut PrimitiveQueue> {
        let state = &self.core.state;
        let textured = state.texture_mode != TextureMode::None;
        let semi = state.semi_transparent != SemiTransparentMode::None;
        let queue = &mut self.core.queue;
        if state.mask_test {
            None
        } else if textured && semi {
            Some(&mut queue.semi_transparent_opaque)
        } else if textured {
            Some(&mut queue.opaque_textured)
        } else if semi {
            None
        } else {
            Some(&mut queue.opaque)
        }
    }

    fn queue_triangles(&mut self, triangles: &[PrimitiveVertex], scissor: Option<u32>) {
        let textured = self.core.state.texture_mode != TextureMode::None;
        let hd = match self.core.hd_texture {
            Some(sampling) if textured => Some(self.core.queue.hd_index(sampling)),
            _ => None,
        };
        if let Some(queue) = self.select_queue() {
            queue.push_triangles(triangles, scissor, hd);
        }

        let state = &self.core.state;
        if state.mask_test || state.semi_transparent != SemiTransparentMode::None {
            let blend = SemiTransparentState {
                scissor,
                mode: state.semi_transparent,
                textured,
                masked: state.mask_test,
                hd,
            };
            let queue = &mut self.core.queue;
            queue.semi_transparent.extend_from_slice(triangles);
            queue
                .semi_transparent_state
                .extend(std::iter::repeat_n(blend, triangles.len() / 3));
        }
    }
}

/// Expands a line into a screen-space quad one pixel thick along its minor axis.
pub(crate) fn build_line_quad(line: &[Vertex; 2]) -> [Vertex; 4] {
    let [start, end] = *line;
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let corner = |x: f32, y: f32, color: u32| Vertex::new(x, y, color);

    if dx == 0.0 && dy == 0.0 {
        let color = start.color;
        return [
            corner(start.x, start.y, color),
            corner(start.x + 1.0, start.y, color),
            corner(end.x, end.y + 1.0, color),
            corner(end.x + 1.0, end.y + 1.0, color),
        ];
    }

    let (mut pad_x0, mut pad_y0, mut pad_x1, mut pad_y1) = (0.0, 0.0, 0.0, 0.0);
    let (fill_dx, fill_dy);
    if dx.abs() > dy.abs() {
        (fill_dx, fill_dy) = (0.0, 1.0);
        let dydk = dy / dx.abs();
        if dx > 0.0 {
            pad_x1 = 1.0;
            pad_y1 = dydk;
        } else {
            pad_x0 = 1.0;
            pad_y0 = -dydk;
        }
    } else {
        (fill_dx, fill_dy) = (1.0, 0.0);
        let dxdk = dx / dy.abs();
        if dy > 0.0 {
            pad_y1 = 1.0;
            pad_x1 = dxdk;
        } else {
            pad_y0 = 1.0;
            pad_x0 = -dxdk;
        }
    }

    let (x0, y0) = (start.x + pad_x0, start.y + pad_y0);
    let (x1, y1) = (end.x + pad_x1, end.y + pad_y1);
    [
        corner(x0, y0, start.color),
        corner(x0 + fill_dx, y0 + fill_dy, start.color),
        corner(x1, y1, end.color),
        corner(x1 + fill_dx, y1 + fill_dy, end.color),
    ]
}
