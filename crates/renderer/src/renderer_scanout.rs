//! Display timing, scanout and readback of displayable images.
//!
//! Scanout runs as a compute program writing into a reusable output image. The output
//! covers the visible screen derived from the display timing registers; the displayed
//! VRAM area is placed inside it and everything else is black.

use gpu_runtime::{
    Access, Barrier, Command, ComputeProgram, EnergyPass, GpuDevice, ImageDesc, ImageFormat,
    ImageHandle, MipmapPush, PipelineStages, ScanoutProgram, ScanoutPush,
};
use tracing::debug;
use vram_model::{BLOCK_HEIGHT, BLOCK_WIDTH, Domain, FB_WIDTH, Rect};

use crate::renderer_core::RendererCore;
use crate::state::{DisplayMode, DisplayRect, ScanoutFilter, ScanoutMode, bump};
use crate::{HostImage, Renderer, RendererError};

const BLANK_SCANOUT_SIZE: u32 = 64;
const OPAQUE_BLACK: u32 = 0xff00_0000;

impl<D: GpuDevice> Renderer<D> {
    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        if self.core.state.display_mode != mode {
            self.core.last_scanout = None;
        }
        self.core.state.display_mode = mode;
    }

    pub fn toggle_display(&mut self, enable: bool) {
        if self.core.state.display_on != enable {
            self.core.last_scanout = None;
        }
        self.core.state.display_on = enable;
    }

    pub fn set_display_filter(&mut self, filter: ScanoutFilter) {
        if self.core.state.display_filter != filter {
            self.core.last_scanout = None;
        }
        self.core.state.display_filter = filter;
    }

    pub fn set_horizontal_display_range(&mut self, start: i32, end: i32) {
        let state = &mut self.core.state;
        if (state.horiz_start, state.horiz_end) != (start, end) {
            state.horiz_start = start;
            state.horiz_end = end;
            self.core.last_scanout = None;
        }
    }

    pub fn set_vertical_display_range(&mut self, start: i32, end: i32) {
        let state = &mut self.core.state;
        if (state.vert_start, state.vert_end) != (start, end) {
            state.vert_start = start;
            state.vert_end = end;
            self.core.last_scanout = None;
        }
    }

    /// First and last visible scanline for NTSC and PAL.
    pub fn set_visible_scanlines(&mut self, start: i32, end: i32, start_pal: i32, end_pal: i32) {
        let state = &mut self.core.state;
        state.slstart = start;
        state.slend = end;
        state.slstart_pal = start_pal;
        state.slend_pal = end_pal;
        self.core.last_scanout = None;
    }

    pub fn set_horizontal_overscan_cropping(&mut self, crop: bool) {
        self.core.state.crop_overscan = crop;
        self.core.last_scanout = None;
    }

    pub fn set_horizontal_offset_cycles(&mut self, cycles: i32) {
        self.core.state.offset_cycles = cycles;
        self.core.last_scanout = None;
    }

    pub fn set_dither_native_resolution(&mut self, enable: bool) {
        self.core.state.dither_native_resolution = enable;
        self.core.last_scanout = None;
    }

    /// Visible screen area relative to the displayed VRAM origin, in native pixels.
    pub fn compute_display_rect(&self) -> DisplayRect {
        let state = &self.core.state;
        let divider = state.display_mode.width_mode.clock_divider();

        let (cycles, origin) = if state.crop_overscan {
            (2560, 608)
        } else {
            (2800, 488)
        };
        let width = (cycles / divider) as u32;
        let x = (state.horiz_start + state.offset_cycles - origin).div_euclid(divider);

        let (first, last, vertical_origin) = if state.display_mode.is_pal {
            (state.slstart_pal, state.slend_pal, 20)
        } else {
            (state.slstart, state.slend, 16)
        };
        let lines = if state.display_mode.is_480i { 2 } else { 1 };
        let height = (last - first + 1).max(1) as u32 * lines as u32;
        let y = (state.vert_start - vertical_origin - first) * lines;

        DisplayRect {
            x,
            y,
            width,
            height,
        }
    }

    /// Renders the displayed area into the scanout image and returns it.
    ///
    /// The handle stays valid until a later scanout needs an image of another size.
    pub fn scanout_to_texture(&mut self) -> Result<ImageHandle, RendererError> {
        self.atlas.flush_render_pass(&mut self.core);
        if let Some(image) = self.core.last_scanout {
            self.core.commit()?;
            return Ok(image);
        }

        let state = self.core.state.clone();
        let rect = state.display_mode.rect;
        let scaling = self.core.scaling;

        if rect.is_empty() || !state.display_on {
            self.atlas
                .read_fragment(Domain::Scaled, Rect::FULL_VRAM, &mut self.core);
            let image = self
                .core
                .ensure_scanout_image(BLANK_SCANOUT_SIZE, BLANK_SCANOUT_SIZE)?;
            self.core.record(Command::ClearImage {
                image,
                value: OPAQUE_BLACK,
            });
            self.core.last_scanout = Some(image);
            self.core.commit()?;
            return Ok(image);
        }

        let bpp24 = state.display_mode.scanout_mode == ScanoutMode::Bgr24;
        let ssaa = state.display_filter == ScanoutFilter::Ssaa && scaling != 1;
        if bpp24 || ssaa {
            let mut source = rect;
            if bpp24 {
                source.width = ((source.width * 3 + 1) / 2).min(FB_WIDTH - source.x);
            }
            self.atlas
                .read_fragment(Domain::Unscaled, source, &mut self.core);
        } else {
            self.atlas
                .read_fragment(Domain::Scaled, rect, &mut self.core);
        }

        let adaptive = state.adaptive_smoothing && !bpp24 && !ssaa && scaling != 1;
        if adaptive {
            self.core.mipmap_framebuffer();
        }

        let scaled = !bpp24 && !ssaa;
        let render_scale = if scaled { scaling } else { 1 };
        let display = self.compute_display_rect();
        let width = display.width * render_scale;
        let height = display.height * render_scale;
        let image = self.core.ensure_scanout_image(width, height)?;

        let dither = state.display_mode.scanout_mode == ScanoutMode::Abgr1555Dither;
        let dither_shift = if state.dither_native_resolution && scaled {
            scaling.ilog2()
        } else {
            0
        };
        let core = &self.core;
        let (program, images) = if bpp24 {
            (
                ScanoutProgram::Bpp24 {
                    yuv: state.display_filter == ScanoutFilter::MdecYuv,
                },
                vec![image, core.unscaled],
            )
        } else if ssaa {
            (ScanoutProgram::Unscaled { dither }, vec![image, core.unscaled])
        } else if !state.adaptive_smoothing || scaling == 1 {
            (ScanoutProgram::Scaled { dither }, vec![image, core.scaled])
        } else {
            (
                ScanoutProgram::Adaptive { dither },
                vec![image, core.scaled, core.bias],
            )
        };

        let push = ScanoutPush::new(
            rect,
            [
                display.x * render_scale as i32,
                display.y * render_scale as i32,
            ],
            [rect.width * render_scale, rect.height * render_scale],
            render_scale,
            dither_shift,
        );
        debug!(
            "[renderer] scanout {:?} via {:?} into {}x{}",
            rect, program, width, height
        );
        self.core.dispatch(
            ComputeProgram::Scanout(program),
            &images,
            None,
            &push,
            Vec::new(),
            [
                width.div_ceil(BLOCK_WIDTH),
                height.div_ceil(BLOCK_HEIGHT),
                1,
            ],
        );
        bump(&mut self.core.counters.draw_calls, 1);
        bump(&mut self.core.counters.vertices, 4);
        self.core.barrier(Barrier {
            src_stages: PipelineStages::COMPUTE,
            src_access: Access::SHADER_WRITE,
            dst_stages: PipelineStages::COMPUTE
                | PipelineStages::TRANSFER
                | PipelineStages::FRAGMENT_SHADER,
            dst_access: Access::SHADER_READ | Access::TRANSFER_READ,
        });

        self.core.last_scanout = Some(image);
        self.core.commit()?;
        Ok(image)
    }

    /// Scans out and reads the result back to the host.
    pub fn scanout(&mut self) -> Result<HostImage, RendererError> {
        let image = self.scanout_to_texture()?;
        let desc = self.core.device.image_desc(image)?;
        let pixels = self.read_image(image, 0, Rect::new(0, 0, desc.width, desc.height))?;
        Ok(HostImage {
            width: desc.width,
            height: desc.height,
            pixels,
        })
    }

    /// The whole scaled framebuffer.
    pub fn scanout_vram_to_buffer(&mut self) -> Result<HostImage, RendererError> {
        self.atlas.flush_render_pass(&mut self.core);
        self.atlas
            .read_transfer(Domain::Scaled, Rect::FULL_VRAM, &mut self.core);
        self.read_scaled(Rect::FULL_VRAM)
    }

    /// The scaled draw area or displayed area. `None` when it is empty or the display is
    /// off.
    pub fn scanout_to_buffer(&mut self, draw_area: bool) -> Result<Option<HostImage>, RendererError> {
        let state = &self.core.state;
        let rect = if draw_area {
            state.draw_rect
        } else {
            state.display_mode.rect
        };
        if rect.is_empty() || !state.display_on {
            return Ok(None);
        }
        self.atlas.flush_render_pass(&mut self.core);
        self.atlas
            .read_transfer(Domain::Scaled, rect, &mut self.core);
        self.read_scaled(rect).map(Some)
    }

    fn read_scaled(&mut self, rect: Rect) -> Result<HostImage, RendererError> {
        let region = rect.scaled(self.core.scaling);
        let pixels = self.read_image(self.core.scaled, 0, region)?;
        Ok(HostImage {
            width: region.width,
            height: region.height,
            pixels,
        })
    }
}

impl<D: GpuDevice> RendererCore<D> {
    /// Reuses the scanout image when the size matches, otherwise replaces it.
    fn ensure_scanout_image(&mut self, width: u32, height: u32) -> Result<ImageHandle, RendererError> {
        if let Some(image) = self.scanout {
            let desc = self.device.image_desc(image)?;
            if (desc.width, desc.height) == (width, height) {
                return Ok(image);
            }
            // Pending commands may still reference the old image.
            self.commit()?;
            self.device.submit()?;
            self.device.release_image(image)?;
            self.scanout = None;
        }
        let image = self
            .device
            .create_image(ImageDesc::new(width, height, ImageFormat::Rgba8))?;
        self.scanout = Some(image);
        Ok(image)
    }

    /// Energy mip chain over the displayed area, then the blurred bias image.
    pub(crate) fn mipmap_framebuffer(&mut self) {
        let rect = self.state.display_mode.rect;
        if rect.is_empty() || self.scaled_levels < 2 {
            return;
        }
        let scale = self.scaling;
        let last_level = self.scaled_levels - 1;
        for level in 1..=last_level {
            let pass = if level == 1 {
                EnergyPass::First
            } else {
                EnergyPass::Middle
            };
            let width = ((rect.right() * scale).div_ceil(1 << level)) - ((rect.x * scale) >> level);
            let height =
                ((rect.bottom() * scale).div_ceil(1 << level)) - ((rect.y * scale) >> level);
            self.dispatch(
                ComputeProgram::Mipmap(pass),
                &[self.scaled],
                None,
                &MipmapPush::new(rect, scale, level),
                Vec::new(),
                [width.div_ceil(BLOCK_WIDTH), height.div_ceil(BLOCK_HEIGHT), 1],
            );
            self.compute_barrier();
            bump(&mut self.counters.draw_calls, 1);
            bump(&mut self.counters.vertices, 4);
        }
        self.dispatch(
            ComputeProgram::Mipmap(EnergyPass::Blur),
            &[self.bias, self.scaled],
            None,
            &MipmapPush::new(rect, scale, last_level),
            Vec::new(),
            [
                rect.width.div_ceil(BLOCK_WIDTH),
                rect.height.div_ceil(BLOCK_HEIGHT),
                1,
            ],
        );
        self.compute_barrier();
        bump(&mut self.counters.draw_calls, 1);
        bump(&mut self.counters.vertices, 4);
    }
}
