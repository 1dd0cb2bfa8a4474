//! VRAM to VRAM blits, CPU uploads and synchronous readbacks.

use gpu_runtime::{
    BlitInfo, BufferHandle, BufferUsage, CachedBlitPush, Command, ComputeProgram, CopyToVramPush,
    GpuDevice, ImageHandle,
};
use tracing::trace;
use vram_model::{BLOCK_HEIGHT, BLOCK_WIDTH, Domain, FB_WIDTH, Rect, VRAM_PIXELS};

use crate::{Renderer, RendererError};

/// Mask bit of a VRAM word.
const MASK_BIT: u32 = 0x8000;

/// Pending CPU upload. Fill it between `begin_copy` and `end_copy`, before the next
/// `flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadHandle {
    buffer: BufferHandle,
    pixels: usize,
}

impl UploadHandle {
    /// Number of 16-bit pixels the upload expects, row-major.
    pub const fn pixels(&self) -> usize {
        self.pixels
    }
}

impl<D: GpuDevice> Renderer<D> {
    fn mask_or(&self) -> u32 {
        if self.core.state.force_mask_bit {
            MASK_BIT
        } else {
            0
        }
    }

    /// Copies `src` to `dst` inside VRAM, honoring mask test and forced mask bit.
    pub fn blit_vram(&mut self, dst: Rect, src: Rect) -> Result<(), RendererError> {
        debug_assert_eq!(dst.width, src.width, "blit width mismatch");
        debug_assert_eq!(dst.height, src.height, "blit height mismatch");
        if dst == src || dst.is_empty() || src.is_empty() {
            return Ok(());
        }
        self.core.last_scanout = None;

        let domain = self.atlas.blit_vram(dst, src, &mut self.core);
        let scaled = domain == Domain::Scaled;
        let masked = self.core.state.mask_test;
        let mask_or = self.mask_or();
        let (target, factor) = if scaled {
            (self.core.scaled, self.core.scaling)
        } else {
            (self.core.unscaled, 1)
        };

        if dst.intersects(&src) {
            // Overlapping copies run serialized, one line at a time.
            trace!("[renderer] overlapping blit {:?} -> {:?}", src, dst);
            let push = CachedBlitPush {
                src_offset: [src.x, src.y],
                dst_offset: [dst.x, dst.y],
                extent: [dst.width, dst.height],
                scale: factor,
                mask_or,
            };
            self.core.dispatch(
                ComputeProgram::BlitVramCached { scaled, masked },
                &[target],
                None,
                &push,
                Vec::new(),
                [1, 1, 1],
            );
        } else {
            let queue = &mut self.core.queue;
            let blits = match (scaled, masked) {
                (true, false) => &mut queue.scaled_blits,
                (true, true) => &mut queue.scaled_masked_blits,
                (false, false) => &mut queue.unscaled_blits,
                (false, true) => &mut queue.unscaled_masked_blits,
            };
            for y in (0..dst.height).step_by(BLOCK_HEIGHT as usize) {
                for x in (0..dst.width).step_by(BLOCK_WIDTH as usize) {
                    let width = BLOCK_WIDTH.min(dst.width - x);
                    let height = BLOCK_HEIGHT.min(dst.height - y);
                    blits.push(BlitInfo::new(
                        [(src.x + x) * factor, (src.y + y) * factor],
                        [(dst.x + x) * factor, (dst.y + y) * factor],
                        [width * factor, height * factor],
                        mask_or,
                    ));
                }
            }
        }
        self.core.commit()?;
        Ok(())
    }

    /// Starts a CPU upload into unscaled VRAM. Returns `None` for an empty rect.
    pub fn copy_cpu_to_vram(&mut self, rect: Rect) -> Result<Option<UploadHandle>, RendererError> {
        if rect.is_empty() {
            return Ok(None);
        }
        self.core.last_scanout = None;
        self.atlas.load_image(rect, &mut self.core);

        let pixels = rect.area() as usize;
        let buffer = self
            .core
            .device
            .create_buffer(rect.area() * 2, BufferUsage::Upload)?;
        let masked = self.core.state.mask_test;
        let mask_or = self.mask_or();

        let limit = u64::from(self.core.device.limits().max_texel_buffer_elements);
        let strips: Vec<Rect> = if rect.area() > limit {
            (0..rect.height)
                .step_by(BLOCK_HEIGHT as usize)
                .map(|y| {
                    Rect::new(
                        rect.x,
                        rect.y + y,
                        rect.width,
                        BLOCK_HEIGHT.min(rect.height - y),
                    )
                })
                .collect()
        } else {
            vec![rect]
        };
        trace!(
            "[renderer] upload {:?} in {} dispatches",
            rect,
            strips.len()
        );
        for strip in strips {
            let offset = (strip.y - rect.y) * rect.width;
            self.core.dispatch(
                ComputeProgram::CopyToVram { masked },
                &[self.core.unscaled],
                Some(buffer),
                &CopyToVramPush::new(strip, offset, mask_or),
                Vec::new(),
                [
                    strip.width.div_ceil(BLOCK_WIDTH),
                    strip.height.div_ceil(BLOCK_HEIGHT),
                    1,
                ],
            );
        }
        self.core.retired_buffers.push(buffer);
        self.core.commit()?;
        Ok(Some(UploadHandle { buffer, pixels }))
    }

    /// Host view of the upload's pixels.
    pub fn begin_copy(&mut self, handle: UploadHandle) -> Result<&mut [u16], RendererError> {
        let bytes = self.core.device.map_buffer(handle.buffer)?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|_| RendererError::UnalignedUpload)
    }

    pub fn end_copy(&mut self, handle: UploadHandle) -> Result<(), RendererError> {
        self.core.device.unmap_buffer(handle.buffer)?;
        Ok(())
    }

    /// Uploads `pixels` (row-major ABGR1555) into `rect`.
    pub fn upload_vram(&mut self, rect: Rect, pixels: &[u16]) -> Result<(), RendererError> {
        let expected = rect.area() as usize;
        if pixels.len() < expected {
            return Err(RendererError::HostBufferTooSmall {
                expected,
                actual: pixels.len(),
            });
        }
        let Some(handle) = self.copy_cpu_to_vram(rect)? else {
            return Ok(());
        };
        let target = self.begin_copy(handle)?;
        target.copy_from_slice(&pixels[..expected]);
        self.end_copy(handle)
    }

    /// Reads `rect` of unscaled VRAM into `vram`, a full 1024x512 host copy.
    ///
    /// Rects that wrap around VRAM are read piecewise at their wrapped positions.
    pub fn copy_vram_to_cpu_synchronous(
        &mut self,
        rect: Rect,
        vram: &mut [u16],
    ) -> Result<(), RendererError> {
        if rect.is_empty() {
            return Ok(());
        }
        if vram.len() < VRAM_PIXELS {
            return Err(RendererError::HostBufferTooSmall {
                expected: VRAM_PIXELS,
                actual: vram.len(),
            });
        }

        for piece in rect.split_at_vram_edges() {
            let words = self.read_unscaled(piece)?;
            for (row, line) in words.chunks_exact(piece.width as usize).enumerate() {
                let base = ((piece.y as usize + row) * FB_WIDTH as usize) + piece.x as usize;
                for (pixel, word) in vram[base..base + line.len()].iter_mut().zip(line) {
                    *pixel = *word as u16;
                }
            }
        }
        Ok(())
    }

    /// Synchronous readback of an unscaled rect as VRAM words, row-major.
    pub(crate) fn read_unscaled(&mut self, rect: Rect) -> Result<Vec<u32>, RendererError> {
        self.atlas
            .read_transfer(Domain::Unscaled, rect, &mut self.core);
        self.read_image(self.core.unscaled, 0, rect)
    }

    /// Copies `region` of `image` to the host. Submits and waits.
    pub(crate) fn read_image(
        &mut self,
        image: ImageHandle,
        level: u32,
        region: Rect,
    ) -> Result<Vec<u32>, RendererError> {
        let buffer = self
            .core
            .device
            .create_buffer(region.area() * 4, BufferUsage::Readback)?;
        self.core.record(Command::CopyImageToBuffer {
            image,
            level,
            region,
            buffer,
        });
        self.flush()?;
        let bytes = self.core.device.read_buffer(buffer)?;
        self.core.device.release_buffer(buffer)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    }
}
