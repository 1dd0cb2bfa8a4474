//! Headless device. Executes every non-raster command exactly on host memory;
//! draws are validated and counted but not rasterized.

mod compute;
mod scanout;

use tracing::trace;

use crate::command::{
    BufferUsage, Command, DeviceLimits, DeviceStats, GpuDevice, ImageDesc, LoadOp,
};
use crate::error::GpuError;
use crate::key::{BufferHandle, ImageHandle};
use crate::slots::HandleTable;
use crate::validate::{validate, ResourceLookup};

const MAX_RESOURCES: u32 = 1 << 16;

pub(crate) struct SoftwareImage {
    pub(crate) desc: ImageDesc,
    /// Every level back to back, one `u32` per texel.
    pub(crate) texels: Vec<u32>,
}

impl SoftwareImage {
    pub(crate) fn level(&self, level: u32) -> &[u32] {
        let offset = self.desc.level_offset(level);
        &self.texels[offset..offset + self.desc.level_texels(level)]
    }
}

struct SoftwareBuffer {
    usage: BufferUsage,
    size: usize,
    words: Vec<u32>,
    mapped: bool,
}

pub struct SoftwareGpu {
    limits: DeviceLimits,
    images: HandleTable<SoftwareImage>,
    buffers: HandleTable<SoftwareBuffer>,
    pending: Vec<Command>,
    pass_open: bool,
    stats: DeviceStats,
}

impl Default for SoftwareGpu {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

impl SoftwareGpu {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            limits,
            images: HandleTable::new(MAX_RESOURCES),
            buffers: HandleTable::new(MAX_RESOURCES),
            pending: Vec::new(),
            pass_open: false,
            stats: DeviceStats::default(),
        }
    }

    /// Texels of one level as of the last `submit`.
    pub fn image_level(&self, image: ImageHandle, level: u32) -> Result<&[u32], GpuError> {
        let image = self.image(image)?;
        if level >= image.desc.levels {
            return Err(GpuError::OutOfBounds { what: "image level" });
        }
        Ok(image.level(level))
    }

    pub fn live_images(&self) -> u32 {
        self.images.len()
    }

    pub fn live_buffers(&self) -> u32 {
        self.buffers.len()
    }

    fn image(&self, image: ImageHandle) -> Result<&SoftwareImage, GpuError> {
        self.images.get(image.key()).map_err(GpuError::stale_image)
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&SoftwareBuffer, GpuError> {
        self.buffers.get(buffer.key()).map_err(GpuError::stale_buffer)
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> Result<&mut SoftwareBuffer, GpuError> {
        self.buffers.get_mut(buffer.key()).map_err(GpuError::stale_buffer)
    }

    fn execute(&mut self, command: Command) -> Result<(), GpuError> {
        match command {
            Command::Barrier(_) => self.stats.barriers += 1,
            Command::ClearImage { image, value } => {
                let image = self
                    .images
                    .get_mut(image.key())
                    .map_err(GpuError::stale_image)?;
                image.texels.fill(value);
            }
            Command::Dispatch(dispatch) => {
                self.stats.dispatches += 1;
                let upload = match dispatch.buffer {
                    Some(buffer) => Some(self.buffer(buffer)?.words.clone()),
                    None => None,
                };
                compute::execute(&mut self.images, &dispatch, upload.as_deref())?;
            }
            Command::CopyImageToBuffer {
                image,
                level,
                region,
                buffer,
            } => {
                let image = self.image(image)?;
                let (width, _) = image.desc.level_extent(level);
                let texels = image.level(level);
                let mut copied = Vec::with_capacity(region.area() as usize);
                for y in region.y..region.bottom() {
                    let row = (y * width) as usize;
                    copied.extend_from_slice(&texels[row + region.x as usize..row + region.right() as usize]);
                }
                let buffer = self.buffer_mut(buffer)?;
                buffer.words[..copied.len()].copy_from_slice(&copied);
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                level,
                region,
            } => {
                let words = self.buffer(buffer)?.words.clone();
                let image = self
                    .images
                    .get_mut(image.key())
                    .map_err(GpuError::stale_image)?;
                let (width, _) = image.desc.level_extent(level);
                let offset = image.desc.level_offset(level);
                for (row_index, y) in (region.y..region.bottom()).enumerate() {
                    let dst = offset + (y * width + region.x) as usize;
                    let src = row_index * region.width as usize;
                    image.texels[dst..dst + region.width as usize]
                        .copy_from_slice(&words[src..src + region.width as usize]);
                }
            }
            Command::BeginRenderPass(desc) => {
                self.stats.render_passes += 1;
                if let LoadOp::Clear { color, .. } = desc.load {
                    let image = self
                        .images
                        .get_mut(desc.target.key())
                        .map_err(GpuError::stale_image)?;
                    let (width, height) = image.desc.level_extent(0);
                    let area = desc.area.scissor(&vram_model::Rect::new(0, 0, width, height));
                    let value = pack_rgba32f(color);
                    for y in area.y..area.bottom() {
                        let row = (y * width) as usize;
                        image.texels[row + area.x as usize..row + area.right() as usize].fill(value);
                    }
                }
            }
            Command::Draw(draw) => {
                self.stats.draws += 1;
                if draw.hd.is_some() {
                    self.stats.hd_draws += 1;
                }
                trace!(
                    "[software] draw {:?} with {} vertices, scissor {:?}, hd {:?}",
                    draw.program,
                    draw.vertices.len(),
                    draw.scissor,
                    draw.hd.map(|hd| hd.image)
                );
            }
            Command::PixelBarrier => self.stats.pixel_barriers += 1,
            Command::EndRenderPass => {}
        }
        Ok(())
    }
}

impl ResourceLookup for SoftwareGpu {
    fn lookup_image(&self, image: ImageHandle) -> Result<ImageDesc, GpuError> {
        Ok(self.image(image)?.desc)
    }

    fn lookup_buffer_size(&self, buffer: BufferHandle) -> Result<u64, GpuError> {
        Ok(self.buffer(buffer)?.size as u64)
    }
}

fn pack_rgba32f(color: [f32; 4]) -> u32 {
    color.iter().enumerate().fold(0u32, |packed, (channel, value)| {
        let byte = (value.clamp(0.0, 1.0) * 255.0).round() as u32;
        packed | byte << (8 * channel)
    })
}

impl GpuDevice for SoftwareGpu {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, GpuError> {
        if desc.width > self.limits.max_image_dimension_2d
            || desc.height > self.limits.max_image_dimension_2d
        {
            return Err(GpuError::OutOfMemory { what: "image" });
        }
        let texels = vec![0; desc.total_texels()];
        let key = self
            .images
            .insert(SoftwareImage { desc, texels })
            .map_err(GpuError::stale_image)?;
        Ok(ImageHandle::new(key))
    }

    fn release_image(&mut self, image: ImageHandle) -> Result<(), GpuError> {
        self.images
            .remove(image.key())
            .map(|_| ())
            .map_err(GpuError::stale_image)
    }

    fn image_desc(&self, image: ImageHandle) -> Result<ImageDesc, GpuError> {
        Ok(self.image(image)?.desc)
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle, GpuError> {
        let size = usize::try_from(size).map_err(|_| GpuError::OutOfMemory { what: "buffer" })?;
        let key = self
            .buffers
            .insert(SoftwareBuffer {
                usage,
                size,
                words: vec![0; size.div_ceil(4)],
                mapped: false,
            })
            .map_err(GpuError::stale_buffer)?;
        Ok(BufferHandle::new(key))
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), GpuError> {
        self.buffers
            .remove(buffer.key())
            .map(|_| ())
            .map_err(GpuError::stale_buffer)
    }

    fn map_buffer(&mut self, buffer: BufferHandle) -> Result<&mut [u8], GpuError> {
        let buffer = self.buffer_mut(buffer)?;
        if buffer.usage != BufferUsage::Upload {
            return Err(GpuError::InvalidCommand(
                "only upload buffers can be mapped for writing".to_owned(),
            ));
        }
        if buffer.mapped {
            return Err(GpuError::AlreadyMapped);
        }
        buffer.mapped = true;
        let size = buffer.size;
        Ok(&mut bytemuck::cast_slice_mut(&mut buffer.words)[..size])
    }

    fn unmap_buffer(&mut self, buffer: BufferHandle) -> Result<(), GpuError> {
        let buffer = self.buffer_mut(buffer)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        buffer.mapped = false;
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError> {
        let buffer = self.buffer(buffer)?;
        if buffer.usage != BufferUsage::Readback {
            return Err(GpuError::InvalidCommand(
                "only readback buffers can be read".to_owned(),
            ));
        }
        Ok(bytemuck::cast_slice(&buffer.words)[..buffer.size].to_vec())
    }

    fn record(&mut self, command: Command) -> Result<(), GpuError> {
        self.pass_open = validate(self, self.pass_open, &command)?;
        self.pending.push(command);
        Ok(())
    }

    fn submit(&mut self) -> Result<(), GpuError> {
        if self.pass_open {
            return Err(GpuError::InvalidCommand(
                "submit with an open render pass".to_owned(),
            ));
        }
        let pending = std::mem::take(&mut self.pending);
        trace!("[software] submit {} commands", pending.len());
        for command in pending {
            self.execute(command)?;
        }
        self.stats.submits += 1;
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests;
