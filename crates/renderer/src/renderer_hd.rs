//! Replacement textures sampled by textured primitives in place of VRAM texels.

use gpu_runtime::{
    Access, Barrier, BufferUsage, Command, GpuDevice, HdSampling, HdTexturePush, ImageDesc,
    ImageFormat, ImageHandle, PipelineStages,
};
use tracing::{debug, trace};
use vram_model::Rect;

use crate::{Renderer, RendererError};

/// A replacement image and the VRAM area it stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdTextureBinding {
    pub image: ImageHandle,
    pub vram_rect: Rect,
    /// Region of level 0 covering `vram_rect`, in replacement texels.
    pub texel_rect: Rect,
}

impl<D: GpuDevice> Renderer<D> {
    /// Creates an RGBA8 image from `levels`, packed `0xAABBGGRR` and row-major. Level
    /// `n` is `width >> n` by `height >> n`, at least one texel each way.
    pub fn upload_hd_texture(
        &mut self,
        width: u32,
        height: u32,
        levels: &[Vec<u32>],
    ) -> Result<ImageHandle, RendererError> {
        if levels.is_empty() || width == 0 || height == 0 {
            return Err(RendererError::EmptyHdTexture);
        }
        let desc = ImageDesc::new(width, height, ImageFormat::Rgba8).with_levels(levels.len() as u32);
        for (level, texels) in (0u32..).zip(levels) {
            let expected = desc.level_texels(level);
            if texels.len() < expected {
                return Err(RendererError::HostBufferTooSmall {
                    expected,
                    actual: texels.len(),
                });
            }
        }

        let image = self.core.device.create_image(desc)?;
        for (level, texels) in (0u32..).zip(levels) {
            let (level_width, level_height) = desc.level_extent(level);
            let count = desc.level_texels(level);
            let buffer = self
                .core
                .device
                .create_buffer(count as u64 * 4, BufferUsage::Upload)?;
            let mapped = self.core.device.map_buffer(buffer)?;
            for (bytes, texel) in mapped.chunks_exact_mut(4).zip(&texels[..count]) {
                bytes.copy_from_slice(&texel.to_le_bytes());
            }
            self.core.device.unmap_buffer(buffer)?;
            self.core.record(Command::CopyBufferToImage {
                buffer,
                image,
                level,
                region: Rect::new(0, 0, level_width, level_height),
            });
            self.core.retired_buffers.push(buffer);
        }
        self.core.barrier(Barrier {
            src_stages: PipelineStages::TRANSFER,
            src_access: Access::TRANSFER_WRITE,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            dst_access: Access::SHADER_READ,
        });
        self.core.commit()?;
        debug!(
            "[renderer] uploaded {}x{} replacement with {} levels as {:?}",
            width,
            height,
            levels.len(),
            image
        );
        Ok(image)
    }

    /// Replacement sampled by textured primitives queued from now on. `None` samples
    /// VRAM again.
    pub fn set_hd_texture(&mut self, binding: Option<HdTextureBinding>) -> Result<(), RendererError> {
        self.core.hd_texture = match binding {
            None => None,
            Some(binding) => {
                let desc = self.core.device.image_desc(binding.image)?;
                Some(HdSampling {
                    image: binding.image,
                    params: HdTexturePush::new(
                        binding.vram_rect,
                        binding.texel_rect,
                        [desc.width, desc.height],
                        desc.levels,
                    ),
                })
            }
        };
        Ok(())
    }

    pub fn hd_texture(&self) -> Option<ImageHandle> {
        self.core.hd_texture.map(|sampling| sampling.image)
    }

    /// Releases `image` at the first submit after no queued or bound primitive samples
    /// it anymore.
    pub fn release_hd_texture(&mut self, image: ImageHandle) {
        trace!("[renderer] retire replacement image {:?}", image);
        if !self.core.retired_images.contains(&image) {
            self.core.retired_images.push(image);
        }
    }
}
