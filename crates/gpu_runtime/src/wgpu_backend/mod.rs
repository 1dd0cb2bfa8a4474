//! wgpu device.
//!
//! Images are storage buffers that compute programs address as flat `u32` arrays,
//! levels stored back to back. Render passes draw into a color texture kept per
//! target image; the texture is loaded from the image buffer over the pass area and
//! written back when the pass ends. `PixelBarrier` splits a pass and refreshes the
//! feedback texture that programmable-blend draws sample. Draws carrying a replacement
//! texture get their own bind group for its texels and params.

mod pipelines;

use std::collections::HashMap;
use std::sync::mpsc;

use smallvec::SmallVec;
use tracing::{debug, trace};
use vram_model::Rect;
use wgpu::util::DeviceExt;

use crate::command::{
    BufferUsage, Command, ComputeDispatch, DeviceLimits, DeviceStats, DrawCall, GpuDevice,
    HdSampling, ImageDesc, LoadOp, RenderPassDesc,
};
use crate::error::GpuError;
use crate::key::{BufferHandle, ImageHandle};
use crate::program::{HdTexturePush, PrimitiveVertex};
use crate::slots::HandleTable;
use crate::validate::{ResourceLookup, validate};

use pipelines::{COLOR_FORMAT, DEPTH_FORMAT, PUSH_BLOCK_SIZE, Pipelines, UNIFORM_SIZE};

const MAX_RESOURCES: u32 = 1 << 16;
const TEXEL_BYTES: u64 = 4;

struct RenderTargets {
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    feedback: wgpu::Texture,
    feedback_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

struct WgpuImage {
    desc: ImageDesc,
    buffer: wgpu::Buffer,
    targets: Option<RenderTargets>,
}

impl WgpuImage {
    fn level_byte_offset(&self, level: u32, x: u32, y: u32) -> u64 {
        let (width, _) = self.desc.level_extent(level);
        (self.desc.level_offset(level) as u64 + u64::from(y) * u64::from(width) + u64::from(x))
            * TEXEL_BYTES
    }
}

struct WgpuBuffer {
    usage: BufferUsage,
    size: u64,
    buffer: wgpu::Buffer,
    /// Host copy of an upload buffer, written to the device on unmap.
    shadow: Vec<u32>,
    mapped: bool,
}

enum PassOp {
    Draw(DrawCall),
    PixelBarrier,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    max_binding_size: u64,
    max_texture_dimension: u32,
    pipelines: Pipelines,
    images: HandleTable<WgpuImage>,
    buffers: HandleTable<WgpuBuffer>,
    /// Bound to every read-only storage slot a program leaves unused.
    unused_binding: wgpu::Buffer,
    /// Zeroed `HdTexturePush` for draws without a replacement.
    hd_disabled: wgpu::Buffer,
    pending: Vec<Command>,
    pass_open: bool,
    stats: DeviceStats,
}

fn raster_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    vram: &wgpu::Buffer,
    feedback: &wgpu::TextureView,
    hd_texels: &wgpu::Buffer,
    hd_params: &wgpu::Buffer,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("gpu_runtime.primitive.bind_group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: vram.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(feedback),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: hd_texels.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: hd_params.as_entire_binding(),
            },
        ],
    })
}

fn area_texture(texture: &wgpu::Texture, area: Rect) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d {
            x: area.x,
            y: area.y,
            z: 0,
        },
        aspect: wgpu::TextureAspect::All,
    }
}

/// Largest power-of-two-halved dimension whose 2:1 image with a full mip chain fits
/// in one storage binding.
fn derive_limits(limits: &wgpu::Limits) -> DeviceLimits {
    let max_binding = u64::from(limits.max_storage_buffer_binding_size);
    let chain_bytes = |width: u64| width * (width / 2) * TEXEL_BYTES * 4 / 3;
    let mut dimension = limits.max_texture_dimension_2d.max(1);
    while dimension > vram_model::FB_WIDTH && chain_bytes(u64::from(dimension)) > max_binding {
        dimension /= 2;
    }
    DeviceLimits {
        max_image_dimension_2d: dimension,
        max_texel_buffer_elements: u32::try_from(max_binding / 2).unwrap_or(u32::MAX),
    }
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let device_limits = device.limits();
        let limits = derive_limits(&device_limits);
        debug!(
            "[gpu_runtime] wgpu device limits: max image {} max upload elements {}",
            limits.max_image_dimension_2d, limits.max_texel_buffer_elements
        );
        let pipelines = Pipelines::new(&device);
        let unused_binding = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_runtime.unused_binding"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let hd_disabled = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_runtime.hd_disabled"),
            size: size_of::<HdTexturePush>() as u64,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        Self {
            max_binding_size: u64::from(device_limits.max_storage_buffer_binding_size),
            max_texture_dimension: device_limits.max_texture_dimension_2d,
            device,
            queue,
            limits,
            pipelines,
            images: HandleTable::new(MAX_RESOURCES),
            buffers: HandleTable::new(MAX_RESOURCES),
            unused_binding,
            hd_disabled,
            pending: Vec::new(),
            pass_open: false,
            stats: DeviceStats::default(),
        }
    }

    pub async fn request_async(power_preference: wgpu::PowerPreference) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|error| GpuError::NoAdapter(error.to_string()))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpu_runtime.device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|error| GpuError::RequestDevice(error.to_string()))?;
        debug!("[gpu_runtime] using adapter {}", adapter.get_info().name);
        Ok(Self::new(device, queue))
    }

    #[cfg(feature = "blocking")]
    pub fn request(power_preference: wgpu::PowerPreference) -> Result<Self, GpuError> {
        pollster::block_on(Self::request_async(power_preference))
    }

    fn image(&self, image: ImageHandle) -> Result<&WgpuImage, GpuError> {
        self.images.get(image.key()).map_err(GpuError::stale_image)
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&WgpuBuffer, GpuError> {
        self.buffers.get(buffer.key()).map_err(GpuError::stale_buffer)
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> Result<&mut WgpuBuffer, GpuError> {
        self.buffers.get_mut(buffer.key()).map_err(GpuError::stale_buffer)
    }

    fn ensure_targets(&mut self, image: ImageHandle) -> Result<(), GpuError> {
        let max_texture_dimension = self.max_texture_dimension;
        let device = &self.device;
        let image = self
            .images
            .get_mut(image.key())
            .map_err(GpuError::stale_image)?;
        if image.targets.is_some() {
            return Ok(());
        }
        let ImageDesc { width, height, .. } = image.desc;
        if width > max_texture_dimension || height > max_texture_dimension {
            return Err(GpuError::OutOfMemory {
                what: "render target",
            });
        }
        if (width * TEXEL_BYTES as u32) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT != 0 {
            return Err(GpuError::InvalidCommand(format!(
                "render target width {width} is not copy aligned"
            )));
        }
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = |label: &'static str, format, usage| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        };
        let color = texture(
            "gpu_runtime.render_target.color",
            COLOR_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
        );
        let feedback = texture(
            "gpu_runtime.render_target.feedback",
            COLOR_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let depth = texture(
            "gpu_runtime.render_target.depth",
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        image.targets = Some(RenderTargets {
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            feedback_view: feedback.create_view(&wgpu::TextureViewDescriptor::default()),
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
            color,
            feedback,
        });
        Ok(())
    }

    fn encode(&mut self, encoder: &mut wgpu::CommandEncoder, command: Command) -> Result<(), GpuError> {
        match command {
            Command::Barrier(barrier) => {
                // Storage hazards between passes are tracked by wgpu itself.
                trace!("[gpu_runtime] barrier {:?}", barrier);
                self.stats.barriers += 1;
            }
            Command::ClearImage { image, value } => {
                let image = self.image(image)?;
                if value == 0 {
                    encoder.clear_buffer(&image.buffer, 0, None);
                } else {
                    let fill = vec![value; image.desc.total_texels()];
                    let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("gpu_runtime.clear_staging"),
                        contents: bytemuck::cast_slice(&fill),
                        usage: wgpu::BufferUsages::COPY_SRC,
                    });
                    encoder.copy_buffer_to_buffer(&staging, 0, &image.buffer, 0, image.buffer.size());
                }
            }
            Command::Dispatch(dispatch) => self.encode_dispatch(encoder, &dispatch)?,
            Command::CopyImageToBuffer {
                image,
                level,
                region,
                buffer,
            } => {
                let image = self.image(image)?;
                let buffer = self.buffer(buffer)?;
                let row_bytes = u64::from(region.width) * TEXEL_BYTES;
                for (row, y) in (region.y..region.bottom()).enumerate() {
                    encoder.copy_buffer_to_buffer(
                        &image.buffer,
                        image.level_byte_offset(level, region.x, y),
                        &buffer.buffer,
                        row as u64 * row_bytes,
                        row_bytes,
                    );
                }
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                level,
                region,
            } => {
                let image = self.image(image)?;
                let buffer = self.buffer(buffer)?;
                let row_bytes = u64::from(region.width) * TEXEL_BYTES;
                for (row, y) in (region.y..region.bottom()).enumerate() {
                    encoder.copy_buffer_to_buffer(
                        &buffer.buffer,
                        row as u64 * row_bytes,
                        &image.buffer,
                        image.level_byte_offset(level, region.x, y),
                        row_bytes,
                    );
                }
            }
            Command::BeginRenderPass(_)
            | Command::Draw(_)
            | Command::PixelBarrier
            | Command::EndRenderPass => {
                return Err(GpuError::InvalidCommand(
                    "render pass command outside of a render pass".to_owned(),
                ));
            }
        }
        Ok(())
    }

    fn encode_dispatch(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        dispatch: &ComputeDispatch,
    ) -> Result<(), GpuError> {
        if dispatch.push.len() > PUSH_BLOCK_SIZE {
            return Err(GpuError::InvalidCommand(format!(
                "{:?} push constants exceed {PUSH_BLOCK_SIZE} bytes",
                dispatch.program
            )));
        }
        let (file, entry, flags) = pipelines::compute_entry(dispatch.program);
        let images = dispatch
            .images
            .iter()
            .map(|image| self.images.get(image.key()).map_err(GpuError::stale_image))
            .collect::<Result<SmallVec<[&WgpuImage; 4]>, _>>()?;
        let Some(dst) = images.first() else {
            return Err(GpuError::InvalidCommand(format!(
                "{:?} binds no images",
                dispatch.program
            )));
        };
        let src = images.get(1).unwrap_or(dst);

        let mut params = [0u8; UNIFORM_SIZE];
        params[..dispatch.push.len()].copy_from_slice(&dispatch.push);
        let info = [
            dst.desc.width,
            dst.desc.height,
            dst.desc.levels,
            flags,
            src.desc.width,
            src.desc.height,
            src.desc.levels,
            0,
        ];
        params[PUSH_BLOCK_SIZE..].copy_from_slice(bytemuck::cast_slice(&info));
        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpu_runtime.dispatch.params"),
            contents: &params,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let storage = (!dispatch.storage.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("gpu_runtime.dispatch.storage"),
                contents: &dispatch.storage,
                usage: wgpu::BufferUsages::STORAGE,
            })
        });
        let upload = match dispatch.buffer {
            Some(buffer) => Some(
                &self
                    .buffers
                    .get(buffer.key())
                    .map_err(GpuError::stale_buffer)?
                    .buffer,
            ),
            None => None,
        };
        let payload = upload.or(storage.as_ref()).unwrap_or(&self.unused_binding);
        let image_binding = |index: usize| {
            images
                .get(index)
                .map_or(&self.unused_binding, |image| &image.buffer)
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gpu_runtime.dispatch.bind_group"),
            layout: self.pipelines.compute_layout(),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dst.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: image_binding(1).as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: image_binding(2).as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: payload.as_entire_binding(),
                },
            ],
        });
        let pipeline = self.pipelines.compute(&self.device, file, entry);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(entry),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = dispatch.groups;
        pass.dispatch_workgroups(x, y, z);
        drop(pass);
        self.stats.dispatches += 1;
        Ok(())
    }

    fn encode_render_pass(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        desc: RenderPassDesc,
        ops: Vec<PassOp>,
    ) -> Result<(), GpuError> {
        self.ensure_targets(desc.target)?;
        self.stats.render_passes += 1;
        let target = self
            .images
            .get(desc.target.key())
            .map_err(GpuError::stale_image)?;
        let vram = self
            .images
            .get(desc.vram.key())
            .map_err(GpuError::stale_image)?;
        let Some(targets) = target.targets.as_ref() else {
            return Err(GpuError::InvalidCommand(
                "render target was not created".to_owned(),
            ));
        };
        let area = desc
            .area
            .scissor(&Rect::new(0, 0, target.desc.width, target.desc.height));

        let buffer_layout = wgpu::TexelCopyBufferLayout {
            offset: target.level_byte_offset(0, area.x, area.y),
            bytes_per_row: Some(target.desc.width * TEXEL_BYTES as u32),
            rows_per_image: None,
        };
        let extent = wgpu::Extent3d {
            width: area.width,
            height: area.height,
            depth_or_array_layers: 1,
        };

        let (first_color_load, depth_clear) = match desc.load {
            LoadOp::Load => {
                if !area.is_empty() {
                    encoder.copy_buffer_to_texture(
                        wgpu::TexelCopyBufferInfo {
                            buffer: &target.buffer,
                            layout: buffer_layout,
                        },
                        area_texture(&targets.color, area),
                        extent,
                    );
                }
                (wgpu::LoadOp::Load, 1.0)
            }
            LoadOp::Clear { color, depth } => (
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(color[0]),
                    g: f64::from(color[1]),
                    b: f64::from(color[2]),
                    a: f64::from(color[3]),
                }),
                depth,
            ),
        };

        let vertices: Vec<PrimitiveVertex> = ops
            .iter()
            .filter_map(|op| match op {
                PassOp::Draw(draw) => Some(draw.vertices.as_slice()),
                PassOp::PixelBarrier => None,
            })
            .flatten()
            .copied()
            .collect();
        let vertex_buffer = (!vertices.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("gpu_runtime.primitive.vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            })
        });
        let bind_group = raster_bind_group(
            &self.device,
            self.pipelines.raster_layout(),
            &vram.buffer,
            &targets.feedback_view,
            &self.unused_binding,
            &self.hd_disabled,
        );
        let mut hd_bind_groups: HashMap<HdSampling, wgpu::BindGroup> = HashMap::new();
        for op in &ops {
            let PassOp::Draw(DrawCall { hd: Some(hd), .. }) = op else {
                continue;
            };
            if hd_bind_groups.contains_key(hd) {
                continue;
            }
            let image = self
                .images
                .get(hd.image.key())
                .map_err(GpuError::stale_image)?;
            let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("gpu_runtime.primitive.hd_params"),
                contents: bytemuck::bytes_of(&hd.params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let group = raster_bind_group(
                &self.device,
                self.pipelines.raster_layout(),
                &vram.buffer,
                &targets.feedback_view,
                &image.buffer,
                &params,
            );
            hd_bind_groups.insert(*hd, group);
        }

        let segments = ops.split(|op| matches!(op, PassOp::PixelBarrier));
        let mut first_vertex = 0u32;
        for (index, segment) in segments.enumerate() {
            let first = index == 0;
            if !first {
                self.stats.pixel_barriers += 1;
                if !area.is_empty() {
                    encoder.copy_texture_to_texture(
                        area_texture(&targets.color, area),
                        area_texture(&targets.feedback, area),
                        extent,
                    );
                }
            }
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("gpu_runtime.primitive.pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: if first {
                            first_color_load
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &targets.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: if first {
                            wgpu::LoadOp::Clear(depth_clear)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_bind_group(0, &bind_group, &[]);
            let mut bound: Option<HdSampling> = None;
            if let Some(vertex_buffer) = vertex_buffer.as_ref() {
                pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            }
            for op in segment {
                let PassOp::Draw(draw) = op else {
                    continue;
                };
                let count = u32::try_from(draw.vertices.len())
                    .map_err(|_| GpuError::OutOfBounds { what: "draw" })?;
                let vertex_range = first_vertex..first_vertex + count;
                first_vertex += count;
                self.stats.draws += 1;
                if draw.hd.is_some() {
                    self.stats.hd_draws += 1;
                }
                let scissor = draw.scissor.scissor(&area);
                if scissor.is_empty() || count == 0 {
                    continue;
                }
                if draw.hd != bound {
                    let group = draw
                        .hd
                        .as_ref()
                        .and_then(|hd| hd_bind_groups.get(hd))
                        .unwrap_or(&bind_group);
                    pass.set_bind_group(0, group, &[]);
                    bound = draw.hd;
                }
                pass.set_pipeline(self.pipelines.raster(&self.device, draw.program));
                if let Some(constant) = pipelines::blend_constant(draw.program) {
                    pass.set_blend_constant(constant);
                }
                pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
                pass.draw(vertex_range, 0..1);
            }
        }

        if !area.is_empty() {
            encoder.copy_texture_to_buffer(
                area_texture(&targets.color, area),
                wgpu::TexelCopyBufferInfo {
                    buffer: &target.buffer,
                    layout: buffer_layout,
                },
                extent,
            );
        }
        Ok(())
    }
}

impl ResourceLookup for WgpuDevice {
    fn lookup_image(&self, image: ImageHandle) -> Result<ImageDesc, GpuError> {
        Ok(self.image(image)?.desc)
    }

    fn lookup_buffer_size(&self, buffer: BufferHandle) -> Result<u64, GpuError> {
        Ok(self.buffer(buffer)?.size)
    }
}

impl GpuDevice for WgpuDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, GpuError> {
        let size = desc.total_texels() as u64 * TEXEL_BYTES;
        if desc.width > self.limits.max_image_dimension_2d
            || desc.height > self.limits.max_image_dimension_2d
            || size > self.max_binding_size
        {
            return Err(GpuError::OutOfMemory { what: "image" });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_runtime.image"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let key = self
            .images
            .insert(WgpuImage {
                desc,
                buffer,
                targets: None,
            })
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
        let padded = size.div_ceil(TEXEL_BYTES).max(1) * TEXEL_BYTES;
        let (label, buffer_usage, shadow) = match usage {
            BufferUsage::Upload => {
                let words = usize::try_from(padded / TEXEL_BYTES)
                    .map_err(|_| GpuError::OutOfMemory { what: "buffer" })?;
                (
                    "gpu_runtime.upload",
                    wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    vec![0; words],
                )
            }
            BufferUsage::Readback => (
                "gpu_runtime.readback",
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                Vec::new(),
            ),
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage: buffer_usage,
            mapped_at_creation: false,
        });
        let key = self
            .buffers
            .insert(WgpuBuffer {
                usage,
                size,
                buffer,
                shadow,
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
        let size = usize::try_from(buffer.size).map_err(|_| GpuError::OutOfMemory { what: "buffer" })?;
        Ok(&mut bytemuck::cast_slice_mut(&mut buffer.shadow)[..size])
    }

    fn unmap_buffer(&mut self, buffer: BufferHandle) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get_mut(buffer.key())
            .map_err(GpuError::stale_buffer)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        buffer.mapped = false;
        self.queue
            .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&buffer.shadow));
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError> {
        let buffer = self.buffer(buffer)?;
        if buffer.usage != BufferUsage::Readback {
            return Err(GpuError::InvalidCommand(
                "only readback buffers can be read".to_owned(),
            ));
        }
        let size = usize::try_from(buffer.size).map_err(|_| GpuError::OutOfMemory { what: "buffer" })?;
        let slice = buffer.buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|error| GpuError::Readback(error.to_string()))?;
        receiver
            .recv()
            .map_err(|error| GpuError::Readback(error.to_string()))?
            .map_err(|error| GpuError::Readback(error.to_string()))?;
        let mapped = slice.get_mapped_range();
        let bytes = mapped[..size].to_vec();
        drop(mapped);
        buffer.buffer.unmap();
        Ok(bytes)
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
        trace!("[gpu_runtime] submit {} commands", pending.len());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gpu_runtime.submit"),
            });
        let mut commands = pending.into_iter();
        while let Some(command) = commands.next() {
            let Command::BeginRenderPass(desc) = command else {
                self.encode(&mut encoder, command)?;
                continue;
            };
            let mut ops = Vec::new();
            for command in commands.by_ref() {
                match command {
                    Command::Draw(draw) => ops.push(PassOp::Draw(draw)),
                    Command::PixelBarrier => ops.push(PassOp::PixelBarrier),
                    Command::EndRenderPass => break,
                    other => {
                        return Err(GpuError::InvalidCommand(format!(
                            "{other:?} inside a render pass"
                        )));
                    }
                }
            }
            self.encode_render_pass(&mut encoder, desc, ops)?;
        }
        self.queue.submit(Some(encoder.finish()));
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|error| GpuError::Readback(error.to_string()))?;
        self.stats.submits += 1;
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.stats
    }
}
