use std::collections::HashMap;

use vram_model::SemiTransparentMode;

use crate::command::{ComputeProgram, EnergyPass, RasterProgram, ScanoutProgram};
use crate::program::PrimitiveVertex;

pub(super) const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub(super) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Push bytes are padded to this offset; the dispatch info block follows.
pub(super) const PUSH_BLOCK_SIZE: usize = 48;
pub(super) const UNIFORM_SIZE: usize = PUSH_BLOCK_SIZE + 32;

const FLAG_MASKED: u32 = 1;
const FLAG_RGBA: u32 = 2;
const FLAG_DITHER: u32 = 1;
const FLAG_YUV: u32 = 2;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 6] = wgpu::vertex_attr_array![
    0 => Float32x4,
    1 => Uint32,
    2 => Uint8x4,
    3 => Sint16x4,
    4 => Sint16x4,
    5 => Uint16x4,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum ShaderFile {
    Resolve,
    Blit,
    BlitCached,
    Copy,
    Mipmap,
    Scanout,
}

impl ShaderFile {
    fn label(self) -> &'static str {
        match self {
            ShaderFile::Resolve => "gpu_runtime.resolve",
            ShaderFile::Blit => "gpu_runtime.blit",
            ShaderFile::BlitCached => "gpu_runtime.blit_cached",
            ShaderFile::Copy => "gpu_runtime.copy",
            ShaderFile::Mipmap => "gpu_runtime.mipmap",
            ShaderFile::Scanout => "gpu_runtime.scanout",
        }
    }

    fn source(self) -> &'static str {
        match self {
            ShaderFile::Resolve => include_str!("resolve.wgsl"),
            ShaderFile::Blit => include_str!("blit.wgsl"),
            ShaderFile::BlitCached => include_str!("blit_cached.wgsl"),
            ShaderFile::Copy => include_str!("copy.wgsl"),
            ShaderFile::Mipmap => include_str!("mipmap.wgsl"),
            ShaderFile::Scanout => include_str!("scanout.wgsl"),
        }
    }
}

/// Shader file, entry point and runtime flags of a compute program.
pub(super) fn compute_entry(program: ComputeProgram) -> (ShaderFile, &'static str, u32) {
    let masked_flags = |scaled: bool, masked: bool| {
        let mut flags = 0;
        if masked {
            flags |= FLAG_MASKED;
        }
        if scaled {
            flags |= FLAG_RGBA;
        }
        flags
    };
    let dither_flags = |dither: bool| if dither { FLAG_DITHER } else { 0 };
    match program {
        ComputeProgram::ResolveToScaled => (ShaderFile::Resolve, "resolve_to_scaled", 0),
        ComputeProgram::ResolveToUnscaled => {
            (ShaderFile::Resolve, "resolve_to_unscaled", 0)
        }
        ComputeProgram::BlitVram { scaled, masked } => (
            ShaderFile::Blit,
            "blit_vram",
            masked_flags(scaled, masked),
        ),
        ComputeProgram::BlitVramCached { scaled, masked } => (
            ShaderFile::BlitCached,
            "blit_vram_cached",
            masked_flags(scaled, masked),
        ),
        ComputeProgram::CopyToVram { masked } => (
            ShaderFile::Copy,
            "copy_to_vram",
            masked_flags(false, masked),
        ),
        ComputeProgram::Mipmap(EnergyPass::First) => {
            (ShaderFile::Mipmap, "mipmap_energy_first", 0)
        }
        ComputeProgram::Mipmap(EnergyPass::Middle) => {
            (ShaderFile::Mipmap, "mipmap_energy", 0)
        }
        ComputeProgram::Mipmap(EnergyPass::Blur) => {
            (ShaderFile::Mipmap, "mipmap_blur", 0)
        }
        ComputeProgram::Scanout(ScanoutProgram::Scaled { dither }) => (
            ShaderFile::Scanout,
            "scanout_scaled",
            dither_flags(dither),
        ),
        ComputeProgram::Scanout(ScanoutProgram::Unscaled { dither }) => (
            ShaderFile::Scanout,
            "scanout_unscaled",
            dither_flags(dither),
        ),
        ComputeProgram::Scanout(ScanoutProgram::Bpp24 { yuv }) => (
            ShaderFile::Scanout,
            "scanout_24bpp",
            if yuv { FLAG_YUV } else { 0 },
        ),
        ComputeProgram::Scanout(ScanoutProgram::Adaptive { dither }) => (
            ShaderFile::Scanout,
            "scanout_adaptive",
            dither_flags(dither),
        ),
    }
}

fn fragment_entry(program: RasterProgram) -> &'static str {
    let feedback_entry = |textured: bool, mode: SemiTransparentMode| match (textured, mode) {
        (false, SemiTransparentMode::None) => "fs_feedback_flat_none",
        (false, SemiTransparentMode::Average) => "fs_feedback_flat_average",
        (false, SemiTransparentMode::Add) => "fs_feedback_flat_add",
        (false, SemiTransparentMode::Sub) => "fs_feedback_flat_sub",
        (false, SemiTransparentMode::AddQuarter) => "fs_feedback_flat_add_quarter",
        (true, SemiTransparentMode::None) => "fs_feedback_textured_none",
        (true, SemiTransparentMode::Average) => "fs_feedback_textured_average",
        (true, SemiTransparentMode::Add) => "fs_feedback_textured_add",
        (true, SemiTransparentMode::Sub) => "fs_feedback_textured_sub",
        (true, SemiTransparentMode::AddQuarter) => "fs_feedback_textured_add_quarter",
    };
    match program {
        RasterProgram::Flat => "fs_flat",
        RasterProgram::Textured => "fs_textured",
        RasterProgram::TexturedOpaqueTexels => "fs_textured_opaque",
        RasterProgram::SemiTransparent { textured: false, .. } => "fs_flat",
        RasterProgram::SemiTransparent { textured: true, .. } => "fs_semi_textured",
        RasterProgram::Feedback { textured, mode } => feedback_entry(textured, mode),
    }
}

fn blend_state(program: RasterProgram) -> Option<wgpu::BlendState> {
    let RasterProgram::SemiTransparent { mode, .. } = program else {
        return None;
    };
    let color = match mode {
        SemiTransparentMode::None => return None,
        SemiTransparentMode::Average => wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::Constant,
            dst_factor: wgpu::BlendFactor::Constant,
            operation: wgpu::BlendOperation::Add,
        },
        SemiTransparentMode::Add => wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::Add,
        },
        SemiTransparentMode::Sub => wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::ReverseSubtract,
        },
        SemiTransparentMode::AddQuarter => wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::Constant,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::Add,
        },
    };
    Some(wgpu::BlendState {
        color,
        alpha: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::Zero,
            operation: wgpu::BlendOperation::Add,
        },
    })
}

/// Blend constant a fixed-function program expects, if any.
pub(super) fn blend_constant(program: RasterProgram) -> Option<wgpu::Color> {
    let factor = match program {
        RasterProgram::SemiTransparent {
            mode: SemiTransparentMode::Average,
            ..
        } => 0.5,
        RasterProgram::SemiTransparent {
            mode: SemiTransparentMode::AddQuarter,
            ..
        } => 0.25,
        _ => return None,
    };
    Some(wgpu::Color {
        r: factor,
        g: factor,
        b: factor,
        a: factor,
    })
}

fn storage_entry(binding: u32, read_only: bool, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Lazily created pipelines. Every compute program shares one bind group layout:
/// uniform params, destination image, two source images and a storage payload.
/// Raster programs bind VRAM, the feedback texture, replacement texels and their
/// `HdTexturePush` params.
pub(super) struct Pipelines {
    compute_layout: wgpu::BindGroupLayout,
    compute_pipeline_layout: wgpu::PipelineLayout,
    raster_layout: wgpu::BindGroupLayout,
    raster_pipeline_layout: wgpu::PipelineLayout,
    modules: HashMap<ShaderFile, wgpu::ShaderModule>,
    primitive_module: wgpu::ShaderModule,
    compute: HashMap<&'static str, wgpu::ComputePipeline>,
    raster: HashMap<RasterProgram, wgpu::RenderPipeline>,
}

impl Pipelines {
    pub(super) fn new(device: &wgpu::Device) -> Self {
        let compute_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gpu_runtime.compute.bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, false, wgpu::ShaderStages::COMPUTE),
                storage_entry(2, true, wgpu::ShaderStages::COMPUTE),
                storage_entry(3, true, wgpu::ShaderStages::COMPUTE),
                storage_entry(4, true, wgpu::ShaderStages::COMPUTE),
            ],
        });
        let compute_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gpu_runtime.compute.pipeline_layout"),
            bind_group_layouts: &[&compute_layout],
            immediate_size: 0,
        });
        let raster_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gpu_runtime.primitive.bind_group_layout"),
            entries: &[
                storage_entry(0, true, wgpu::ShaderStages::FRAGMENT),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                storage_entry(2, true, wgpu::ShaderStages::FRAGMENT),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let raster_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gpu_runtime.primitive.pipeline_layout"),
            bind_group_layouts: &[&raster_layout],
            immediate_size: 0,
        });
        let primitive_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gpu_runtime.primitive"),
            source: wgpu::ShaderSource::Wgsl(include_str!("primitive.wgsl").into()),
        });
        Self {
            compute_layout,
            compute_pipeline_layout,
            raster_layout,
            raster_pipeline_layout,
            modules: HashMap::new(),
            primitive_module,
            compute: HashMap::new(),
            raster: HashMap::new(),
        }
    }

    pub(super) fn compute_layout(&self) -> &wgpu::BindGroupLayout {
        &self.compute_layout
    }

    pub(super) fn raster_layout(&self) -> &wgpu::BindGroupLayout {
        &self.raster_layout
    }

    pub(super) fn compute(
        &mut self,
        device: &wgpu::Device,
        file: ShaderFile,
        entry: &'static str,
    ) -> &wgpu::ComputePipeline {
        let module = self.modules.entry(file).or_insert_with(|| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(file.label()),
                source: wgpu::ShaderSource::Wgsl(file.source().into()),
            })
        });
        let layout = &self.compute_pipeline_layout;
        self.compute.entry(entry).or_insert_with(|| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(layout),
                module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        })
    }

    pub(super) fn raster(&mut self, device: &wgpu::Device, program: RasterProgram) -> &wgpu::RenderPipeline {
        let module = &self.primitive_module;
        let layout = &self.raster_pipeline_layout;
        self.raster.entry(program).or_insert_with(|| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("gpu_runtime.primitive.pipeline"),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: size_of::<PrimitiveVertex>() as wgpu::BufferAddress,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &VERTEX_ATTRIBUTES,
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(fragment_entry(program)),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: blend_state(program),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            })
        })
    }
}
