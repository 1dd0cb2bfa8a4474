use bytemuck::Pod;
use vram_model::{rgba8_to_vram_word, vram_word_to_rgba8};

use super::SoftwareImage;
use super::scanout;
use crate::command::{ComputeDispatch, ComputeProgram, ImageDesc, ImageFormat};
use crate::error::GpuError;
use crate::program::{BlitInfo, BlockRect, CachedBlitPush, CopyToVramPush, ResolvePush};
use crate::slots::HandleTable;

/// Cached blits copy at most this many texels per row before writing them back.
const BLIT_CACHE_WIDTH: u32 = 128;

/// Read-only view of one image level, addressed toroidally.
#[derive(Clone, Copy)]
pub(super) struct Plane<'a> {
    pub(super) width: u32,
    pub(super) height: u32,
    texels: &'a [u32],
}

impl<'a> Plane<'a> {
    pub(super) fn new(desc: &ImageDesc, level: u32, texels: &'a [u32]) -> Self {
        let (width, height) = desc.level_extent(level);
        let offset = desc.level_offset(level);
        Self {
            width,
            height,
            texels: &texels[offset..offset + desc.level_texels(level)],
        }
    }

    pub(super) fn of(image: &'a SoftwareImage, level: u32) -> Self {
        Self::new(&image.desc, level, &image.texels)
    }

    pub(super) fn at(&self, x: u32, y: u32) -> u32 {
        self.texels[((y % self.height) * self.width + (x % self.width)) as usize]
    }

    /// Clamp-to-edge lookup.
    pub(super) fn clamped(&self, x: u32, y: u32) -> u32 {
        self.texels[(y.min(self.height - 1) * self.width + x.min(self.width - 1)) as usize]
    }
}

pub(super) struct PlaneMut<'a> {
    pub(super) width: u32,
    pub(super) height: u32,
    texels: &'a mut [u32],
}

impl<'a> PlaneMut<'a> {
    pub(super) fn new(desc: &ImageDesc, level: u32, texels: &'a mut [u32]) -> Self {
        let (width, height) = desc.level_extent(level);
        let offset = desc.level_offset(level);
        let len = desc.level_texels(level);
        Self {
            width,
            height,
            texels: &mut texels[offset..offset + len],
        }
    }

    /// Wraps a slice holding exactly one level.
    pub(super) fn from_level(width: u32, height: u32, texels: &'a mut [u32]) -> Self {
        Self {
            width,
            height,
            texels,
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        ((y % self.height) * self.width + (x % self.width)) as usize
    }

    pub(super) fn at(&self, x: u32, y: u32) -> u32 {
        self.texels[self.index(x, y)]
    }

    pub(super) fn set(&mut self, x: u32, y: u32, value: u32) {
        let index = self.index(x, y);
        self.texels[index] = value;
    }
}

pub(super) fn push<T: Pod>(dispatch: &ComputeDispatch) -> Result<T, GpuError> {
    let size = std::mem::size_of::<T>();
    if dispatch.push.len() < size {
        return Err(GpuError::InvalidCommand(format!(
            "{:?} push data is {} bytes, expected {size}",
            dispatch.program,
            dispatch.push.len()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(&dispatch.push[..size]))
}

fn storage<T: Pod>(dispatch: &ComputeDispatch) -> Vec<T> {
    dispatch
        .storage
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

pub(super) fn source<'a>(
    images: &'a HandleTable<SoftwareImage>,
    dispatch: &ComputeDispatch,
    binding: usize,
) -> Result<&'a SoftwareImage, GpuError> {
    images
        .get(dispatch.images[binding].key())
        .map_err(GpuError::stale_image)
}

/// Runs `dispatch` with its first image bound for writing.
pub(super) fn execute(
    images: &mut HandleTable<SoftwareImage>,
    dispatch: &ComputeDispatch,
    upload: Option<&[u32]>,
) -> Result<(), GpuError> {
    let target_key = dispatch.images[0].key();
    let target = images.get_mut(target_key).map_err(GpuError::stale_image)?;
    let desc = target.desc;
    let mut texels = std::mem::take(&mut target.texels);
    let result = run(images, dispatch, &desc, &mut texels, upload);
    images
        .get_mut(target_key)
        .map_err(GpuError::stale_image)?
        .texels = texels;
    result
}

fn run(
    images: &HandleTable<SoftwareImage>,
    dispatch: &ComputeDispatch,
    desc: &ImageDesc,
    texels: &mut [u32],
    upload: Option<&[u32]>,
) -> Result<(), GpuError> {
    match dispatch.program {
        ComputeProgram::ResolveToScaled => {
            let ResolvePush { scale, .. } = push(dispatch)?;
            let unscaled = Plane::of(source(images, dispatch, 1)?, 0);
            let mut scaled = PlaneMut::new(desc, 0, texels);
            for rect in storage::<BlockRect>(dispatch) {
                resolve_to_scaled(&mut scaled, unscaled, rect, scale);
            }
        }
        ComputeProgram::ResolveToUnscaled => {
            let ResolvePush { scale, .. } = push(dispatch)?;
            let scaled = Plane::of(source(images, dispatch, 1)?, 0);
            let mut unscaled = PlaneMut::new(desc, 0, texels);
            for rect in storage::<BlockRect>(dispatch) {
                resolve_to_unscaled(&mut unscaled, scaled, rect, scale);
            }
        }
        ComputeProgram::BlitVram { masked, .. } => {
            let format = desc.format;
            let mut target = PlaneMut::new(desc, 0, texels);
            for info in storage::<BlitInfo>(dispatch) {
                blit(&mut target, &info, masked, format);
            }
        }
        ComputeProgram::BlitVramCached { scaled, masked } => {
            let push: CachedBlitPush = push(dispatch)?;
            let format = desc.format;
            let scale = if scaled { push.scale } else { 1 };
            blit_cached(&mut PlaneMut::new(desc, 0, texels), &push, scale, masked, format);
        }
        ComputeProgram::CopyToVram { masked } => {
            let push: CopyToVramPush = push(dispatch)?;
            let Some(upload) = upload else {
                return Err(GpuError::InvalidCommand(
                    "copy to VRAM without an upload buffer".to_owned(),
                ));
            };
            copy_to_vram(&mut PlaneMut::new(desc, 0, texels), upload, &push, masked)?;
        }
        ComputeProgram::Mipmap(pass) => scanout::mipmap(images, dispatch, pass, desc, texels)?,
        ComputeProgram::Scanout(program) => {
            scanout::scanout(images, dispatch, program, desc, texels)?
        }
    }
    Ok(())
}

fn resolve_to_scaled(scaled: &mut PlaneMut<'_>, unscaled: Plane<'_>, rect: BlockRect, scale: u32) {
    for y in 0..rect.height * scale {
        for x in 0..rect.width * scale {
            let word = unscaled.at(rect.x + x / scale, rect.y + y / scale);
            scaled.set(
                rect.x * scale + x,
                rect.y * scale + y,
                vram_word_to_rgba8(word),
            );
        }
    }
}

/// Averages the central 2x2 texels of each `scale x scale` footprint.
fn resolve_to_unscaled(
    unscaled: &mut PlaneMut<'_>,
    scaled: Plane<'_>,
    rect: BlockRect,
    scale: u32,
) {
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            let rgba = if scale == 1 {
                scaled.at(x, y)
            } else {
                let cx = x * scale + scale / 2;
                let cy = y * scale + scale / 2;
                average([
                    scaled.at(cx - 1, cy - 1),
                    scaled.at(cx, cy - 1),
                    scaled.at(cx - 1, cy),
                    scaled.at(cx, cy),
                ])
            };
            unscaled.set(x, y, rgba8_to_vram_word(rgba));
        }
    }
}

pub(super) fn average(texels: [u32; 4]) -> u32 {
    (0..4).fold(0u32, |packed, channel| {
        let sum: u32 = texels.iter().map(|texel| (texel >> (8 * channel)) & 0xff).sum();
        packed | ((sum + 2) / 4) << (8 * channel)
    })
}

fn is_masked(value: u32, format: ImageFormat) -> bool {
    match format {
        ImageFormat::Rgba8 => value >> 31 != 0,
        _ => value & 0x8000 != 0,
    }
}

fn with_mask(value: u32, mask_or: u32, format: ImageFormat) -> u32 {
    match format {
        ImageFormat::Rgba8 if mask_or != 0 => value | 0xff00_0000,
        ImageFormat::Rgba8 => value,
        _ => value | mask_or,
    }
}

fn write_masked(
    target: &mut PlaneMut<'_>,
    x: u32,
    y: u32,
    value: u32,
    masked: bool,
    format: ImageFormat,
) {
    if masked && is_masked(target.at(x, y), format) {
        return;
    }
    target.set(x, y, value);
}

fn blit(target: &mut PlaneMut<'_>, info: &BlitInfo, masked: bool, format: ImageFormat) {
    let [width, height] = info.extent;
    let [src_x, src_y] = info.src_offset;
    let [dst_x, dst_y] = info.dst_offset;
    let block: Vec<u32> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| target.at(src_x + x, src_y + y))
        .collect();
    for y in 0..height {
        for x in 0..width {
            let value = with_mask(block[(y * width + x) as usize], info.mask_or, format);
            write_masked(target, dst_x + x, dst_y + y, value, masked, format);
        }
    }
}

/// Row by row in chunks read completely before being written. Rows run away from the
/// destination vertically and chunks away from it horizontally, so no read sees a texel
/// this copy already wrote.
fn blit_cached(
    target: &mut PlaneMut<'_>,
    push: &CachedBlitPush,
    scale: u32,
    masked: bool,
    format: ImageFormat,
) {
    let [src_x, src_y] = push.src_offset.map(|offset| offset * scale);
    let [dst_x, dst_y] = push.dst_offset.map(|offset| offset * scale);
    let [width, height] = push.extent.map(|extent| extent * scale);
    let chunk_width = BLIT_CACHE_WIDTH * scale;
    let chunks = width.div_ceil(chunk_width);
    let mut cache = Vec::with_capacity(chunk_width as usize);
    for row in 0..height {
        let y = if dst_y > src_y { height - 1 - row } else { row };
        for chunk in 0..chunks {
            let chunk = if dst_x > src_x { chunks - 1 - chunk } else { chunk };
            let x = chunk * chunk_width;
            let count = chunk_width.min(width - x);
            cache.clear();
            cache.extend((0..count).map(|i| target.at(src_x + x + i, src_y + y)));
            for (i, value) in cache.iter().enumerate() {
                let value = with_mask(*value, push.mask_or, format);
                write_masked(target, dst_x + x + i as u32, dst_y + y, value, masked, format);
            }
        }
    }
}

fn copy_to_vram(
    target: &mut PlaneMut<'_>,
    upload: &[u32],
    push: &CopyToVramPush,
    masked: bool,
) -> Result<(), GpuError> {
    let [x0, y0, width, height] = push.rect;
    let count = width as usize * height as usize;
    if count == 0 {
        return Ok(());
    }
    let last = push.offset as usize + count - 1;
    if last / 2 >= upload.len() {
        return Err(GpuError::OutOfBounds {
            what: "upload buffer",
        });
    }
    for y in 0..height {
        for x in 0..width {
            let element = push.offset as usize + (y * width + x) as usize;
            let word = (upload[element / 2] >> (16 * (element & 1) as u32)) & 0xffff;
            write_masked(
                target,
                x0 + x,
                y0 + y,
                word | push.mask_or,
                masked,
                ImageFormat::R32Uint,
            );
        }
    }
    Ok(())
}
