//! Post-processing programs: the adaptive-smoothing mip chain and display scanout.

use super::SoftwareImage;
use super::compute::{Plane, PlaneMut, average, push, source};
use crate::command::{ComputeDispatch, EnergyPass, ImageDesc, ScanoutProgram};
use crate::error::GpuError;
use crate::program::{DITHER_LUT, MipmapPush, ScanoutPush};
use crate::slots::HandleTable;

const OPAQUE_BLACK: u32 = 0xff00_0000;

fn channel(rgba: u32, index: u32) -> i32 {
    ((rgba >> (8 * index)) & 0xff) as i32
}

fn pack(r: i32, g: i32, b: i32) -> u32 {
    let clamp = |value: i32| value.clamp(0, 255) as u32;
    clamp(r) | clamp(g) << 8 | clamp(b) << 16
}

fn luma(rgba: u32) -> i32 {
    (channel(rgba, 0) * 77 + channel(rgba, 1) * 150 + channel(rgba, 2) * 29) >> 8
}

pub(super) fn mipmap(
    images: &HandleTable<SoftwareImage>,
    dispatch: &ComputeDispatch,
    pass: EnergyPass,
    desc: &ImageDesc,
    texels: &mut [u32],
) -> Result<(), GpuError> {
    let push: MipmapPush = push(dispatch)?;
    match pass {
        EnergyPass::First | EnergyPass::Middle => {
            if push.level == 0 || push.level >= desc.levels {
                return Err(GpuError::OutOfBounds { what: "mip level" });
            }
            downsample_energy(desc, texels, &push, pass == EnergyPass::First);
        }
        EnergyPass::Blur => {
            let scaled = source(images, dispatch, 1)?;
            if push.level >= scaled.desc.levels {
                return Err(GpuError::OutOfBounds { what: "mip level" });
            }
            let energy = Plane::of(scaled, push.level);
            blur_energy(&mut PlaneMut::new(desc, 0, texels), energy, &push);
        }
    }
    Ok(())
}

/// Box-filters level `level - 1` into `level`; alpha holds local luma contrast, or the
/// maximum of the children's contrast after the first level.
fn downsample_energy(desc: &ImageDesc, texels: &mut [u32], push: &MipmapPush, first: bool) {
    let level = push.level;
    let (lower, upper) = texels.split_at_mut(desc.level_offset(level));
    let src = Plane::new(desc, level - 1, lower);
    let (width, height) = desc.level_extent(level);
    let mut dst = PlaneMut::from_level(width, height, &mut upper[..desc.level_texels(level)]);

    let [x, y, w, h] = push.rect;
    let x0 = (x * push.scale) >> level;
    let y0 = (y * push.scale) >> level;
    let x1 = ((x + w) * push.scale).div_ceil(1 << level).min(width);
    let y1 = ((y + h) * push.scale).div_ceil(1 << level).min(height);

    for dy in y0..y1 {
        for dx in x0..x1 {
            let taps = [
                src.clamped(2 * dx, 2 * dy),
                src.clamped(2 * dx + 1, 2 * dy),
                src.clamped(2 * dx, 2 * dy + 1),
                src.clamped(2 * dx + 1, 2 * dy + 1),
            ];
            let lumas = taps.map(luma);
            let contrast = lumas.iter().max().copied().unwrap_or(0)
                - lumas.iter().min().copied().unwrap_or(0);
            let energy = if first {
                contrast
            } else {
                taps.iter()
                    .map(|texel| channel(*texel, 3))
                    .max()
                    .unwrap_or(0)
                    .max(contrast)
            };
            let color = average(taps) & 0x00ff_ffff;
            dst.set(dx, dy, color | (energy.clamp(0, 255) as u32) << 24);
        }
    }
}

/// 3x3 box blur of the energy level, written per native pixel into the bias image.
fn blur_energy(bias: &mut PlaneMut<'_>, energy: Plane<'_>, push: &MipmapPush) {
    let [x, y, w, h] = push.rect;
    for ny in y..y + h {
        for nx in x..x + w {
            let ex = (nx * push.scale) >> push.level;
            let ey = (ny * push.scale) >> push.level;
            let mut sum = 0;
            for oy in 0..3 {
                for ox in 0..3 {
                    let texel = energy.clamped((ex + ox).saturating_sub(1), (ey + oy).saturating_sub(1));
                    sum += channel(texel, 3);
                }
            }
            bias.set(nx, ny, ((sum + 4) / 9) as u32);
        }
    }
}

pub(super) fn scanout(
    images: &HandleTable<SoftwareImage>,
    dispatch: &ComputeDispatch,
    program: ScanoutProgram,
    desc: &ImageDesc,
    texels: &mut [u32],
) -> Result<(), GpuError> {
    let push: ScanoutPush = push(dispatch)?;
    let source_image = source(images, dispatch, 1)?;
    let smooth = match program {
        ScanoutProgram::Adaptive { .. } if source_image.desc.levels > 1 => {
            Some(Plane::of(source_image, 1))
        }
        _ => None,
    };
    let bias = match program {
        ScanoutProgram::Adaptive { .. } => Some(Plane::of(source(images, dispatch, 2)?, 0)),
        _ => None,
    };
    let source_plane = Plane::of(source_image, 0);
    let dither = match program {
        ScanoutProgram::Scaled { dither }
        | ScanoutProgram::Unscaled { dither }
        | ScanoutProgram::Adaptive { dither } => dither,
        ScanoutProgram::Bpp24 { .. } => false,
    };

    let [src_x, src_y, src_w, src_h] = push.src;
    let scale = push.scale.max(1);
    let mut output = PlaneMut::new(desc, 0, texels);
    for oy in 0..output.height {
        for ox in 0..output.width {
            let rx = i64::from(ox) - i64::from(push.dst_offset[0]);
            let ry = i64::from(oy) - i64::from(push.dst_offset[1]);
            if rx < 0
                || ry < 0
                || rx >= i64::from(src_w * scale)
                || ry >= i64::from(src_h * scale)
            {
                output.set(ox, oy, OPAQUE_BLACK);
                continue;
            }
            let (rx, ry) = (rx as u32, ry as u32);
            let sx = src_x * scale + rx;
            let sy = src_y * scale + ry;
            let color = match program {
                ScanoutProgram::Scaled { .. } => source_plane.at(sx, sy),
                ScanoutProgram::Unscaled { .. } => vram_model::vram_word_to_rgba8(
                    source_plane.at(src_x + rx / scale, src_y + ry / scale),
                ),
                ScanoutProgram::Bpp24 { yuv } => {
                    let row = src_y + ry / scale;
                    let column = rx / scale;
                    if yuv {
                        let next = (column + 1).min(src_w - 1);
                        smooth_chroma(
                            fetch_24bpp(source_plane, src_x, row, column),
                            fetch_24bpp(source_plane, src_x, row, next),
                        )
                    } else {
                        fetch_24bpp(source_plane, src_x, row, column)
                    }
                }
                ScanoutProgram::Adaptive { .. } => {
                    let sharp = source_plane.at(sx, sy);
                    match (smooth, bias) {
                        (Some(smooth), Some(bias)) => {
                            let weight = (bias.at(src_x + rx / scale, src_y + ry / scale) & 0xff) as i32;
                            blend(sharp, smooth.at(sx / 2, sy / 2), weight)
                        }
                        _ => sharp,
                    }
                }
            };
            let color = if dither {
                apply_dither(color, ox >> push.dither_shift, oy >> push.dither_shift)
            } else {
                color
            };
            output.set(ox, oy, (color & 0x00ff_ffff) | OPAQUE_BLACK);
        }
    }
    Ok(())
}

/// Reads pixel `column` of a 24-bit row packed into 16-bit words starting at `x`.
fn fetch_24bpp(vram: Plane<'_>, x: u32, y: u32, column: u32) -> u32 {
    let byte = |index: u32| (vram.at(x + index / 2, y) & 0xffff) >> (8 * (index & 1)) & 0xff;
    let base = column * 3;
    byte(base) | byte(base + 1) << 8 | byte(base + 2) << 16
}

/// Keeps this pixel's luma and averages chroma with its right neighbour.
fn smooth_chroma(rgba: u32, neighbour: u32) -> u32 {
    let to_yuv = |rgba: u32| {
        let (r, g, b) = (channel(rgba, 0), channel(rgba, 1), channel(rgba, 2));
        (
            (77 * r + 150 * g + 29 * b) >> 8,
            ((-43 * r - 85 * g + 128 * b) >> 8) + 128,
            ((128 * r - 107 * g - 21 * b) >> 8) + 128,
        )
    };
    let (luma, cb0, cr0) = to_yuv(rgba);
    let (_, cb1, cr1) = to_yuv(neighbour);
    let cb = (cb0 + cb1) / 2 - 128;
    let cr = (cr0 + cr1) / 2 - 128;
    pack(
        luma + ((359 * cr) >> 8),
        luma - ((88 * cb + 183 * cr) >> 8),
        luma + ((454 * cb) >> 8),
    )
}

/// `weight` 255 keeps `sharp`, 0 takes `smooth`.
fn blend(sharp: u32, smooth: u32, weight: i32) -> u32 {
    let mix = |index| {
        (channel(sharp, index) * weight + channel(smooth, index) * (255 - weight) + 127) / 255
    };
    pack(mix(0), mix(1), mix(2))
}

fn apply_dither(rgba: u32, x: u32, y: u32) -> u32 {
    let offset = i32::from(DITHER_LUT[((y & 3) * 4 + (x & 3)) as usize]) - 4;
    let quantize = |index| (channel(rgba, index) + offset).clamp(0, 255) & 0xf8;
    pack(quantize(0), quantize(1), quantize(2))
}
