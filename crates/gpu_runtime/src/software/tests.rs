use smallvec::smallvec;
use vram_model::{FB_HEIGHT, FB_WIDTH, Rect, SemiTransparentMode, vram_word_to_rgba8};

use super::*;
use crate::command::{
    ComputeDispatch, ComputeProgram, DrawCall, HdSampling, ImageFormat, RasterProgram,
    RenderPassDesc, ScanoutProgram,
};
use crate::program::{
    BlockRect, CachedBlitPush, CopyToVramPush, HdTexturePush, PrimitiveVertex, ResolvePush,
    ScanoutPush,
};

fn vram_image(gpu: &mut SoftwareGpu) -> ImageHandle {
    gpu.create_image(ImageDesc::new(FB_WIDTH, FB_HEIGHT, ImageFormat::R32Uint))
        .expect("create unscaled image")
}

fn upload(gpu: &mut SoftwareGpu, bytes: &[u8]) -> BufferHandle {
    let buffer = gpu
        .create_buffer(bytes.len() as u64, BufferUsage::Upload)
        .expect("create upload buffer");
    gpu.map_buffer(buffer)
        .expect("map upload buffer")
        .copy_from_slice(bytes);
    gpu.unmap_buffer(buffer).expect("unmap upload buffer");
    buffer
}

fn fill_with_pattern(gpu: &mut SoftwareGpu, image: ImageHandle) -> Vec<u32> {
    let pattern: Vec<u32> = (0..FB_WIDTH * FB_HEIGHT)
        .map(|index| index.wrapping_mul(2654435761) & 0x7fff)
        .collect();
    let buffer = upload(gpu, bytemuck::cast_slice(&pattern));
    gpu.record(Command::CopyBufferToImage {
        buffer,
        image,
        level: 0,
        region: Rect::FULL_VRAM,
    })
    .expect("record upload");
    pattern
}

fn dispatch(program: ComputeProgram, images: &[ImageHandle], push: &[u8]) -> ComputeDispatch {
    ComputeDispatch {
        program,
        images: images.iter().copied().collect(),
        buffer: None,
        push: push.to_vec(),
        storage: Vec::new(),
        groups: [1, 1, 1],
    }
}

#[test]
fn resolve_round_trip_keeps_console_bits() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    let scaled = gpu
        .create_image(ImageDesc::new(FB_WIDTH * 2, FB_HEIGHT * 2, ImageFormat::Rgba8))
        .expect("create scaled image");
    let pattern = fill_with_pattern(&mut gpu, unscaled);

    let block = BlockRect::from(Rect::new(16, 8, 8, 8));
    let mut to_scaled = dispatch(
        ComputeProgram::ResolveToScaled,
        &[scaled, unscaled],
        bytemuck::bytes_of(&ResolvePush::new(2)),
    );
    to_scaled.storage = bytemuck::bytes_of(&block).to_vec();
    let mut to_unscaled = to_scaled.clone();
    to_unscaled.program = ComputeProgram::ResolveToUnscaled;
    to_unscaled.images = smallvec![unscaled, scaled];

    gpu.record(Command::Dispatch(to_scaled)).expect("record resolve");
    gpu.record(Command::ClearImage {
        image: unscaled,
        value: 0,
    })
    .expect("record clear");
    gpu.record(Command::Dispatch(to_unscaled)).expect("record resolve back");
    gpu.submit().expect("submit");

    let scaled_texels = gpu.image_level(scaled, 0).expect("scaled texels");
    let expected = vram_word_to_rgba8(pattern[(8 * FB_WIDTH + 16) as usize]);
    assert_eq!(scaled_texels[(16 * FB_WIDTH * 2 + 32) as usize], expected);
    assert_eq!(scaled_texels[(17 * FB_WIDTH * 2 + 33) as usize], expected);

    let texels = gpu.image_level(unscaled, 0).expect("unscaled texels");
    for y in 8..16 {
        for x in 16..24 {
            let index = (y * FB_WIDTH + x) as usize;
            assert_eq!(texels[index] & 0xffff, pattern[index], "texel {x},{y}");
        }
    }
    assert_eq!(texels[0], 0, "outside the block stays cleared");
}

#[test]
fn cached_blit_matches_copy_from_snapshot() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    let snapshot = fill_with_pattern(&mut gpu, unscaled);

    let push = CachedBlitPush {
        src_offset: [15, 15],
        dst_offset: [10, 10],
        extent: [20, 20],
        scale: 1,
        mask_or: 0,
    };
    gpu.record(Command::Dispatch(dispatch(
        ComputeProgram::BlitVramCached {
            scaled: false,
            masked: false,
        },
        &[unscaled],
        bytemuck::bytes_of(&push),
    )))
    .expect("record blit");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(unscaled, 0).expect("texels");
    for y in 0..20 {
        for x in 0..20 {
            let dst = ((10 + y) * FB_WIDTH + 10 + x) as usize;
            let src = ((15 + y) * FB_WIDTH + 15 + x) as usize;
            assert_eq!(texels[dst], snapshot[src], "texel {x},{y}");
        }
    }
}

#[test]
fn cached_blit_moving_down_keeps_source_rows() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    let snapshot = fill_with_pattern(&mut gpu, unscaled);

    let push = CachedBlitPush {
        src_offset: [0, 0],
        dst_offset: [1, 1],
        extent: [4, 3],
        scale: 1,
        mask_or: 0,
    };
    gpu.record(Command::Dispatch(dispatch(
        ComputeProgram::BlitVramCached {
            scaled: false,
            masked: false,
        },
        &[unscaled],
        bytemuck::bytes_of(&push),
    )))
    .expect("record blit");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(unscaled, 0).expect("texels");
    for y in 0..3 {
        for x in 0..4 {
            let dst = ((y + 1) * FB_WIDTH + x + 1) as usize;
            assert_eq!(texels[dst], snapshot[(y * FB_WIDTH + x) as usize], "texel {x},{y}");
        }
    }
}

#[test]
fn masked_upload_skips_protected_texels() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    gpu.record(Command::ClearImage {
        image: unscaled,
        value: 0x8000,
    })
    .expect("record clear");
    gpu.submit().expect("submit clear");

    let pixels: [u16; 4] = [0x1111, 0x2222, 0x3333, 0x4444];
    let buffer = upload(&mut gpu, bytemuck::cast_slice(&pixels));
    let mut copy = dispatch(
        ComputeProgram::CopyToVram { masked: true },
        &[unscaled],
        bytemuck::bytes_of(&CopyToVramPush::new(Rect::new(0, 0, 2, 2), 0, 0)),
    );
    copy.buffer = Some(buffer);
    gpu.record(Command::Dispatch(copy.clone())).expect("record masked copy");
    copy.program = ComputeProgram::CopyToVram { masked: false };
    copy.push = bytemuck::bytes_of(&CopyToVramPush::new(Rect::new(4, 0, 2, 2), 0, 0x8000)).to_vec();
    gpu.record(Command::Dispatch(copy)).expect("record plain copy");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(unscaled, 0).expect("texels");
    assert_eq!(&texels[0..2], &[0x8000, 0x8000]);
    assert_eq!(&texels[4..6], &[0x9111, 0xa222]);
    let row = FB_WIDTH as usize;
    assert_eq!(&texels[row + 4..row + 6], &[0xb333, 0xc444]);
}

#[test]
fn bpp24_scanout_unpacks_byte_stream() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    let words: [u16; 3] = [0x2211, 0x4433, 0x6655];
    let staged: Vec<u32> = words.iter().map(|word| u32::from(*word)).collect();
    let buffer = upload(&mut gpu, bytemuck::cast_slice(&staged));
    gpu.record(Command::CopyBufferToImage {
        buffer,
        image: unscaled,
        level: 0,
        region: Rect::new(0, 0, 3, 1),
    })
    .expect("record upload");

    let output = gpu
        .create_image(ImageDesc::new(2, 1, ImageFormat::Rgba8))
        .expect("create output");
    gpu.record(Command::Dispatch(dispatch(
        ComputeProgram::Scanout(ScanoutProgram::Bpp24 { yuv: false }),
        &[output, unscaled],
        bytemuck::bytes_of(&ScanoutPush::new(Rect::new(0, 0, 2, 1), [0, 0], [2, 1], 1, 0)),
    )))
    .expect("record scanout");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(output, 0).expect("output texels");
    assert_eq!(texels, &[0xff33_2211, 0xff66_5544]);
}

#[test]
fn scanout_outside_source_is_opaque_black() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    gpu.record(Command::ClearImage {
        image: unscaled,
        value: 0x7fff,
    })
    .expect("record clear");
    let output = gpu
        .create_image(ImageDesc::new(4, 1, ImageFormat::Rgba8))
        .expect("create output");
    gpu.record(Command::Dispatch(dispatch(
        ComputeProgram::Scanout(ScanoutProgram::Unscaled { dither: false }),
        &[output, unscaled],
        bytemuck::bytes_of(&ScanoutPush::new(Rect::new(0, 0, 2, 1), [1, 0], [4, 1], 1, 0)),
    )))
    .expect("record scanout");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(output, 0).expect("output texels");
    assert_eq!(texels, &[0xff00_0000, 0xfff8_f8f8, 0xfff8_f8f8, 0xff00_0000]);
}

#[test]
fn render_pass_clear_touches_only_its_area() {
    let mut gpu = SoftwareGpu::default();
    let vram = vram_image(&mut gpu);
    let target = gpu
        .create_image(ImageDesc::new(16, 16, ImageFormat::Rgba8))
        .expect("create target");
    gpu.record(Command::BeginRenderPass(RenderPassDesc {
        target,
        vram,
        area: Rect::new(4, 4, 2, 2),
        load: LoadOp::Clear {
            color: [1.0, 0.0, 0.0, 0.0],
            depth: 0.5,
        },
    }))
    .expect("begin pass");
    gpu.record(Command::EndRenderPass).expect("end pass");
    gpu.submit().expect("submit");

    let texels = gpu.image_level(target, 0).expect("target texels");
    assert_eq!(texels[4 * 16 + 4], 0x0000_00ff);
    assert_eq!(texels[5 * 16 + 5], 0x0000_00ff);
    assert_eq!(texels[3 * 16 + 4], 0);
    assert_eq!(gpu.stats().render_passes, 1);
}

#[test]
fn draw_outside_render_pass_is_rejected() {
    let mut gpu = SoftwareGpu::default();
    let error = gpu
        .record(Command::Draw(DrawCall {
            program: RasterProgram::Flat,
            scissor: Rect::new(0, 0, 1, 1),
            vertices: Vec::new(),
            hd: None,
        }))
        .expect_err("draw without pass");
    assert!(matches!(error, GpuError::InvalidCommand(_)));
}

fn open_pass(gpu: &mut SoftwareGpu) {
    let vram = vram_image(gpu);
    let target = gpu
        .create_image(ImageDesc::new(16, 16, ImageFormat::Rgba8))
        .expect("create target");
    gpu.record(Command::BeginRenderPass(RenderPassDesc {
        target,
        vram,
        area: Rect::new(0, 0, 16, 16),
        load: LoadOp::Load,
    }))
    .expect("begin pass");
}

fn hd_draw(program: RasterProgram, image: ImageHandle, levels: u32) -> Command {
    Command::Draw(DrawCall {
        program,
        scissor: Rect::new(0, 0, 16, 16),
        vertices: vec![PrimitiveVertex::default(); 3],
        hd: Some(HdSampling {
            image,
            params: HdTexturePush::new(Rect::new(0, 0, 4, 4), Rect::new(0, 0, 8, 8), [8, 8], levels),
        }),
    })
}

#[test]
fn replacement_draws_are_counted() {
    let mut gpu = SoftwareGpu::default();
    open_pass(&mut gpu);
    let image = gpu
        .create_image(ImageDesc::new(8, 8, ImageFormat::Rgba8).with_levels(2))
        .expect("create replacement");
    gpu.record(hd_draw(RasterProgram::Textured, image, 2))
        .expect("textured replacement draw");
    gpu.record(hd_draw(
        RasterProgram::Feedback {
            textured: true,
            mode: SemiTransparentMode::Average,
        },
        image,
        1,
    ))
    .expect("feedback replacement draw");
    gpu.record(Command::EndRenderPass).expect("end pass");
    gpu.submit().expect("submit");
    assert_eq!(gpu.stats().draws, 2);
    assert_eq!(gpu.stats().hd_draws, 2);
}

#[test]
fn replacement_draws_need_a_textured_rgba_image() {
    let mut gpu = SoftwareGpu::default();
    open_pass(&mut gpu);
    let image = gpu
        .create_image(ImageDesc::new(8, 8, ImageFormat::Rgba8))
        .expect("create replacement");
    let words = gpu
        .create_image(ImageDesc::new(8, 8, ImageFormat::R32Uint))
        .expect("create word image");

    for (command, what) in [
        (hd_draw(RasterProgram::Flat, image, 1), "flat"),
        (hd_draw(RasterProgram::Textured, words, 1), "word image"),
        (hd_draw(RasterProgram::Textured, image, 2), "missing level"),
    ] {
        let error = gpu.record(command).expect_err(what);
        assert!(matches!(error, GpuError::InvalidCommand(_)), "{what}");
    }
    gpu.release_image(image).expect("release");
    let error = gpu
        .record(hd_draw(RasterProgram::Textured, image, 1))
        .expect_err("released image");
    assert!(matches!(error, GpuError::StaleHandle { .. }));
    assert_eq!(gpu.stats().hd_draws, 0);
}

#[test]
fn released_image_handle_goes_stale() {
    let mut gpu = SoftwareGpu::default();
    let image = vram_image(&mut gpu);
    gpu.release_image(image).expect("release");
    assert!(matches!(
        gpu.image_desc(image),
        Err(GpuError::StaleHandle { kind: "image", .. })
    ));
    assert_eq!(gpu.live_images(), 0);
}

#[test]
fn buffer_mapping_is_exclusive() {
    let mut gpu = SoftwareGpu::default();
    let buffer = gpu
        .create_buffer(16, BufferUsage::Upload)
        .expect("create buffer");
    gpu.map_buffer(buffer).expect("first map");
    assert!(matches!(gpu.map_buffer(buffer), Err(GpuError::AlreadyMapped)));
    gpu.unmap_buffer(buffer).expect("unmap");
    assert!(matches!(gpu.unmap_buffer(buffer), Err(GpuError::NotMapped)));
    assert!(gpu.read_buffer(buffer).is_err());
}

#[test]
fn readback_copies_region_rows() {
    let mut gpu = SoftwareGpu::default();
    let unscaled = vram_image(&mut gpu);
    let pattern = fill_with_pattern(&mut gpu, unscaled);
    let readback = gpu
        .create_buffer(4 * 6, BufferUsage::Readback)
        .expect("create readback");
    gpu.record(Command::CopyImageToBuffer {
        image: unscaled,
        level: 0,
        region: Rect::new(1020, 2, 3, 2),
        buffer: readback,
    })
    .expect("record copy");
    gpu.submit().expect("submit");

    let bytes = gpu.read_buffer(readback).expect("read back");
    let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
    let expected: Vec<u32> = [2u32, 3]
        .iter()
        .flat_map(|y| (1020..1023).map(move |x| (y * FB_WIDTH + x) as usize))
        .map(|index| pattern[index])
        .collect();
    assert_eq!(words, expected);
}

#[test]
fn dispatch_inside_render_pass_is_rejected() {
    let mut gpu = SoftwareGpu::default();
    let vram = vram_image(&mut gpu);
    let target = gpu
        .create_image(ImageDesc::new(16, 16, ImageFormat::Rgba8))
        .expect("create target");
    gpu.record(Command::BeginRenderPass(RenderPassDesc {
        target,
        vram,
        area: Rect::new(0, 0, 16, 16),
        load: LoadOp::Load,
    }))
    .expect("begin pass");
    let error = gpu
        .record(Command::ClearImage {
            image: vram,
            value: 0,
        })
        .expect_err("clear inside pass");
    assert!(matches!(error, GpuError::InvalidCommand(_)));
    assert!(gpu.submit().is_err());
}

proptest::proptest! {
    #[test]
    fn upload_wraps_around_vram_edges(
        x in 0u32..FB_WIDTH,
        y in 0u32..FB_HEIGHT,
        width in 1u32..12,
        height in 1u32..6,
    ) {
        let mut gpu = SoftwareGpu::default();
        let unscaled = vram_image(&mut gpu);
        let pixels: Vec<u16> = (0..width * height).map(|index| (index as u16) | 1).collect();
        let buffer = upload(&mut gpu, bytemuck::cast_slice(&pixels));
        let mut copy = dispatch(
            ComputeProgram::CopyToVram { masked: false },
            &[unscaled],
            bytemuck::bytes_of(&CopyToVramPush::new(Rect::new(x, y, width, height), 0, 0)),
        );
        copy.buffer = Some(buffer);
        gpu.record(Command::Dispatch(copy)).expect("record copy");
        gpu.submit().expect("submit");

        let texels = gpu.image_level(unscaled, 0).expect("texels");
        for row in 0..height {
            for column in 0..width {
                let vx = (x + column) % FB_WIDTH;
                let vy = (y + row) % FB_HEIGHT;
                let expected = u32::from(pixels[(row * width + column) as usize]);
                proptest::prop_assert_eq!(texels[(vy * FB_WIDTH + vx) as usize], expected);
            }
        }
    }
}
