#![cfg(feature = "wgpu-backend")]

use gpu_runtime::{
    BlockRect, BufferUsage, Command, ComputeDispatch, ComputeProgram, GpuDevice, ImageDesc,
    ImageFormat, ResolvePush, WgpuDevice,
};
use vram_model::{FB_HEIGHT, FB_WIDTH, Rect};

fn request_device() -> WgpuDevice {
    pollster::block_on(WgpuDevice::request_async(wgpu::PowerPreference::LowPower))
        .expect("request wgpu device")
}

#[test]
#[ignore = "requires a GPU adapter"]
fn resolve_round_trip_on_device() {
    let mut gpu = request_device();
    let unscaled = gpu
        .create_image(ImageDesc::new(FB_WIDTH, FB_HEIGHT, ImageFormat::R32Uint))
        .expect("create unscaled image");
    let scaled = gpu
        .create_image(ImageDesc::new(FB_WIDTH * 2, FB_HEIGHT * 2, ImageFormat::Rgba8))
        .expect("create scaled image");

    let region = Rect::new(8, 8, 8, 8);
    let words: Vec<u32> = (0..region.area() as u32).map(|index| index * 97 & 0x7fff).collect();
    let upload = gpu
        .create_buffer(region.area() * 4, BufferUsage::Upload)
        .expect("create upload buffer");
    gpu.map_buffer(upload)
        .expect("map upload buffer")
        .copy_from_slice(bytemuck::cast_slice(&words));
    gpu.unmap_buffer(upload).expect("unmap upload buffer");
    gpu.record(Command::CopyBufferToImage {
        buffer: upload,
        image: unscaled,
        level: 0,
        region,
    })
    .expect("record upload");

    let resolve = |program, images: [gpu_runtime::ImageHandle; 2]| ComputeDispatch {
        program,
        images: images.into_iter().collect(),
        buffer: None,
        push: bytemuck::bytes_of(&ResolvePush::new(2)).to_vec(),
        storage: bytemuck::bytes_of(&BlockRect::from(region)).to_vec(),
        groups: [2, 2, 1],
    };
    gpu.record(Command::Dispatch(resolve(
        ComputeProgram::ResolveToScaled,
        [scaled, unscaled],
    )))
    .expect("record resolve to scaled");
    gpu.record(Command::ClearImage {
        image: unscaled,
        value: 0,
    })
    .expect("record clear");
    gpu.record(Command::Dispatch(resolve(
        ComputeProgram::ResolveToUnscaled,
        [unscaled, scaled],
    )))
    .expect("record resolve to unscaled");

    let readback = gpu
        .create_buffer(region.area() * 4, BufferUsage::Readback)
        .expect("create readback buffer");
    gpu.record(Command::CopyImageToBuffer {
        image: unscaled,
        level: 0,
        region,
        buffer: readback,
    })
    .expect("record readback");
    gpu.submit().expect("submit");

    let bytes = gpu.read_buffer(readback).expect("read back");
    let resolved: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
    let console_bits: Vec<u32> = resolved.iter().map(|word| word & 0xffff).collect();
    assert_eq!(console_bits, words);
}
