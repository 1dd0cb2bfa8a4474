//! Renderer behavior on the headless software device.
//!
//! Rasterization is not executed there, so draws are checked through the queues and
//! counters while compute work (blits, uploads, resolves, scanout) is checked by reading
//! pixels back.

use gpu_runtime::{DeviceLimits, PrimitiveVertex, SoftwareGpu};
use vram_model::{FB_WIDTH, Rect, SemiTransparentMode, TextureMode, TextureWindow, VRAM_PIXELS};

use super::*;
use crate::queue::{
    PrimitiveQueue, ScissorRun, SemiTransparentState, group_by_scissor, semi_transparent_batches,
};
use crate::renderer_init::effective_scaling;

fn renderer(scaling: u32) -> Renderer<SoftwareGpu> {
    Renderer::new(SoftwareGpu::default(), scaling, None).expect("create renderer")
}

fn pattern() -> Vec<u16> {
    (0..VRAM_PIXELS as u32)
        .map(|index| (index.wrapping_mul(2654435761) >> 9) as u16 & 0x7fff)
        .collect()
}

fn read_vram(renderer: &mut Renderer<SoftwareGpu>) -> Vec<u16> {
    let mut vram = vec![0u16; VRAM_PIXELS];
    renderer
        .copy_vram_to_cpu_synchronous(Rect::FULL_VRAM, &mut vram)
        .expect("read back VRAM");
    vram
}

fn index(x: u32, y: u32) -> usize {
    (y * FB_WIDTH + x) as usize
}

fn triangle(x: f32, y: f32) -> [Vertex; 3] {
    [
        Vertex::new(x, y, 0x00ff_0000),
        Vertex::new(x + 20.0, y, 0x0000_ff00),
        Vertex::new(x, y + 20.0, 0x0000_00ff),
    ]
}

fn tagged_triangle(tag: f32) -> [PrimitiveVertex; 3] {
    let vertex = PrimitiveVertex {
        x: tag,
        ..PrimitiveVertex::default()
    };
    [vertex; 3]
}

fn assert_blit_matches_snapshot(scaling: u32, dst: Rect, src: Rect) {
    let mut renderer = renderer(scaling);
    let source = pattern();
    renderer
        .upload_vram(Rect::FULL_VRAM, &source)
        .expect("upload pattern");
    renderer.blit_vram(dst, src).expect("blit");

    let mut expected = source.clone();
    for y in 0..src.height {
        for x in 0..src.width {
            expected[index(dst.x + x, dst.y + y)] = source[index(src.x + x, src.y + y)];
        }
    }
    let vram = read_vram(&mut renderer);
    let mismatches = vram
        .iter()
        .zip(&expected)
        .filter(|(actual, expected)| actual != expected)
        .count();
    assert_eq!(mismatches, 0, "blit {src:?} -> {dst:?} at {scaling}x");
}

#[test]
fn overlapping_blits_match_a_pre_blit_snapshot() {
    let cases = [
        (Rect::new(10, 10, 20, 20), Rect::new(15, 15, 20, 20)),
        (Rect::new(15, 15, 20, 20), Rect::new(10, 10, 20, 20)),
        (Rect::new(15, 10, 20, 20), Rect::new(10, 10, 20, 20)),
        (Rect::new(10, 10, 20, 20), Rect::new(15, 10, 20, 20)),
        (Rect::new(15, 5, 20, 20), Rect::new(10, 10, 20, 20)),
        (Rect::new(104, 40, 300, 8), Rect::new(100, 40, 300, 8)),
        (Rect::new(100, 40, 300, 8), Rect::new(104, 40, 300, 8)),
        (Rect::new(100, 43, 300, 16), Rect::new(102, 40, 300, 16)),
    ];
    for (dst, src) in cases {
        assert!(dst.intersects(&src));
        assert_blit_matches_snapshot(1, dst, src);
    }
    assert_blit_matches_snapshot(2, Rect::new(15, 15, 20, 20), Rect::new(10, 10, 20, 20));
    assert_blit_matches_snapshot(2, Rect::new(200, 8, 160, 4), Rect::new(64, 8, 160, 4));
}

#[test]
fn disjoint_blit_is_batched_until_read() {
    let mut renderer = renderer(1);
    let source = pattern();
    renderer
        .upload_vram(Rect::FULL_VRAM, &source)
        .expect("upload pattern");
    renderer.flush().expect("flush upload");

    let dispatches = renderer.device().stats().dispatches;
    renderer
        .blit_vram(Rect::new(100, 100, 20, 12), Rect::new(300, 200, 20, 12))
        .expect("blit");
    assert_eq!(renderer.device().stats().dispatches, dispatches);
    assert!(!renderer.core.queue.unscaled_blits.is_empty());

    let vram = read_vram(&mut renderer);
    for y in 0..12 {
        for x in 0..20 {
            assert_eq!(vram[index(100 + x, 100 + y)], source[index(300 + x, 200 + y)]);
        }
    }
    assert_eq!(vram[index(99, 100)], source[index(99, 100)]);
}

#[test]
fn forced_mask_bit_is_set_on_upload() {
    let mut renderer = renderer(1);
    renderer.set_force_mask_bit(true);
    let rect = Rect::new(64, 32, 4, 2);
    renderer
        .upload_vram(rect, &[0x001f; 8])
        .expect("upload");

    let vram = read_vram(&mut renderer);
    assert_eq!(vram[index(64, 32)], 0x801f);
    assert_eq!(vram[index(67, 33)], 0x801f);
    assert_eq!(vram[index(68, 33)], 0);
}

#[test]
fn depth_tokens_decrease_within_a_pass() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    for step in 0..5 {
        renderer
            .draw_triangle(&triangle(10.0 + step as f32, 10.0))
            .expect("draw");
    }

    let depths: Vec<f32> = renderer
        .core
        .queue
        .opaque
        .vertices
        .chunks_exact(3)
        .map(|triangle| triangle[0].z)
        .collect();
    assert_eq!(depths.len(), 5);
    assert!(depths.windows(2).all(|pair| pair[0] > pair[1]));
    assert!(depths.iter().all(|z| *z > 0.0 && *z < 1.0));
    assert_eq!(renderer.counters().native_draw_calls, 5);
}

#[test]
fn flushing_the_pass_records_draws_and_resets_depth() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    renderer.draw_triangle(&triangle(0.0, 0.0)).expect("draw");
    renderer.draw_quad(&[
        Vertex::new(40.0, 40.0, 0xff),
        Vertex::new(60.0, 40.0, 0xff),
        Vertex::new(40.0, 60.0, 0xff),
        Vertex::new(60.0, 60.0, 0xff),
    ])
    .expect("draw quad");

    renderer.scanout_vram_to_buffer().expect("read framebuffer");
    let counters = renderer.counters();
    assert_eq!(counters.render_passes, 1);
    assert_eq!(counters.draw_calls, 1);
    assert_eq!(counters.vertices, 9);
    assert_eq!(renderer.device().stats().draws, 1);
    assert_eq!(renderer.core.primitive_index, 0);
    assert!(!renderer.core.queue.has_primitives());
}

#[test]
fn flush_submits_the_open_render_pass() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    renderer.draw_triangle(&triangle(0.0, 0.0)).expect("draw");
    assert!(renderer.atlas().is_inside_render_pass());

    renderer.flush().expect("flush");
    assert!(!renderer.atlas().is_inside_render_pass());
    assert_eq!(renderer.counters().render_passes, 1);
    assert_eq!(renderer.device().stats().draws, 1);
    assert!(!renderer.core.queue.has_primitives());

    renderer.flush().expect("flush again");
    assert_eq!(renderer.counters().render_passes, 1);
}

#[test]
fn empty_draw_area_drops_primitives() {
    let mut renderer = renderer(1);
    renderer.draw_triangle(&triangle(0.0, 0.0)).expect("draw");
    assert_eq!(renderer.counters().native_draw_calls, 0);
    assert!(!renderer.core.queue.has_primitives());
}

#[test]
fn mask_tested_primitives_take_the_ordered_path() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    renderer.set_mask_test(true);
    renderer.draw_triangle(&triangle(0.0, 0.0)).expect("draw");
    renderer.draw_triangle(&triangle(5.0, 0.0)).expect("draw");

    let queue = &renderer.core.queue;
    assert!(queue.opaque.is_empty());
    assert_eq!(queue.semi_transparent.len(), 6);
    assert!(queue.semi_transparent_state.iter().all(|state| state.masked));

    renderer.scanout_vram_to_buffer().expect("read framebuffer");
    let stats = renderer.device().stats();
    assert_eq!(stats.draws, 2);
    assert_eq!(stats.pixel_barriers, 2);
}

#[test]
fn textured_semi_transparent_primitives_also_queue_opaque_texels() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    renderer.set_texture_offset(512, 256);
    renderer.set_texture_mode(TextureMode::Abgr1555);
    renderer.set_semi_transparent(SemiTransparentMode::Add);
    renderer.draw_triangle(&triangle(0.0, 0.0)).expect("draw");

    let queue = &renderer.core.queue;
    assert_eq!(queue.semi_transparent_opaque.vertices.len(), 3);
    assert_eq!(queue.semi_transparent.len(), 3);
    assert!(queue.opaque_textured.is_empty());
    assert_eq!(queue.semi_transparent_opaque.vertices[0].color, 0x80_8080);
}

fn textured_triangle(renderer: &mut Renderer<SoftwareGpu>, x: f32) {
    renderer.set_texture_offset(512, 256);
    renderer.set_texture_mode(TextureMode::Abgr1555);
    renderer.draw_triangle(&triangle(x, 0.0)).expect("draw textured");
    renderer.set_texture_mode(TextureMode::None);
}

fn bind_replacement(renderer: &mut Renderer<SoftwareGpu>) -> gpu_runtime::ImageHandle {
    let texels = vec![0xff00_00ffu32; 64];
    let image = renderer
        .upload_hd_texture(8, 8, &[texels])
        .expect("upload replacement");
    renderer
        .set_hd_texture(Some(HdTextureBinding {
            image,
            vram_rect: Rect::new(512, 256, 4, 4),
            texel_rect: Rect::new(0, 0, 8, 8),
        }))
        .expect("bind replacement");
    image
}

#[test]
fn replacement_levels_land_in_their_image_level() {
    let mut renderer = renderer(1);
    let level0: Vec<u32> = (0..8).map(|texel| 0x1000_0000 + texel).collect();
    let level1 = vec![0xff00_0000, 0x00ff_ffff];
    let image = renderer
        .upload_hd_texture(4, 2, &[level0.clone(), level1.clone()])
        .expect("upload replacement");
    renderer.flush().expect("flush");

    let desc = renderer.device().image_desc(image).expect("replacement desc");
    assert_eq!(desc.levels, 2);
    assert_eq!(renderer.device().image_level(image, 0).expect("level 0"), &level0[..]);
    assert_eq!(renderer.device().image_level(image, 1).expect("level 1"), &level1[..]);

    assert!(matches!(
        renderer.upload_hd_texture(4, 2, &[vec![0; 7]]),
        Err(RendererError::HostBufferTooSmall {
            expected: 8,
            actual: 7
        })
    ));
    assert!(matches!(
        renderer.upload_hd_texture(4, 2, &[]),
        Err(RendererError::EmptyHdTexture)
    ));
}

#[test]
fn textured_draws_sample_the_bound_replacement() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    let image = bind_replacement(&mut renderer);
    assert_eq!(renderer.hd_texture(), Some(image));

    textured_triangle(&mut renderer, 0.0);
    renderer.draw_triangle(&triangle(30.0, 30.0)).expect("draw flat");
    let queue = &renderer.core.queue;
    assert_eq!(queue.opaque_textured.hd, vec![Some(0)]);
    assert_eq!(queue.opaque.hd, vec![None]);
    assert_eq!(queue.hd_textures.len(), 1);
    assert_eq!(queue.hd_textures[0].params.extent, [8, 8]);

    renderer.flush().expect("flush");
    assert_eq!(renderer.counters().draw_calls, 2);
    assert_eq!(renderer.counters().hd_draw_calls, 1);
    assert_eq!(renderer.device().stats().hd_draws, 1);
    assert!(renderer.core.queue.hd_textures.is_empty());

    renderer.set_hd_texture(None).expect("unbind");
    textured_triangle(&mut renderer, 0.0);
    renderer.flush().expect("flush");
    assert_eq!(renderer.counters().hd_draw_calls, 1);
}

#[test]
fn replacement_changes_split_textured_runs() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    textured_triangle(&mut renderer, 0.0);
    bind_replacement(&mut renderer);
    textured_triangle(&mut renderer, 10.0);
    textured_triangle(&mut renderer, 20.0);

    let runs = group_by_scissor(&renderer.core.queue.opaque_textured);
    let summary: Vec<(Option<u32>, usize)> =
        runs.iter().map(|run| (run.hd, run.vertices.len())).collect();
    assert_eq!(summary, vec![(Some(0), 6), (None, 3)]);
}

#[test]
fn retired_replacements_outlive_queued_primitives() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 256, 256));
    let image = bind_replacement(&mut renderer);
    textured_triangle(&mut renderer, 0.0);
    renderer.set_hd_texture(None).expect("unbind");
    renderer.release_hd_texture(image);

    renderer.core.submit().expect("submit without the pass");
    assert!(renderer.device().image_desc(image).is_ok());

    renderer.flush().expect("flush");
    assert!(renderer.device().image_desc(image).is_err());
    assert!(matches!(
        renderer.set_hd_texture(Some(HdTextureBinding {
            image,
            vram_rect: Rect::new(0, 0, 1, 1),
            texel_rect: Rect::new(0, 0, 1, 1),
        })),
        Err(RendererError::Gpu(_))
    ));
}

#[test]
fn bound_replacement_is_kept_until_unbound() {
    let mut renderer = renderer(1);
    let image = bind_replacement(&mut renderer);
    renderer.release_hd_texture(image);
    renderer.flush().expect("flush");
    assert!(renderer.device().image_desc(image).is_ok());

    renderer.set_hd_texture(None).expect("unbind");
    renderer.flush().expect("flush");
    assert!(renderer.device().image_desc(image).is_err());
}

#[test]
fn scissor_runs_are_ordered_latest_first() {
    let mut queue = PrimitiveQueue::default();
    queue.push_triangles(&tagged_triangle(0.0), Some(0), None);
    queue.push_triangles(&tagged_triangle(1.0), Some(1), None);
    queue.push_triangles(&tagged_triangle(2.0), Some(0), None);
    queue.push_triangles(&tagged_triangle(3.0), None, None);

    let runs = group_by_scissor(&queue);
    let summary: Vec<(Option<u32>, Vec<f32>)> = runs
        .iter()
        .map(|ScissorRun { scissor, vertices, .. }| {
            (*scissor, vertices.iter().step_by(3).map(|vertex| vertex.x).collect())
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (Some(1), vec![1.0]),
            (Some(0), vec![2.0, 0.0]),
            (None, vec![3.0]),
        ]
    );
}

#[test]
fn semi_transparent_batches_never_merge_masked_triangles() {
    let blend = |mode, masked| SemiTransparentState {
        scissor: None,
        mode,
        textured: false,
        masked,
        hd: None,
    };
    let add = blend(SemiTransparentMode::Add, false);
    let average = blend(SemiTransparentMode::Average, false);
    let masked = blend(SemiTransparentMode::None, true);
    let states = [add, add, average, masked, masked, add];

    let batches = semi_transparent_batches(&states);
    assert_eq!(
        batches,
        vec![
            (add, 0..2),
            (average, 2..3),
            (masked, 3..4),
            (masked, 4..5),
            (add, 5..6),
        ]
    );
}

#[test]
fn flipped_sprite_gets_one_texel_offset() {
    let quad = [
        Vertex::new(0.0, 0.0, 0).with_uv(16, 0),
        Vertex::new(16.0, 0.0, 0).with_uv(0, 0),
        Vertex::new(0.0, 16.0, 0).with_uv(16, 16),
        Vertex::new(16.0, 16.0, 0).with_uv(0, 16),
    ];
    assert_eq!(
        UvLimits::for_primitive(TextureWindow::OPEN, &quad, true),
        UvLimits {
            min_u: 1,
            min_v: 0,
            max_u: 16,
            max_v: 15,
        }
    );
    // Triangles never get the flip offset.
    assert_eq!(
        UvLimits::for_primitive(TextureWindow::OPEN, &quad[..3], false),
        UvLimits {
            min_u: 0,
            min_v: 0,
            max_u: 15,
            max_v: 15,
        }
    );
}

#[test]
fn masked_texture_window_disables_uv_limits() {
    let window = TextureWindow {
        mask_x: 0x0f,
        mask_y: 0x07,
        or_x: 0x35,
        or_y: 0x10,
    };
    let quad = [Vertex::new(0.0, 0.0, 0).with_uv(3, 4); 4];
    assert_eq!(
        UvLimits::for_primitive(window, &quad, true),
        UvLimits::UNBOUNDED
    );
    assert_eq!(compute_window_rect(window), Rect::new(0x30, 0x10, 16, 8));
    assert_eq!(
        compute_window_rect(TextureWindow::OPEN),
        Rect::new(0, 0, 256, 256)
    );
}

#[test]
fn save_state_round_trips_vram_and_registers() {
    let mut renderer = renderer(2);
    renderer
        .upload_vram(Rect::FULL_VRAM, &pattern())
        .expect("upload pattern");
    renderer.set_draw_rect(Rect::new(0, 0, 320, 240));
    renderer.set_draw_offset(-4, 8);
    renderer.set_texture_offset(128, 256);
    renderer.set_dither(true);
    let saved = renderer.save_vram_state().expect("save");

    let mut restored =
        Renderer::new(SoftwareGpu::default(), 2, Some(&saved)).expect("restore");
    assert_eq!(restored.render_state(), &saved.state);
    assert_eq!(restored.save_vram_state().expect("save again"), saved);
}

#[test]
fn save_state_with_wrong_vram_size_is_rejected() {
    let saved = SaveState {
        vram: vec![0; 16],
        state: RenderState::default(),
    };
    let error = Renderer::new(SoftwareGpu::default(), 1, Some(&saved))
        .err()
        .expect("short VRAM must fail");
    assert!(matches!(
        error,
        RendererError::InvalidSaveState {
            expected: VRAM_PIXELS,
            actual: 16
        }
    ));
}

#[test]
fn large_uploads_split_into_strips() {
    let limits = DeviceLimits {
        max_texel_buffer_elements: 64,
        ..DeviceLimits::default()
    };
    let mut renderer = Renderer::new(SoftwareGpu::new(limits), 1, None).expect("create renderer");
    let rect = Rect::new(32, 16, 16, 20);
    let pixels: Vec<u16> = (0..rect.area() as u16).collect();

    let dispatches = renderer.device().stats().dispatches;
    renderer.upload_vram(rect, &pixels).expect("upload");
    renderer.flush().expect("flush");
    assert_eq!(renderer.device().stats().dispatches - dispatches, 3);

    let vram = read_vram(&mut renderer);
    for y in 0..rect.height {
        for x in 0..rect.width {
            assert_eq!(
                vram[index(rect.x + x, rect.y + y)],
                pixels[(y * rect.width + x) as usize]
            );
        }
    }
}

#[test]
fn upload_handle_is_filled_through_mapping() {
    let mut renderer = renderer(1);
    let rect = Rect::new(8, 8, 2, 2);
    let handle = renderer
        .copy_cpu_to_vram(rect)
        .expect("start upload")
        .expect("non-empty upload");
    assert_eq!(handle.pixels(), 4);
    renderer
        .begin_copy(handle)
        .expect("map")
        .copy_from_slice(&[1, 2, 3, 4]);
    renderer.end_copy(handle).expect("unmap");

    let vram = read_vram(&mut renderer);
    assert_eq!(
        [vram[index(8, 8)], vram[index(9, 8)], vram[index(8, 9)], vram[index(9, 9)]],
        [1, 2, 3, 4]
    );
    assert_eq!(renderer.copy_cpu_to_vram(Rect::new(8, 8, 0, 4)).expect("empty"), None);
}

#[test]
fn wrapping_readback_lands_at_wrapped_positions() {
    let mut renderer = renderer(1);
    let source = pattern();
    renderer
        .upload_vram(Rect::FULL_VRAM, &source)
        .expect("upload pattern");

    let mut vram = vec![0xffff_u16; VRAM_PIXELS];
    renderer
        .copy_vram_to_cpu_synchronous(Rect::new(1020, 508, 8, 8), &mut vram)
        .expect("wrapping readback");
    for (x, y) in [(1020, 508), (1023, 511), (0, 508), (3, 511), (1020, 0), (0, 0), (3, 3)] {
        assert_eq!(vram[index(x, y)], source[index(x, y)], "texel ({x}, {y})");
    }
    assert_eq!(vram[index(4, 0)], 0xffff);
    assert_eq!(vram[index(1019, 508)], 0xffff);
    assert_eq!(vram[index(0, 4)], 0xffff);

    let error = renderer
        .copy_vram_to_cpu_synchronous(Rect::new(0, 0, 4, 4), &mut vram[..16])
        .expect_err("short host buffer");
    assert!(matches!(error, RendererError::HostBufferTooSmall { .. }));
}

#[test]
fn scaling_rounds_down_and_fits_device() {
    assert_eq!(effective_scaling(0, 16384), 1);
    assert_eq!(effective_scaling(3, 16384), 2);
    assert_eq!(effective_scaling(8, 16384), 8);
    assert_eq!(effective_scaling(16, 16384), 16);
    assert_eq!(effective_scaling(16, 8192), 8);
    assert_eq!(effective_scaling(4, 1024), 1);

    let limits = DeviceLimits {
        max_image_dimension_2d: 4096,
        ..DeviceLimits::default()
    };
    let renderer = Renderer::new(SoftwareGpu::new(limits), 8, None).expect("create renderer");
    assert_eq!(renderer.scaling(), 4);
}

#[test]
fn display_rect_follows_timing_registers() {
    let mut renderer = renderer(1);
    assert_eq!(
        renderer.compute_display_rect(),
        DisplayRect {
            x: 3,
            y: 0,
            width: 350,
            height: 240,
        }
    );

    renderer.set_horizontal_overscan_cropping(true);
    let cropped = renderer.compute_display_rect();
    assert_eq!((cropped.x, cropped.width), (-12, 320));

    renderer.set_display_mode(DisplayMode {
        is_pal: true,
        is_480i: true,
        ..DisplayMode::default()
    });
    let pal = renderer.compute_display_rect();
    assert_eq!((pal.y, pal.height), (-8, 576));
}

#[test]
fn clear_candidate_becomes_pass_load_op() {
    let mut renderer = renderer(2);
    renderer
        .clear_rect(Rect::new(0, 0, 64, 64), 0x0000_00ff)
        .expect("clear");
    let image = renderer.scanout_vram_to_buffer().expect("read framebuffer");

    assert_eq!((image.width, image.height), (2048, 1024));
    let at = |x: u32, y: u32| image.pixels[(y * image.width + x) as usize];
    assert_eq!(at(0, 0), 0x0000_00f8);
    assert_eq!(at(127, 127), 0x0000_00f8);
    assert_eq!(at(128, 0), 0);
    let counters = renderer.counters();
    assert_eq!(counters.render_passes, 1);
    assert_eq!(counters.fragment_readback_pixels, 0);
    assert_eq!(counters.fragment_writeout_pixels, 128 * 128);
}

#[test]
fn disabled_display_scans_out_black() {
    let mut renderer = renderer(1);
    let image = renderer.scanout().expect("scanout");
    assert_eq!((image.width, image.height), (64, 64));
    assert!(image.pixels.iter().all(|pixel| *pixel == 0xff00_0000));
}

fn show(renderer: &mut Renderer<SoftwareGpu>, rect: Rect) {
    renderer.set_display_mode(DisplayMode {
        rect,
        ..DisplayMode::default()
    });
    renderer.toggle_display(true);
}

#[test]
fn scanout_places_display_inside_visible_screen() {
    let mut renderer = renderer(1);
    renderer
        .clear_rect(Rect::new(0, 0, 320, 240), 0x0000_00ff)
        .expect("clear");
    show(&mut renderer, Rect::new(0, 0, 320, 240));

    let image = renderer.scanout().expect("scanout");
    assert_eq!((image.width, image.height), (350, 240));
    let at = |x: u32, y: u32| image.pixels[(y * image.width + x) as usize];
    assert_eq!(at(2, 0), 0xff00_0000);
    assert_eq!(at(3, 0), 0xff00_00f8);
    assert_eq!(at(322, 239), 0xff00_00f8);
    assert_eq!(at(323, 0), 0xff00_0000);
}

#[test]
fn repeated_scanout_reuses_the_cached_image() {
    let mut renderer = renderer(1);
    show(&mut renderer, Rect::new(0, 0, 256, 240));
    let first = renderer.scanout_to_texture().expect("scanout");
    renderer.flush().expect("flush");
    let dispatches = renderer.device().stats().dispatches;

    let second = renderer.scanout_to_texture().expect("scanout again");
    renderer.flush().expect("flush");
    assert_eq!(first, second);
    assert_eq!(renderer.device().stats().dispatches, dispatches);

    renderer
        .clear_rect(Rect::new(0, 0, 8, 8), 0)
        .expect("clear");
    renderer.scanout_to_texture().expect("scanout after draw");
    renderer.flush().expect("flush");
    assert!(renderer.device().stats().dispatches > dispatches);
}

#[test]
fn adaptive_smoothing_keeps_flat_areas() {
    let mut renderer = renderer(2);
    renderer
        .clear_rect(Rect::new(0, 0, 64, 64), 0x0000_00ff)
        .expect("clear");
    show(&mut renderer, Rect::new(0, 0, 64, 64));

    let image = renderer.scanout().expect("scanout");
    assert_eq!((image.width, image.height), (700, 480));
    let at = |x: u32, y: u32| image.pixels[(y * image.width + x) as usize];
    assert_eq!(at(6, 0), 0xff00_00f8);
    assert_eq!(at(40, 40), 0xff00_00f8);
    assert_eq!(at(5, 0), 0xff00_0000);
}

#[test]
fn draw_area_readback_requires_display() {
    let mut renderer = renderer(1);
    renderer.set_draw_rect(Rect::new(0, 0, 32, 16));
    assert_eq!(renderer.scanout_to_buffer(true).expect("readback"), None);

    renderer.toggle_display(true);
    let image = renderer
        .scanout_to_buffer(true)
        .expect("readback")
        .expect("draw area");
    assert_eq!((image.width, image.height), (32, 16));
    assert_eq!(image.to_rgba8_bytes().len(), 32 * 16 * 4);
}
