use super::*;
use proptest::prelude::*;
use vram_model::{
    Domain, FbColor, NUM_BLOCKS_X, NUM_BLOCKS_Y, Ownership, Rect, Stage, StatusFlags, TextureMode,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Hazard(StatusFlags),
    Resolve(Domain, u32, u32),
    Flush(Rect),
    Discard,
    ClearQuad(Rect, FbColor, bool),
    Invariant(bool),
}

#[derive(Debug, Default)]
struct RecordingListener {
    events: Vec<Event>,
}

impl RecordingListener {
    fn resolves(&self) -> Vec<(Domain, u32, u32)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Resolve(domain, x, y) => Some((*domain, *x, *y)),
                _ => None,
            })
            .collect()
    }

    fn flushes(&self) -> Vec<Rect> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Flush(rect) => Some(*rect),
                _ => None,
            })
            .collect()
    }

    fn hazards(&self) -> Vec<StatusFlags> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Hazard(flags) => Some(*flags),
                _ => None,
            })
            .collect()
    }

    fn clears(&self) -> Vec<(Rect, bool)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::ClearQuad(rect, _, candidate) => Some((*rect, *candidate)),
                _ => None,
            })
            .collect()
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

impl HazardListener for RecordingListener {
    fn hazard(&mut self, flags: StatusFlags) {
        self.events.push(Event::Hazard(flags));
    }

    fn resolve(&mut self, target: Domain, x: u32, y: u32) {
        self.events.push(Event::Resolve(target, x, y));
    }

    fn flush_render_pass(&mut self, rect: Rect) {
        self.events.push(Event::Flush(rect));
    }

    fn discard_render_pass(&mut self) {
        self.events.push(Event::Discard);
    }

    fn clear_quad(&mut self, rect: Rect, color: FbColor, clear_candidate: bool) {
        self.events
            .push(Event::ClearQuad(rect, color, clear_candidate));
    }

    fn set_scissored_invariant(&mut self, invariant: bool) {
        self.events.push(Event::Invariant(invariant));
    }
}

fn atlas_with_full_scissor() -> FbAtlas {
    let mut atlas = FbAtlas::new();
    atlas.set_draw_rect(Rect::FULL_VRAM);
    atlas
}

#[test]
fn fresh_grid_prefers_unscaled_without_pending_access() {
    let atlas = FbAtlas::new();
    for (x, y) in [(0, 0), (NUM_BLOCKS_X - 1, NUM_BLOCKS_Y - 1), (37, 11)] {
        let status = atlas.block_status(x, y);
        assert_eq!(status.ownership(), Ownership::UnscaledPrefer);
        assert!(status.access().is_empty());
    }
    assert!(!atlas.is_inside_render_pass());
}

#[test]
fn second_sync_performs_no_resolves() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(0, 0, 32, 16);

    atlas.write_compute(Domain::Unscaled, rect, &mut listener);
    listener.clear();

    atlas.sync_domain(Domain::Scaled, rect, &mut listener);
    assert_eq!(listener.resolves().len(), 8);
    listener.clear();

    atlas.sync_domain(Domain::Scaled, rect, &mut listener);
    assert!(listener.resolves().is_empty());
}

#[test]
fn read_after_write_in_same_domain_needs_no_resolve() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(40, 24, 20, 9);

    atlas.write_compute(Domain::Scaled, rect, &mut listener);
    for (x, y) in rect.blocks().iter() {
        assert_eq!(atlas.block_status(x, y).ownership(), Ownership::ScaledOnly);
    }
    listener.clear();

    atlas.read_compute(Domain::Scaled, rect, &mut listener);
    atlas.read_transfer(Domain::Scaled, rect, &mut listener);
    assert!(listener.resolves().is_empty());
}

#[test]
fn stale_scaled_blocks_resolve_once_each() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(3, 5, 20, 12);

    atlas.write_transfer(Domain::Unscaled, rect, &mut listener);
    listener.clear();
    atlas.sync_domain(Domain::Scaled, rect, &mut listener);

    let mut expected = Vec::new();
    for y in 0..3 {
        for x in 0..3 {
            expected.push((Domain::Scaled, x * 8, y * 8));
        }
    }
    assert_eq!(listener.resolves(), expected);
    for (x, y) in rect.blocks().iter() {
        assert_eq!(atlas.block_status(x, y).ownership(), Ownership::UnscaledPrefer);
    }
    // The resolve had to wait for the transfer write.
    assert!(listener.hazards()[0].contains(StatusFlags::TRANSFER_FB_WRITE));
}

#[test]
fn resolve_to_unscaled_leaves_scaled_preferred() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(64, 64, 8, 8);

    atlas.write_compute(Domain::Scaled, rect, &mut listener);
    listener.clear();
    atlas.read_compute(Domain::Unscaled, rect, &mut listener);

    assert_eq!(listener.resolves(), vec![(Domain::Unscaled, 64, 64)]);
    assert_eq!(atlas.block_status(8, 8).ownership(), Ownership::ScaledPrefer);
}

#[test]
fn draws_inside_open_pass_batch_without_flush() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let first = Rect::new(0, 0, 64, 64);

    atlas.extend_render_pass(first, true, &mut listener);
    for offset in 0..6 {
        let rect = Rect::new(offset * 8, offset * 4, 16, 16);
        atlas.extend_render_pass(rect, true, &mut listener);
    }

    assert!(listener.flushes().is_empty());
    assert!(atlas.is_inside_render_pass());
    assert_eq!(atlas.render_pass_rect(), first);
}

#[test]
fn growing_pass_extends_bounding_box() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();

    atlas.extend_render_pass(Rect::new(0, 0, 16, 16), true, &mut listener);
    atlas.extend_render_pass(Rect::new(32, 8, 16, 16), true, &mut listener);

    assert!(listener.flushes().is_empty());
    assert_eq!(atlas.render_pass_rect(), Rect::new(0, 0, 48, 24));
}

#[test]
fn union_over_sampled_blocks_flushes_once_and_reseeds() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let first = Rect::new(0, 0, 16, 16);
    let sampled = Rect::new(32, 0, 8, 8);
    let requested = Rect::new(48, 0, 8, 8);

    atlas.extend_render_pass(first, true, &mut listener);
    atlas.read_fragment(Domain::Scaled, sampled, &mut listener);
    assert!(listener.flushes().is_empty());

    atlas.extend_render_pass(requested, true, &mut listener);

    assert_eq!(listener.flushes(), vec![Rect::new(0, 0, 56, 16)]);
    assert!(atlas.is_inside_render_pass());
    assert_eq!(atlas.render_pass_rect(), requested);
}

#[test]
fn scissor_clips_pass_and_reports_variance() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    atlas.set_draw_rect(Rect::new(0, 0, 320, 240));

    atlas.extend_render_pass(Rect::new(300, 200, 64, 64), true, &mut listener);
    assert_eq!(listener.events[0], Event::Invariant(false));
    assert_eq!(atlas.render_pass_rect(), Rect::new(300, 200, 20, 40));

    listener.clear();
    atlas.extend_render_pass(Rect::new(400, 0, 8, 8), true, &mut listener);
    assert_eq!(listener.events, vec![Event::Invariant(false)]);
    assert_eq!(atlas.render_pass_rect(), Rect::new(300, 200, 20, 40));
}

#[test]
fn block_lookup_wraps_around_vram() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();

    atlas.write_compute(Domain::Scaled, Rect::new(0, 0, 8, 8), &mut listener);
    assert_eq!(atlas.block_status(NUM_BLOCKS_X, 0), atlas.block_status(0, 0));
    assert_eq!(atlas.block_status(0, NUM_BLOCKS_Y), atlas.block_status(0, 0));
    assert_eq!(
        atlas.block_status(NUM_BLOCKS_X, 0).ownership(),
        Ownership::ScaledOnly
    );
}

#[test]
fn rect_crossing_right_edge_touches_first_column() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(1016, 0, 16, 8);

    atlas.write_compute(Domain::Unscaled, rect, &mut listener);
    assert_eq!(atlas.block_status(0, 0).ownership(), Ownership::UnscaledOnly);
    listener.clear();

    atlas.sync_domain(Domain::Scaled, rect, &mut listener);
    assert_eq!(
        listener.resolves(),
        vec![(Domain::Scaled, 1016, 0), (Domain::Scaled, 0, 0)]
    );
}

#[test]
fn texture_loaded_ignores_outer_block_ring() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();

    atlas.load_image(Rect::new(8, 8, 8, 8), &mut listener);
    // One block and two blocks per axis leave no interior to look at.
    assert!(!atlas.texture_loaded(Rect::new(8, 8, 8, 8)));
    assert!(!atlas.texture_loaded(Rect::new(8, 8, 16, 16)));
    assert!(!atlas.texture_loaded(Rect::new(0, 0, 16, 24)));
    assert!(atlas.texture_loaded(Rect::new(0, 0, 24, 24)));

    atlas.load_image(Rect::new(0, 0, 64, 64), &mut listener);
    assert!(atlas.texture_loaded(Rect::new(0, 0, 64, 64)));
    assert!(atlas.texture_loaded(Rect::new(48, 48, 24, 24)));
    // Only the blocks at x = 64 and y = 64 remain after dropping the ring.
    assert!(!atlas.texture_loaded(Rect::new(56, 56, 24, 24)));
    assert_eq!(
        atlas.block_status(0, 0).ownership(),
        Ownership::UnscaledOnly
    );
}

#[test]
fn blit_carries_texture_loaded_marker() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let src = Rect::new(0, 0, 24, 24);
    let dst = Rect::new(128, 0, 24, 24);
    let unloaded = Rect::new(256, 256, 24, 24);

    atlas.load_image(src, &mut listener);
    let domain = atlas.blit_vram(dst, src, &mut listener);
    assert_eq!(domain, Domain::Unscaled);
    assert!(atlas.texture_loaded(dst));

    atlas.blit_vram(dst, unloaded, &mut listener);
    assert!(!atlas.texture_loaded(dst));
}

#[test]
fn blit_from_scaled_only_source_stays_scaled() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let src = Rect::new(0, 0, 16, 16);
    let dst = Rect::new(0, 64, 16, 16);

    atlas.write_compute(Domain::Scaled, src, &mut listener);
    atlas.write_compute(Domain::Scaled, dst, &mut listener);
    listener.clear();

    assert_eq!(atlas.blit_vram(dst, src, &mut listener), Domain::Scaled);
    assert!(listener.resolves().is_empty());
    assert_eq!(atlas.block_status(0, 8).ownership(), Ownership::ScaledOnly);
}

#[test]
fn clear_matching_pass_is_candidate() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(0, 0, 320, 240);

    atlas.clear_rect(rect, 0x00ff_00ff, &mut listener);
    assert_eq!(listener.clears(), vec![(rect, true)]);

    atlas.extend_render_pass(Rect::new(0, 0, 400, 240), true, &mut listener);
    atlas.clear_rect(Rect::new(0, 0, 16, 16), 0, &mut listener);
    assert_eq!(listener.clears()[1], (Rect::new(0, 0, 16, 16), false));
}

#[test]
fn clear_covering_grown_pass_discards_queue() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let big = Rect::new(0, 0, 256, 256);

    atlas.extend_render_pass(Rect::new(8, 8, 16, 16), true, &mut listener);
    listener.clear();
    atlas.clear_rect(big, 0, &mut listener);

    assert!(listener.events.contains(&Event::Discard));
    assert!(listener.flushes().is_empty());
    assert_eq!(listener.clears(), vec![(big, true)]);
    assert_eq!(atlas.render_pass_rect(), big);
}

#[test]
fn clear_away_from_pass_flushes_it() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let first = Rect::new(0, 0, 64, 64);

    atlas.extend_render_pass(first, true, &mut listener);
    atlas.clear_rect(Rect::new(512, 256, 64, 64), 0, &mut listener);

    assert_eq!(listener.flushes(), vec![first]);
    assert_eq!(atlas.render_pass_rect(), Rect::new(512, 256, 64, 64));
}

#[test]
fn flush_drops_texture_read_and_loaded_markers() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let target = Rect::new(0, 0, 32, 32);

    atlas.load_image(target, &mut listener);
    assert!(atlas.texture_loaded(target));
    atlas.set_texture_mode(TextureMode::Abgr1555);
    atlas.set_texture_window(Rect::new(0, 0, 16, 16));
    atlas.set_texture_offset(512, 0);
    atlas.write_fragment(target, &mut listener);
    assert!(atlas.block_status(64, 0).texture_read());

    atlas.flush_render_pass(&mut listener);
    assert!(!atlas.is_inside_render_pass());
    assert!(!atlas.block_status(64, 0).texture_read());
    assert!(!atlas.texture_loaded(target));
    assert_eq!(atlas.block_status(0, 0).ownership(), Ownership::ScaledOnly);
}

#[test]
fn write_to_sampled_texture_flushes_pass() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();

    atlas.set_texture_mode(TextureMode::Abgr1555);
    atlas.set_texture_window(Rect::new(0, 0, 16, 16));
    atlas.set_texture_offset(512, 0);
    atlas.write_fragment(Rect::new(0, 0, 32, 32), &mut listener);
    listener.clear();

    atlas.write_compute(Domain::Unscaled, Rect::new(512, 0, 8, 8), &mut listener);

    assert_eq!(listener.flushes(), vec![Rect::new(0, 0, 32, 32)]);
    assert!(
        listener
            .hazards()
            .iter()
            .any(|flags| flags.contains(StatusFlags::FRAGMENT_FB_READ))
    );
}

#[test]
fn textured_draw_sampling_open_pass_flushes_first() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let first = Rect::new(0, 0, 64, 64);

    atlas.extend_render_pass(first, true, &mut listener);
    atlas.set_texture_mode(TextureMode::Palette4bpp);
    atlas.set_texture_window(Rect::new(0, 0, 64, 256));
    atlas.set_texture_offset(640, 0);
    atlas.set_palette_offset(0, 32);
    atlas.write_fragment(Rect::new(200, 200, 8, 8), &mut listener);

    assert_eq!(listener.flushes(), vec![first]);
    assert_eq!(atlas.render_pass_rect(), Rect::new(200, 200, 8, 8));
    assert!(atlas.block_status(0, 4).texture_read());
    assert!(atlas.block_status(80, 0).texture_read());
}

#[test]
fn barrier_retires_flags_across_whole_grid() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();

    atlas.write_compute(Domain::Unscaled, Rect::new(0, 0, 8, 8), &mut listener);
    atlas.read_compute(Domain::Unscaled, Rect::new(512, 256, 8, 8), &mut listener);
    atlas.pipeline_barrier(StatusFlags::COMPUTE_FB_WRITE, &mut listener);

    assert_eq!(listener.hazards(), vec![StatusFlags::COMPUTE_FB_WRITE]);
    assert!(atlas.block_status(0, 0).access().is_empty());
    assert!(atlas.block_status(64, 32).access().is_empty());
    assert_eq!(atlas.block_status(0, 0).ownership(), Ownership::UnscaledOnly);
}

#[test]
fn write_after_write_waits_for_previous_writer() {
    let mut atlas = FbAtlas::new();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(0, 0, 16, 16);

    atlas.write_compute(Domain::Unscaled, rect, &mut listener);
    assert!(listener.hazards().is_empty());
    atlas.write_transfer(Domain::Unscaled, rect, &mut listener);
    assert_eq!(listener.hazards(), vec![StatusFlags::COMPUTE_FB_WRITE]);
}

#[test]
fn suitable_domain_follows_ownership_and_pass() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(0, 0, 16, 16);

    assert_eq!(atlas.find_suitable_domain(rect), Domain::Unscaled);
    atlas.write_compute(Domain::Scaled, rect, &mut listener);
    assert_eq!(atlas.find_suitable_domain(rect), Domain::Scaled);

    atlas.extend_render_pass(Rect::new(256, 0, 16, 16), true, &mut listener);
    assert_eq!(
        atlas.find_suitable_domain(Rect::new(260, 4, 1, 1)),
        Domain::Scaled
    );
}

#[test]
fn set_texture_mode_returns_previous_mode() {
    let mut atlas = FbAtlas::new();
    assert_eq!(atlas.set_texture_mode(TextureMode::Palette8bpp), TextureMode::None);
    assert_eq!(atlas.set_texture_mode(TextureMode::None), TextureMode::Palette8bpp);
}

#[test]
fn explicit_fragment_write_over_open_pass_flushes_without_barrier() {
    let mut atlas = atlas_with_full_scissor();
    let mut listener = RecordingListener::default();
    let rect = Rect::new(0, 0, 32, 32);

    atlas.extend_render_pass(rect, true, &mut listener);
    atlas.write_domain(Domain::Scaled, Stage::Fragment, rect, &mut listener);
    // The pass overlaps, so the explicit write flushes it first.
    assert_eq!(listener.flushes(), vec![rect]);
    assert!(listener.hazards().is_empty());
}

fn rect_strategy() -> impl Strategy<Value = Rect> {
    (0u32..1024, 0u32..512, 1u32..200, 1u32..200)
        .prop_map(|(x, y, width, height)| Rect::new(x, y, width, height))
}

fn domain_strategy() -> impl Strategy<Value = Domain> {
    prop_oneof![Just(Domain::Unscaled), Just(Domain::Scaled)]
}

proptest! {
    #[test]
    fn sync_is_idempotent(
        writes in proptest::collection::vec((domain_strategy(), rect_strategy()), 0..6),
        domain in domain_strategy(),
        rect in rect_strategy(),
    ) {
        let mut atlas = FbAtlas::new();
        let mut listener = RecordingListener::default();
        for (write_domain, write_rect) in writes {
            atlas.write_compute(write_domain, write_rect, &mut listener);
        }

        atlas.sync_domain(domain, rect, &mut listener);
        listener.clear();
        atlas.sync_domain(domain, rect, &mut listener);
        prop_assert!(listener.resolves().is_empty());
    }

    #[test]
    fn write_makes_domain_sole_owner(domain in domain_strategy(), rect in rect_strategy()) {
        let mut atlas = FbAtlas::new();
        let mut listener = RecordingListener::default();
        atlas.write_compute(domain, rect, &mut listener);
        listener.clear();

        atlas.read_compute(domain, rect, &mut listener);
        prop_assert!(listener.resolves().is_empty());
        for (x, y) in rect.blocks().iter() {
            prop_assert_eq!(atlas.block_status(x, y).ownership(), Ownership::only(domain));
        }
    }

    #[test]
    fn cross_domain_sync_resolves_every_block(rect in rect_strategy()) {
        let mut atlas = FbAtlas::new();
        let mut listener = RecordingListener::default();
        atlas.write_compute(Domain::Unscaled, rect, &mut listener);
        listener.clear();

        atlas.sync_domain(Domain::Scaled, rect, &mut listener);
        let blocks = rect.blocks();
        let expected = (blocks.width() * blocks.height()) as usize;
        prop_assert_eq!(listener.resolves().len(), expected);
    }

    #[test]
    fn block_lookup_is_toroidal(x in 0u32..NUM_BLOCKS_X, y in 0u32..NUM_BLOCKS_Y) {
        let mut atlas = FbAtlas::new();
        let mut listener = RecordingListener::default();
        atlas.write_compute(Domain::Scaled, Rect::new(x * 8, y * 8, 8, 8), &mut listener);
        prop_assert_eq!(
            atlas.block_status(x + NUM_BLOCKS_X, y + NUM_BLOCKS_Y),
            atlas.block_status(x, y)
        );
        prop_assert_eq!(atlas.block_status(x, y).ownership(), Ownership::ScaledOnly);
    }
}
