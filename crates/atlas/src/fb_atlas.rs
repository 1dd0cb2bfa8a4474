use vram_model::{
    BlockRange, Domain, FbColor, NUM_BLOCKS_X, NUM_BLOCKS_Y, Ownership, Rect, Stage, StatusFlags, TextureMode,
};

use crate::listener::HazardListener;
use crate::render_pass::{RenderPassPhase, RenderPassState};

const GRID_CELLS: usize = (NUM_BLOCKS_X * NUM_BLOCKS_Y) as usize;

/// Hazard tracker for the two VRAM domains.
///
/// Every operation takes the listener explicitly; the atlas never stores it.
pub struct FbAtlas {
    fb_info: Box<[StatusFlags]>,
    pass: RenderPassState,
}

impl Default for FbAtlas {
    fn default() -> Self {
        Self::new()
    }
}

impl FbAtlas {
    pub fn new() -> Self {
        Self {
            fb_info: vec![StatusFlags::owned(Ownership::UnscaledPrefer); GRID_CELLS]
                .into_boxed_slice(),
            pass: RenderPassState::default(),
        }
    }

    const fn index(block_x: u32, block_y: u32) -> usize {
        let x = block_x & (NUM_BLOCKS_X - 1);
        let y = block_y & (NUM_BLOCKS_Y - 1);
        (y * NUM_BLOCKS_X + x) as usize
    }

    fn info_mut(&mut self, block_x: u32, block_y: u32) -> &mut StatusFlags {
        &mut self.fb_info[Self::index(block_x, block_y)]
    }

    /// Status word of a block. Coordinates wrap around the grid.
    pub fn block_status(&self, block_x: u32, block_y: u32) -> StatusFlags {
        self.fb_info[Self::index(block_x, block_y)]
    }

    pub const fn render_pass(&self) -> &RenderPassState {
        &self.pass
    }

    pub const fn render_pass_rect(&self) -> Rect {
        self.pass.rect
    }

    pub fn is_inside_render_pass(&self) -> bool {
        self.pass.phase() == RenderPassPhase::Open
    }

    pub fn set_draw_rect(&mut self, rect: Rect) {
        self.pass.scissor = rect;
    }

    pub fn set_texture_window(&mut self, rect: Rect) {
        self.pass.texture_window = rect;
    }

    pub fn set_texture_offset(&mut self, x: u32, y: u32) {
        self.pass.texture_offset = (x, y);
    }

    pub fn set_palette_offset(&mut self, x: u32, y: u32) {
        self.pass.palette_offset = (x, y);
    }

    /// Returns the previous mode.
    pub fn set_texture_mode(&mut self, mode: TextureMode) -> TextureMode {
        std::mem::replace(&mut self.pass.texture_mode, mode)
    }

    pub fn read_compute(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        self.sync_domain(domain, rect, l);
        self.read_domain(domain, Stage::Compute, rect, l);
    }

    pub fn write_compute(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        self.sync_domain(domain, rect, l);
        self.write_domain(domain, Stage::Compute, rect, l);
    }

    pub fn read_transfer(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        self.sync_domain(domain, rect, l);
        self.read_domain(domain, Stage::Transfer, rect, l);
    }

    pub fn write_transfer(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        self.sync_domain(domain, rect, l);
        self.write_domain(domain, Stage::Transfer, rect, l);
    }

    pub fn read_fragment(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        self.sync_domain(domain, rect, l);
        self.read_domain(domain, Stage::Fragment, rect, l);
    }

    /// CPU upload into unscaled VRAM. Marks the blocks as holding a loaded texture.
    pub fn load_image(&mut self, rect: Rect, l: &mut dyn HazardListener) {
        self.write_compute(Domain::Unscaled, rect, l);
        for (x, y) in rect.blocks().iter() {
            *self.info_mut(x, y) |= StatusFlags::TEXTURE_LOADED;
        }
    }

    /// Whether the interior of `rect` still holds uploaded texture data.
    ///
    /// The first and last block of each axis are ignored; neighbouring uploads tend to
    /// bleed into those. Queries spanning at most two blocks on an axis have no interior.
    pub fn texture_loaded(&self, rect: Rect) -> bool {
        let range = rect.blocks();
        if range.width() <= 2 || range.height() <= 2 {
            return false;
        }
        let interior = BlockRange {
            x_begin: range.x_begin + 1,
            x_end: range.x_end - 1,
            y_begin: range.y_begin + 1,
            y_end: range.y_end - 1,
        };
        interior
            .iter()
            .any(|(x, y)| self.block_status(x, y).texture_loaded())
    }

    /// Marks a VRAM to VRAM copy and returns the domain it must run in.
    pub fn blit_vram(&mut self, dst: Rect, src: Rect, l: &mut dyn HazardListener) -> Domain {
        debug_assert!(!dst.is_empty() && !src.is_empty(), "zero-area blit");
        let domain = self.find_suitable_domain(src);

        self.sync_domain(domain, src, l);
        self.sync_domain(domain, dst, l);
        self.read_domain(domain, Stage::Compute, src, l);
        self.write_domain(domain, Stage::Compute, dst, l);

        let src_blocks = src.blocks();
        let dst_blocks = dst.blocks();
        let columns = src_blocks.width().min(dst_blocks.width());
        let rows = src_blocks.height().min(dst_blocks.height());
        for j in 0..rows {
            for i in 0..columns {
                let loaded = self
                    .block_status(src_blocks.x_begin + i, src_blocks.y_begin + j)
                    .texture_loaded();
                self.info_mut(dst_blocks.x_begin + i, dst_blocks.y_begin + j)
                    .set(StatusFlags::TEXTURE_LOADED, loaded);
            }
        }

        domain
    }

    /// Samples the configured texture page (and palette) from unscaled VRAM.
    pub fn read_texture(&mut self, l: &mut dyn HazardListener) {
        let domain = Domain::Unscaled;
        let texture_rect = self.pass.texture_rect();
        let paletted = self.pass.texture_mode.is_paletted();
        let palette_rect = self.pass.palette_rect();

        self.sync_domain(domain, texture_rect, l);
        if paletted {
            self.sync_domain(domain, palette_rect, l);
        }
        self.read_domain(domain, Stage::FragmentTexture, texture_rect, l);
        if paletted {
            self.read_domain(domain, Stage::FragmentTexture, palette_rect, l);
        }
    }

    /// Queues a primitive covering `rect` into the render pass.
    ///
    /// A textured primitive whose texture (or palette) lies inside the pass flushes the pass
    /// before sampling, so the texture read sees every earlier draw.
    pub fn write_fragment(&mut self, rect: Rect, l: &mut dyn HazardListener) {
        if self.pass.texture_mode != TextureMode::None {
            let texture_rect = self.pass.texture_rect();
            let mut conflict = self.pass.overlaps(&texture_rect);
            if self.pass.texture_mode.is_paletted() {
                conflict |= self.pass.overlaps(&self.pass.palette_rect());
            }
            if conflict {
                self.flush_render_pass(l);
            }
            self.read_texture(l);
        }

        self.extend_render_pass(rect, true, l);
    }

    pub fn clear_rect(&mut self, rect: Rect, color: FbColor, l: &mut dyn HazardListener) {
        // A clear away from the open pass most likely starts a new one.
        if self.is_inside_render_pass() && !self.pass.rect.intersects(&rect) {
            self.flush_render_pass(l);
        }

        self.extend_render_pass(rect, false, l);
        l.clear_quad(rect, color, self.pass.rect == rect);

        for (x, y) in rect.blocks().iter() {
            self.info_mut(x, y).remove(StatusFlags::TEXTURE_LOADED);
        }
    }

    pub fn extend_render_pass(&mut self, rect: Rect, scissor: bool, l: &mut dyn HazardListener) {
        let invariant = !scissor || self.pass.scissor.contains(&rect);
        l.set_scissored_invariant(invariant);
        let scissored = if invariant {
            rect
        } else {
            rect.scissor(&self.pass.scissor)
        };
        if scissored.is_empty() {
            return;
        }

        if self.pass.phase == RenderPassPhase::Closed {
            self.pass.rect = scissored;
            self.sync_domain(Domain::Scaled, scissored, l);
            self.write_domain(Domain::Scaled, Stage::Fragment, scissored, l);
            self.pass.phase = RenderPassPhase::Open;
            return;
        }

        if self.pass.rect.contains(&scissored) {
            return;
        }

        self.pass.rect.extend_bounding_box(&scissored);
        self.pass.phase = RenderPassPhase::Extending;

        // An unscissored clear covering the whole grown pass makes everything queued so far moot.
        if !scissor && scissored == self.pass.rect {
            self.discard_render_pass(l);
            self.pass.phase = RenderPassPhase::Extending;
        }

        let union = self.pass.rect;
        self.sync_domain(Domain::Scaled, union, l);
        if self.write_domain(Domain::Scaled, Stage::Fragment, union, l) {
            // The grown area was sampled by the pass itself. Submit what is queued and
            // seed the next pass from the requested rect only.
            self.pass.phase = RenderPassPhase::Open;
            self.flush_render_pass(l);
            self.pass.rect = scissored;
        }
        self.pass.phase = RenderPassPhase::Open;
    }

    pub fn flush_render_pass(&mut self, l: &mut dyn HazardListener) {
        if self.pass.phase != RenderPassPhase::Open {
            return;
        }

        for info in self.fb_info.iter_mut() {
            info.remove(StatusFlags::TEXTURE_READ);
        }

        self.pass.phase = RenderPassPhase::Closed;
        let rect = self.pass.rect;
        self.write_domain(Domain::Scaled, Stage::Fragment, rect, l);
        tracing::trace!(?rect, "[atlas] flush render pass");
        l.flush_render_pass(rect);

        for (x, y) in rect.blocks().iter() {
            self.info_mut(x, y).remove(StatusFlags::TEXTURE_LOADED);
        }
    }

    fn discard_render_pass(&mut self, l: &mut dyn HazardListener) {
        self.pass.phase = RenderPassPhase::Closed;
        l.discard_render_pass();
    }

    /// Scaled when `rect` touches the open pass, otherwise whichever domain the blocks lean
    /// towards.
    pub fn find_suitable_domain(&self, rect: Rect) -> Domain {
        if self.pass.overlaps(&rect) {
            return Domain::Scaled;
        }
        let favors_unscaled = rect
            .blocks()
            .iter()
            .any(|(x, y)| self.block_status(x, y).ownership().favors_unscaled());
        if favors_unscaled {
            Domain::Unscaled
        } else {
            Domain::Scaled
        }
    }

    /// Makes every block of `rect` valid in `domain`, resolving stale blocks one by one.
    pub fn sync_domain(&mut self, domain: Domain, rect: Rect, l: &mut dyn HazardListener) {
        debug_assert!(!rect.is_empty(), "zero-area rect");
        if self.pass.overlaps(&rect) {
            self.flush_render_pass(l);
        }

        let blocks = rect.blocks();
        let stale = match domain {
            Domain::Unscaled => Ownership::ScaledOnly,
            Domain::Scaled => Ownership::UnscaledOnly,
        };
        if !blocks
            .iter()
            .any(|(x, y)| self.block_status(x, y).ownership() == stale)
        {
            return;
        }

        let (hazard, resolve, ownership) = match domain {
            Domain::Scaled => (
                StatusFlags::FB_WRITE | StatusFlags::SFB_WRITE | StatusFlags::SFB_READ,
                StatusFlags::COMPUTE_FB_READ | StatusFlags::COMPUTE_SFB_WRITE,
                Ownership::UnscaledPrefer,
            ),
            Domain::Unscaled => (
                StatusFlags::FB_WRITE | StatusFlags::SFB_WRITE | StatusFlags::FB_READ,
                StatusFlags::COMPUTE_SFB_READ | StatusFlags::COMPUTE_FB_WRITE,
                Ownership::ScaledPrefer,
            ),
        };

        let pending = blocks
            .iter()
            .map(|(x, y)| self.block_status(x, y))
            .filter(|info| info.ownership() == stale)
            .fold(StatusFlags::empty(), |acc, info| acc | (info & hazard));
        if !pending.is_empty() {
            self.pipeline_barrier(pending, l);
        }

        let mut resolved = 0u32;
        for (x, y) in blocks.iter() {
            let info = self.info_mut(x, y);
            if info.ownership() != stale {
                continue;
            }
            *info = (*info | resolve).with_ownership(ownership);
            l.resolve(
                domain,
                (vram_model::BLOCK_WIDTH * x) & (vram_model::FB_WIDTH - 1),
                (vram_model::BLOCK_HEIGHT * y) & (vram_model::FB_HEIGHT - 1),
            );
            resolved += 1;
        }
        tracing::trace!(?domain, ?rect, resolved, "[atlas] resolved stale blocks");
    }

    /// Marks `rect` written by `stage` in `domain`, which becomes the sole owner.
    ///
    /// Returns true when the write had to wait for fragment reads of the scaled domain, which
    /// only happens for blocks the open pass itself samples.
    pub fn write_domain(
        &mut self,
        domain: Domain,
        stage: Stage,
        rect: Rect,
        l: &mut dyn HazardListener,
    ) -> bool {
        debug_assert!(!rect.is_empty(), "zero-area rect");
        if self.pass.overlaps(&rect) {
            self.flush_render_pass(l);
        }

        let mut hazard = StatusFlags::domain_writes(domain)
            | StatusFlags::domain_reads(domain)
            | StatusFlags::TEXTURE_READ;
        let write = StatusFlags::write(stage, domain);
        if matches!(stage, Stage::Fragment | Stage::FragmentTexture) {
            // Fragment write-after-write is ordered by the pass itself.
            hazard.remove(write);
        }

        let blocks = rect.blocks();
        let pending = blocks
            .iter()
            .fold(StatusFlags::empty(), |acc, (x, y)| {
                acc | (self.block_status(x, y) & hazard)
            });

        // Updating VRAM that the open pass still samples.
        if pending.texture_read() {
            self.flush_render_pass(l);
        }
        if !pending.is_empty() {
            self.pipeline_barrier(pending, l);
        }

        for (x, y) in blocks.iter() {
            let info = self.info_mut(x, y);
            *info = (*info | write).with_ownership(Ownership::only(domain));
        }

        pending.contains(StatusFlags::FRAGMENT_SFB_READ)
    }

    /// Marks `rect` read by `stage` in `domain`, waiting on earlier writes where needed.
    pub fn read_domain(
        &mut self,
        domain: Domain,
        stage: Stage,
        rect: Rect,
        l: &mut dyn HazardListener,
    ) {
        debug_assert!(!rect.is_empty(), "zero-area rect");
        if self.pass.overlaps(&rect) {
            self.flush_render_pass(l);
        }

        let mut hazard = StatusFlags::domain_writes(domain);
        let mut read = StatusFlags::read(stage, domain);
        match stage {
            Stage::Fragment => hazard.remove(read),
            Stage::FragmentTexture => {
                read |= StatusFlags::TEXTURE_READ;
                hazard.remove(read);
            }
            Stage::Compute | Stage::Transfer => {}
        }

        let blocks = rect.blocks();
        let pending = blocks
            .iter()
            .fold(StatusFlags::empty(), |acc, (x, y)| {
                acc | (self.block_status(x, y) & hazard)
            });
        if !pending.is_empty() {
            self.pipeline_barrier(pending, l);
        }

        for (x, y) in blocks.iter() {
            *self.info_mut(x, y) |= read;
        }
    }

    /// Requests a global barrier for `flags` and retires them from every block.
    pub fn pipeline_barrier(&mut self, flags: StatusFlags, l: &mut dyn HazardListener) {
        if flags.intersects(StatusFlags::FRAGMENT_SFB_WRITE | StatusFlags::FRAGMENT_SFB_READ) {
            self.flush_render_pass(l);
        }
        l.hazard(flags);
        self.notify_external_barrier(flags);
    }

    /// Records a barrier issued outside the atlas.
    pub fn notify_external_barrier(&mut self, flags: StatusFlags) {
        let retired = flags.barrier_closure();
        for info in self.fb_info.iter_mut() {
            info.remove(retired);
        }
    }
}
