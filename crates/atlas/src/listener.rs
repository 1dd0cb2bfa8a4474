use vram_model::{Domain, FbColor, Rect, StatusFlags};

/// Owner-side effects requested by [`crate::FbAtlas`].
///
/// The atlas hands itself out only as `&mut self` while calling into a listener, so
/// an implementation cannot reach back into the atlas from these callbacks.
pub trait HazardListener {
    /// Issue a global barrier that waits for every access in `flags`.
    fn hazard(&mut self, flags: StatusFlags);

    /// Copy the 8x8 block at native pixel `(x, y)` from the other domain into `target`.
    fn resolve(&mut self, target: Domain, x: u32, y: u32);

    /// Execute everything queued for the open render pass over `rect` (native pixels).
    fn flush_render_pass(&mut self, rect: Rect);

    /// Drop everything queued for the open render pass.
    fn discard_render_pass(&mut self);

    /// Queue a solid fill of `rect`. `clear_candidate` is set when `rect` is the whole
    /// render pass so far, which allows a load-op clear at flush time.
    fn clear_quad(&mut self, rect: Rect, color: FbColor, clear_candidate: bool);

    /// Whether the primitive about to be queued lies fully inside the draw area.
    fn set_scissored_invariant(&mut self, invariant: bool);
}
