use vram_model::{Rect, TextureMode};

/// Lifecycle of the batched render pass.
///
/// `Extending` is the window in which an open pass grows to a larger bounding box:
/// the grown area is synchronized as part of the pass, so overlap checks must not
/// treat the pass as a conflicting access to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPassPhase {
    #[default]
    Closed,
    Open,
    Extending,
}

/// Accumulated render pass plus the texture state of the primitive being queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderPassState {
    pub(crate) phase: RenderPassPhase,
    pub(crate) rect: Rect,
    pub(crate) scissor: Rect,
    pub(crate) texture_window: Rect,
    pub(crate) texture_offset: (u32, u32),
    pub(crate) palette_offset: (u32, u32),
    pub(crate) texture_mode: TextureMode,
}

impl RenderPassState {
    pub const fn phase(&self) -> RenderPassPhase {
        self.phase
    }

    pub const fn is_open(&self) -> bool {
        !matches!(self.phase, RenderPassPhase::Closed)
    }

    pub const fn rect(&self) -> Rect {
        self.rect
    }

    pub const fn scissor(&self) -> Rect {
        self.scissor
    }

    pub const fn texture_mode(&self) -> TextureMode {
        self.texture_mode
    }

    /// Whether `rect`, grown to block boundaries, overlaps the open pass.
    pub(crate) fn overlaps(&self, rect: &Rect) -> bool {
        if self.phase != RenderPassPhase::Open {
            return false;
        }
        self.rect.intersects(&rect.block_aligned())
    }

    /// Sampled texture footprint in VRAM, texture window shifted by the page offset.
    pub(crate) fn texture_rect(&self) -> Rect {
        let (x, y) = self.texture_offset;
        self.texture_window.offset(x, y)
    }

    pub(crate) fn palette_rect(&self) -> Rect {
        let (x, y) = self.palette_offset;
        Rect::new(x, y, self.texture_mode.palette_width(), 1)
    }
}
