//! Per-render-pass primitive queues and the scissor-grouped draw batching.

use gpu_runtime::{BlitInfo, BlockRect, HdSampling, PrimitiveVertex};
use vram_model::{FbColor, Rect, SemiTransparentMode};

/// Triangles for one batchable program, with the scissor index of every triangle and
/// the replacement texture it samples.
///
/// A scissor of `None` means "inside the draw area of the whole pass" and uses the pass
/// area at draw time. Replacements index `RenderQueue::hd_textures`.
#[derive(Debug, Default)]
pub(crate) struct PrimitiveQueue {
    pub(crate) vertices: Vec<PrimitiveVertex>,
    pub(crate) scissors: Vec<(u32, Option<u32>)>,
    pub(crate) hd: Vec<Option<u32>>,
}

impl PrimitiveQueue {
    pub(crate) fn push_triangles(
        &mut self,
        vertices: &[PrimitiveVertex],
        scissor: Option<u32>,
        hd: Option<u32>,
    ) {
        debug_assert!(vertices.len() % 3 == 0);
        let first = (self.vertices.len() / 3) as u32;
        self.vertices.extend_from_slice(vertices);
        let count = (vertices.len() / 3) as u32;
        self.scissors
            .extend((first..first + count).map(|index| (index, scissor)));
        self.hd.extend(std::iter::repeat_n(hd, count as usize));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    fn clear(&mut self) {
        self.vertices.clear();
        self.scissors.clear();
        self.hd.clear();
    }
}

/// Blend state of one semi-transparent or mask-tested triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SemiTransparentState {
    pub(crate) scissor: Option<u32>,
    pub(crate) mode: SemiTransparentMode,
    pub(crate) textured: bool,
    pub(crate) masked: bool,
    pub(crate) hd: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ClearCandidate {
    pub(crate) rect: Rect,
    pub(crate) color: FbColor,
    pub(crate) z: f32,
}

#[derive(Debug, Default)]
pub(crate) struct RenderQueue {
    pub(crate) opaque: PrimitiveQueue,
    pub(crate) opaque_textured: PrimitiveQueue,
    /// Opaque texels of textured semi-transparent primitives.
    pub(crate) semi_transparent_opaque: PrimitiveQueue,
    /// Strictly ordered; one state per triangle.
    pub(crate) semi_transparent: Vec<PrimitiveVertex>,
    pub(crate) semi_transparent_state: Vec<SemiTransparentState>,
    /// Replacements sampled by queued primitives, deduplicated.
    pub(crate) hd_textures: Vec<HdSampling>,

    pub(crate) scaled_resolves: Vec<BlockRect>,
    pub(crate) unscaled_resolves: Vec<BlockRect>,

    pub(crate) scaled_blits: Vec<BlitInfo>,
    pub(crate) scaled_masked_blits: Vec<BlitInfo>,
    pub(crate) unscaled_blits: Vec<BlitInfo>,
    pub(crate) unscaled_masked_blits: Vec<BlitInfo>,

    /// Scaled draw areas seen in this pass; the last one is current.
    pub(crate) scissors: Vec<Rect>,
    pub(crate) clear_candidates: Vec<ClearCandidate>,
    pub(crate) scissor_invariant: bool,
}

impl RenderQueue {
    /// Drops every primitive queued for the pass. Resolves and blits are kept.
    pub(crate) fn clear_primitives(&mut self) {
        self.opaque.clear();
        self.opaque_textured.clear();
        self.semi_transparent_opaque.clear();
        self.semi_transparent.clear();
        self.semi_transparent_state.clear();
        self.hd_textures.clear();
        self.clear_candidates.clear();
    }

    pub(crate) fn hd_index(&mut self, sampling: HdSampling) -> u32 {
        match self.hd_textures.iter().position(|known| *known == sampling) {
            Some(index) => index as u32,
            None => {
                self.hd_textures.push(sampling);
                (self.hd_textures.len() - 1) as u32
            }
        }
    }

    /// Index of the current draw area, or `None` when the primitive needs no scissor.
    pub(crate) fn current_scissor(&self) -> Option<u32> {
        if self.scissor_invariant {
            None
        } else {
            Some(self.scissors.len().saturating_sub(1) as u32)
        }
    }

    /// Last clear candidate covering exactly `rect`.
    pub(crate) fn clear_candidate_for(&self, rect: Rect) -> Option<ClearCandidate> {
        self.clear_candidates
            .iter()
            .rev()
            .find(|candidate| candidate.rect == rect)
            .copied()
    }

    pub(crate) fn has_primitives(&self) -> bool {
        !(self.opaque.is_empty()
            && self.opaque_textured.is_empty()
            && self.semi_transparent_opaque.is_empty()
            && self.semi_transparent.is_empty())
    }
}

/// A contiguous run of triangles sharing one scissor and replacement texture.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScissorRun {
    pub(crate) scissor: Option<u32>,
    pub(crate) hd: Option<u32>,
    pub(crate) vertices: Vec<PrimitiveVertex>,
}

/// Groups triangles by scissor: sorted by scissor index descending, then by submission
/// index descending, so later primitives are drawn first and win the depth test
/// without overdraw. A change of replacement texture starts a new run.
pub(crate) fn group_by_scissor(queue: &PrimitiveQueue) -> Vec<ScissorRun> {
    let mut order = queue.scissors.clone();
    order.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

    let mut runs: Vec<ScissorRun> = Vec::new();
    for (index, scissor) in order {
        let base = index as usize * 3;
        let triangle = &queue.vertices[base..base + 3];
        let hd = queue.hd.get(index as usize).copied().flatten();
        match runs.last_mut() {
            Some(run) if run.scissor == scissor && run.hd == hd => {
                run.vertices.extend_from_slice(triangle)
            }
            _ => runs.push(ScissorRun {
                scissor,
                hd,
                vertices: triangle.to_vec(),
            }),
        }
    }
    runs
}

/// Splits the ordered semi-transparent queue into draws of consecutive triangles that
/// share one state. Mask-tested triangles read the target and are never batched.
pub(crate) fn semi_transparent_batches(
    states: &[SemiTransparentState],
) -> Vec<(SemiTransparentState, std::ops::Range<usize>)> {
    let mut batches: Vec<(SemiTransparentState, std::ops::Range<usize>)> = Vec::new();
    for (index, state) in states.iter().enumerate() {
        match batches.last_mut() {
            Some((last, range)) if *last == *state && !last.masked => range.end = index + 1,
            _ => batches.push((*state, index..index + 1)),
        }
    }
    batches
}
