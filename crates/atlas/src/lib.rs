//! VRAM hazard tracking.
//!
//! `FbAtlas` keeps one status word per 8x8 block of VRAM and decides, for every access,
//! which domain copy is authoritative, which barriers are needed and when the batched
//! render pass has to be flushed. Side effects are reported through `HazardListener`.

mod fb_atlas;
mod listener;
mod render_pass;

pub use fb_atlas::FbAtlas;
pub use listener::HazardListener;
pub use render_pass::{RenderPassPhase, RenderPassState};

#[cfg(test)]
mod tests;
