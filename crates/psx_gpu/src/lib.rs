//! A complete PS1 GPU built from the renderer and the texture tracker.
//!
//! [`Session`] is the context object an emulator core talks to: it applies a
//! [`GpuConfig`] at construction and mirrors every VRAM mutation into the optional
//! [`TextureTracker`](texture_tracker::TextureTracker). Traces in the [`TraceCommand`]
//! JSONL format replay through a session; `psx-replay` is the command line front end.

mod config;
mod session;
mod trace;

pub use config::{ConfigError, DitherMode, GpuConfig};
pub use session::{Session, SessionError, SessionSaveState};
pub use trace::{
    PrimitiveState, ReplaySummary, TRACE_SCHEMA_VERSION, TraceCommand, TraceError, TraceHeader,
    draw_area_rect, read_trace, write_trace,
};
