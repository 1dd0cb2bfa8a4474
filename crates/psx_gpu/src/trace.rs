//! JSONL command traces.
//!
//! The first line is a [`TraceHeader`]; every later non-empty line is one
//! [`TraceCommand`] tagged by `op`.

use std::io::{BufRead, Write};

use gpu_runtime::GpuDevice;
use renderer::{DisplayMode, Vertex};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vram_model::{FB_HEIGHT, FB_WIDTH, FbColor, Rect, SemiTransparentMode, TextureMode, TextureWindow};

use crate::session::{Session, SessionError};

pub const TRACE_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid trace JSON at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize trace command: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("trace has no header")]
    MissingHeader,
    #[error("unsupported trace schema {found}, expected {expected}")]
    UnsupportedSchema { found: u16, expected: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub schema_version: u16,
}

impl Default for TraceHeader {
    fn default() -> Self {
        Self {
            schema_version: TRACE_SCHEMA_VERSION,
        }
    }
}

/// GP0 state that travels with each primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveState {
    pub texpage_x: u32,
    pub texpage_y: u32,
    pub clut_x: u32,
    pub clut_y: u32,
    /// 0 untextured, 1 raw texture, 2 modulated texture.
    pub texture_blend_mode: u8,
    /// 0 direct color, 1 8bpp, 2 4bpp.
    pub depth_shift: u8,
    pub dither: bool,
    /// 0..=3 select a blend equation, anything else is opaque.
    pub blend_mode: i32,
    pub mask_test: bool,
    pub set_mask: bool,
}

impl PrimitiveState {
    pub fn texture_mode(&self) -> TextureMode {
        if self.texture_blend_mode == 0 {
            return TextureMode::None;
        }
        match self.depth_shift {
            1 => TextureMode::Palette8bpp,
            2 => TextureMode::Palette4bpp,
            _ => TextureMode::Abgr1555,
        }
    }

    pub fn semi_transparent(&self) -> SemiTransparentMode {
        SemiTransparentMode::from_blend_mode(self.blend_mode)
    }

    pub fn modulate(&self) -> bool {
        self.texture_blend_mode == 2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceCommand {
    PrepareFrame,
    FinalizeFrame,
    /// GP0(E2) fields in 8-texel units.
    TextureWindow {
        tww: u32,
        twh: u32,
        twx: u32,
        twy: u32,
    },
    DrawOffset {
        x: i32,
        y: i32,
    },
    /// Inclusive corners, clamped to VRAM.
    DrawArea {
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
    },
    HorizontalRange {
        start: i32,
        end: i32,
    },
    VerticalRange {
        start: i32,
        end: i32,
    },
    DisplayMode {
        mode: DisplayMode,
    },
    Triangle {
        vertices: [Vertex; 3],
        state: PrimitiveState,
    },
    Quad {
        vertices: [Vertex; 4],
        state: PrimitiveState,
    },
    Line {
        vertices: [Vertex; 2],
        state: PrimitiveState,
    },
    LoadImage {
        rect: Rect,
        pixels: Vec<u16>,
    },
    FillRect {
        rect: Rect,
        color: FbColor,
    },
    CopyRect {
        src: Rect,
        dst_x: u32,
        dst_y: u32,
    },
    ToggleDisplay {
        enable: bool,
    },
}

/// Draw area rect from inclusive corners. Inverted corners give an empty rect.
pub fn draw_area_rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Rect {
    let x0 = x0.min(FB_WIDTH - 1);
    let y0 = y0.min(FB_HEIGHT - 1);
    let x1 = x1.min(FB_WIDTH - 1);
    let y1 = y1.min(FB_HEIGHT - 1);
    if x1 < x0 || y1 < y0 {
        return Rect::new(x0, y0, 0, 0);
    }
    Rect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1)
}

pub fn write_trace(writer: &mut dyn Write, commands: &[TraceCommand]) -> Result<(), TraceError> {
    serde_json::to_writer(&mut *writer, &TraceHeader::default()).map_err(TraceError::Serialize)?;
    writer.write_all(b"\n")?;
    for command in commands {
        serde_json::to_writer(&mut *writer, command).map_err(TraceError::Serialize)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn read_trace(reader: &mut dyn BufRead) -> Result<Vec<TraceCommand>, TraceError> {
    let mut commands = Vec::new();
    let mut header = None;
    let mut line_buffer = String::new();
    let mut line = 0usize;
    loop {
        line_buffer.clear();
        if reader.read_line(&mut line_buffer)? == 0 {
            break;
        }
        line = line.checked_add(1).expect("trace line number overflow");
        if line_buffer.trim().is_empty() {
            continue;
        }
        let json_error = |source| TraceError::Json { line, source };
        if header.is_none() {
            let parsed: TraceHeader = serde_json::from_str(&line_buffer).map_err(json_error)?;
            if parsed.schema_version != TRACE_SCHEMA_VERSION {
                return Err(TraceError::UnsupportedSchema {
                    found: parsed.schema_version,
                    expected: TRACE_SCHEMA_VERSION,
                });
            }
            header = Some(parsed);
            continue;
        }
        commands.push(serde_json::from_str(&line_buffer).map_err(json_error)?);
    }
    if header.is_none() {
        return Err(TraceError::MissingHeader);
    }
    Ok(commands)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub commands: usize,
    pub frames: u64,
}

impl<D: GpuDevice> Session<D> {
    fn set_primitive_state(&mut self, state: &PrimitiveState) {
        self.set_dither(state.dither);
        let renderer = self.renderer_mut();
        renderer.set_texture_offset(state.texpage_x, state.texpage_y);
        renderer.set_palette_offset(state.clut_x, state.clut_y);
        renderer.set_texture_mode(state.texture_mode());
        renderer.set_texture_color_modulate(state.modulate());
        renderer.set_semi_transparent(state.semi_transparent());
        renderer.set_mask_test(state.mask_test);
        renderer.set_force_mask_bit(state.set_mask);
    }

    pub fn apply(&mut self, command: &TraceCommand) -> Result<(), SessionError> {
        match command {
            TraceCommand::PrepareFrame => self.prepare_frame(),
            TraceCommand::FinalizeFrame => self.end_frame()?,
            TraceCommand::TextureWindow { tww, twh, twx, twy } => self
                .renderer_mut()
                .set_texture_window(TextureWindow::from_registers(*tww, *twh, *twx, *twy)),
            TraceCommand::DrawOffset { x, y } => self.renderer_mut().set_draw_offset(*x, *y),
            TraceCommand::DrawArea { x0, y0, x1, y1 } => self
                .renderer_mut()
                .set_draw_rect(draw_area_rect(*x0, *y0, *x1, *y1)),
            TraceCommand::HorizontalRange { start, end } => self
                .renderer_mut()
                .set_horizontal_display_range(*start, *end),
            TraceCommand::VerticalRange { start, end } => self
                .renderer_mut()
                .set_vertical_display_range(*start, *end),
            TraceCommand::DisplayMode { mode } => self.renderer_mut().set_display_mode(*mode),
            TraceCommand::Triangle { vertices, state } => {
                self.set_primitive_state(state);
                self.draw_triangle(vertices)?;
            }
            TraceCommand::Quad { vertices, state } => {
                self.set_primitive_state(state);
                self.draw_quad(vertices)?;
            }
            TraceCommand::Line { vertices, state } => {
                self.set_primitive_state(state);
                self.draw_line(vertices)?;
            }
            TraceCommand::LoadImage { rect, pixels } => self.upload_vram(*rect, pixels)?,
            TraceCommand::FillRect { rect, color } => self.fill_rect(*rect, *color)?,
            TraceCommand::CopyRect { src, dst_x, dst_y } => {
                let dst = Rect::new(*dst_x, *dst_y, src.width, src.height);
                self.blit_vram(dst, *src)?;
            }
            TraceCommand::ToggleDisplay { enable } => self.renderer_mut().toggle_display(*enable),
        }
        Ok(())
    }

    /// Applies `commands` in order, stopping after `max_frames` finished frames.
    pub fn replay(
        &mut self,
        commands: &[TraceCommand],
        max_frames: Option<u64>,
    ) -> Result<ReplaySummary, SessionError> {
        let mut summary = ReplaySummary::default();
        for command in commands {
            if max_frames.is_some_and(|max| summary.frames >= max) {
                break;
            }
            self.apply(command)?;
            summary.commands += 1;
            if matches!(command, TraceCommand::FinalizeFrame) {
                summary.frames += 1;
            }
        }
        debug!(
            "[session] replayed {} commands over {} frames",
            summary.commands, summary.frames
        );
        Ok(summary)
    }
}
