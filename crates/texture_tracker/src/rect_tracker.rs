//! Which upload currently backs each region of VRAM.
//!
//! Rects are never edited in place. Overwriting part of a tracked rect marks it dead and
//! appends its surviving pieces, so indices stay stable until `release_dead_handles`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use vram_model::{FB_HEIGHT, FB_WIDTH, Rect, TextureMode};

use crate::image_ops::HdImage;

pub(crate) const LOOKUP_CELL_WIDTH: u32 = 64;
pub(crate) const LOOKUP_CELL_HEIGHT: u32 = 256;
pub(crate) const LOOKUP_GRID_COLUMNS: u32 = FB_WIDTH / LOOKUP_CELL_WIDTH;
pub(crate) const LOOKUP_GRID_ROWS: u32 = FB_HEIGHT / LOOKUP_CELL_HEIGHT;

/// Texture mode and palette an upload was sampled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DumpedMode {
    pub mode: TextureMode,
    pub palette_hash: u32,
}

/// One distinct CPU upload, keyed by the CRC32 of its pixels.
#[derive(Debug, Clone)]
pub struct TextureUpload {
    pub hash: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    pub dumpable: bool,
    pub dumped_modes: Vec<DumpedMode>,
    /// Loaded replacements by palette hash. Direct-color uploads use palette hash 0.
    pub textures: HashMap<u32, Arc<HdImage>>,
}

/// A region of VRAM backed by part of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureRect {
    pub upload: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub vram_rect: Rect,
}

impl TextureRect {
    pub fn new(upload: u32, vram_rect: Rect) -> Self {
        Self {
            upload,
            offset_x: 0,
            offset_y: 0,
            vram_rect,
        }
    }

    /// Region of the upload this rect shows, in upload texels.
    pub fn texture_subrect(&self) -> Rect {
        Rect::new(
            self.offset_x,
            self.offset_y,
            self.vram_rect.width,
            self.vram_rect.height,
        )
    }

    /// The part of this rect covering `sub`, which must lie inside `vram_rect`.
    pub fn sub_texture(&self, sub: Rect) -> Self {
        Self {
            upload: self.upload,
            offset_x: self.offset_x + sub.x - self.vram_rect.x,
            offset_y: self.offset_y + sub.y - self.vram_rect.y,
            vram_rect: sub,
        }
    }

    /// Clipped to `clip`, `None` when they do not overlap.
    pub fn clipped(&self, clip: &Rect) -> Option<Self> {
        intersect(&self.vram_rect, clip).map(|sub| self.sub_texture(sub))
    }
}

pub(crate) fn intersect(a: &Rect, b: &Rect) -> Option<Rect> {
    let overlap = a.scissor(b);
    (!overlap.is_empty()).then_some(overlap)
}

fn bounds(left: u32, right: u32, top: u32, bottom: u32) -> Rect {
    Rect::new(left, top, right - left, bottom - top)
}

/// Pieces of `original` left after removing `remove`: full-width top and bottom bands,
/// then left and right pieces of the middle band.
pub(crate) fn split(original: &Rect, remove: &Rect) -> SmallVec<[Rect; 4]> {
    let mut pieces = SmallVec::new();
    let Some(hole) = intersect(original, remove) else {
        pieces.push(*original);
        return pieces;
    };
    if hole.y > original.y {
        pieces.push(bounds(original.x, original.right(), original.y, hole.y));
    }
    if hole.bottom() < original.bottom() {
        pieces.push(bounds(
            original.x,
            original.right(),
            hole.bottom(),
            original.bottom(),
        ));
    }
    if hole.x > original.x {
        pieces.push(bounds(original.x, hole.x, hole.y, hole.bottom()));
    }
    if hole.right() < original.right() {
        pieces.push(bounds(hole.right(), original.right(), hole.y, hole.bottom()));
    }
    pieces
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackedRect {
    pub rect: TextureRect,
    pub alive: bool,
}

/// Coarse spatial index over the live rects.
#[derive(Debug, Clone)]
struct LookupGrid {
    cells: Vec<Vec<(Rect, usize)>>,
}

impl Default for LookupGrid {
    fn default() -> Self {
        Self {
            cells: vec![Vec::new(); (LOOKUP_GRID_COLUMNS * LOOKUP_GRID_ROWS) as usize],
        }
    }
}

/// Half-open cell ranges touched by `rect`.
fn cell_bounds(rect: &Rect) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
    let columns = (rect.x / LOOKUP_CELL_WIDTH).min(LOOKUP_GRID_COLUMNS)
        ..rect.right().div_ceil(LOOKUP_CELL_WIDTH).min(LOOKUP_GRID_COLUMNS);
    let rows = (rect.y / LOOKUP_CELL_HEIGHT).min(LOOKUP_GRID_ROWS)
        ..rect.bottom().div_ceil(LOOKUP_CELL_HEIGHT).min(LOOKUP_GRID_ROWS);
    (columns, rows)
}

impl LookupGrid {
    fn clear(&mut self) {
        self.cells.iter_mut().for_each(Vec::clear);
    }

    fn insert(&mut self, rect: Rect, index: usize) {
        let (columns, rows) = cell_bounds(&rect);
        for y in rows {
            for x in columns.clone() {
                self.cells[(y * LOOKUP_GRID_COLUMNS + x) as usize].push((rect, index));
            }
        }
    }

    fn query(&self, rect: &Rect, results: &mut BTreeSet<usize>) {
        let (columns, rows) = cell_bounds(rect);
        for y in rows {
            for x in columns.clone() {
                let cell = &self.cells[(y * LOOKUP_GRID_COLUMNS + x) as usize];
                results.extend(
                    cell.iter()
                        .filter(|(entry, _)| entry.intersects(rect))
                        .map(|(_, index)| *index),
                );
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RectTracker {
    pub(crate) textures: Vec<TrackedRect>,
    grid: LookupGrid,
    grid_dirty: bool,
}

impl RectTracker {
    /// Tracks a fresh upload covering `rect`.
    pub fn upload(&mut self, rect: Rect, upload: u32) {
        self.place(TextureRect::new(upload, rect));
    }

    pub fn place(&mut self, texture: TextureRect) {
        self.clear_rect(&texture.vram_rect);
        self.textures.push(TrackedRect {
            rect: texture,
            alive: true,
        });
        self.grid_dirty = true;
    }

    /// Moves whatever backs `src` to `dst`, replacing what was there.
    pub fn blit(&mut self, dst: Rect, src: Rect) {
        let moved: Vec<TextureRect> = self
            .live()
            .filter_map(|(_, texture)| texture.clipped(&src))
            .map(|mut texture| {
                texture.vram_rect.x = texture.vram_rect.x - src.x + dst.x;
                texture.vram_rect.y = texture.vram_rect.y - src.y + dst.y;
                texture
            })
            .collect();
        self.clear_rect(&dst);
        for texture in moved {
            self.place(texture);
        }
        self.grid_dirty = true;
    }

    pub fn clear(&mut self, rect: Rect) {
        self.clear_rect(&rect);
        self.grid_dirty = true;
    }

    fn clear_rect(&mut self, rect: &Rect) {
        let mut survivors = Vec::new();
        for tracked in self.textures.iter_mut().filter(|t| t.alive) {
            let pieces = split(&tracked.rect.vram_rect, rect);
            if pieces.len() == 1 && pieces[0] == tracked.rect.vram_rect {
                continue;
            }
            tracked.alive = false;
            survivors.extend(pieces.iter().map(|piece| tracked.rect.sub_texture(*piece)));
        }
        self.textures
            .extend(survivors.into_iter().map(|rect| TrackedRect { rect, alive: true }));
        self.grid_dirty = true;
    }

    /// Compacts out dead rects. Invalidates every index handed out so far.
    pub fn release_dead_handles(&mut self) {
        self.textures.retain(|tracked| tracked.alive);
        self.grid_dirty = true;
    }

    /// Indices of live rects intersecting `rect`, ascending. A zero width counts as one
    /// column.
    pub fn overlapping(&mut self, mut rect: Rect) -> BTreeSet<usize> {
        if self.grid_dirty {
            self.grid.clear();
            for (index, tracked) in self.textures.iter().enumerate() {
                if tracked.alive {
                    self.grid.insert(tracked.rect.vram_rect, index);
                }
            }
            self.grid_dirty = false;
        }
        if rect.width == 0 {
            rect.width = 1;
        }
        let mut results = BTreeSet::new();
        self.grid.query(&rect, &mut results);
        results
    }

    pub fn get(&self, index: usize) -> Option<&TextureRect> {
        self.textures.get(index).map(|tracked| &tracked.rect)
    }

    pub fn is_alive(&self, index: usize) -> bool {
        self.textures.get(index).is_some_and(|tracked| tracked.alive)
    }

    pub fn live(&self) -> impl Iterator<Item = (usize, &TextureRect)> {
        self.textures
            .iter()
            .enumerate()
            .filter(|(_, tracked)| tracked.alive)
            .map(|(index, tracked)| (index, &tracked.rect))
    }

    /// Every upload hash still referenced, dead rects included.
    pub fn referenced_uploads(&self) -> impl Iterator<Item = u32> + '_ {
        self.textures.iter().map(|tracked| tracked.rect.upload)
    }

    pub fn reset(&mut self) {
        self.textures.clear();
        self.grid_dirty = true;
    }
}
