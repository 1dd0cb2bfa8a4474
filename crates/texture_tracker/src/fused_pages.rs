//! Texture pages that sample several replaced uploads at once.
//!
//! A fused page composites every live replacement inside one texture page into a single
//! image at the largest scale among them. Texels not covered by a replacement hold the
//! opaque-black fallthrough value.

use std::collections::HashMap;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use tracing::{debug, trace};
use vram_model::Rect;

use crate::image_ops::{AlphaFlags, HdImage, generate_mip};
use crate::rect_tracker::{RectTracker, TextureRect, TextureUpload};

const FALLTHROUGH: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct FusionRects {
    pub rects: Vec<TextureRect>,
    pub vram_rect: Rect,
    pub scale_x: u32,
    pub scale_y: u32,
}

impl FusionRects {
    fn collect(page_rect: &Rect, palette: u32, tracker: &RectTracker, uploads: &HashMap<u32, TextureUpload>) -> Self {
        let mut fusion = FusionRects::default();
        for (_, texture) in tracker.live() {
            let Some(clipped) = texture.clipped(page_rect) else {
                continue;
            };
            let Some(upload) = uploads.get(&texture.upload) else {
                continue;
            };
            let Some(image) = upload.textures.get(&palette) else {
                continue;
            };
            fusion.scale_x = fusion.scale_x.max(image.width() / upload.width);
            fusion.scale_y = fusion.scale_y.max(image.height() / upload.height);
            if fusion.rects.is_empty() {
                fusion.vram_rect = clipped.vram_rect;
            } else {
                fusion.vram_rect.extend_bounding_box(&clipped.vram_rect);
            }
            fusion.rects.push(clipped);
        }
        // Canonical order so fusions compare by content.
        fusion.rects.sort_by_key(|rect| {
            let sub = rect.texture_subrect();
            std::cmp::Reverse((
                rect.upload,
                (rect.vram_rect.x, rect.vram_rect.y, rect.vram_rect.width, rect.vram_rect.height),
                (sub.x, sub.y, sub.width, sub.height),
            ))
        });
        fusion
    }

    fn byte_size(&self) -> u64 {
        u64::from(self.scale_x * self.scale_y) * self.vram_rect.area() * 4
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FusedPage {
    pub full_page_rect: Rect,
    pub palette: u32,
    pub fusion: FusionRects,
    pub image: Option<Arc<HdImage>>,
    pub dirty: bool,
    pub dead: bool,
}

/// Fused page image and the VRAM area its texels cover.
#[derive(Debug, Clone)]
pub(crate) struct FusedTexture {
    pub vram_rect: Rect,
    pub image: Arc<HdImage>,
}

#[derive(Debug, Default)]
pub(crate) struct FusedPages {
    pages: Vec<FusedPage>,
}

impl FusedPages {
    /// Index of the live page for `page_rect` and `palette`, building it on first use.
    pub fn get_or_make(
        &mut self,
        page_rect: Rect,
        palette: u32,
        tracker: &RectTracker,
        uploads: &HashMap<u32, TextureUpload>,
    ) -> usize {
        if let Some(index) = self
            .pages
            .iter()
            .position(|page| !page.dead && page.palette == palette && page.full_page_rect == page_rect)
        {
            return index;
        }
        debug!("[tracker] new fused page {:?} for palette {:x}", page_rect, palette);
        let mut page = FusedPage {
            full_page_rect: page_rect,
            palette,
            fusion: FusionRects::default(),
            image: None,
            dirty: false,
            dead: false,
        };
        rebuild_page(&mut page, tracker, uploads);
        self.pages.push(page);
        self.pages.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<FusedTexture> {
        let page = self.pages.get(index)?;
        let image = page.image.clone()?;
        Some(FusedTexture {
            vram_rect: page.fusion.vram_rect,
            image,
        })
    }

    pub fn mark_dirty(&mut self, rect: &Rect) {
        for page in self.live_pages_touching(rect) {
            page.dirty = true;
        }
    }

    pub fn mark_dead(&mut self, rect: &Rect) {
        for page in self.live_pages_touching(rect) {
            page.dead = true;
        }
    }

    fn live_pages_touching<'a>(&'a mut self, rect: &'a Rect) -> impl Iterator<Item = &'a mut FusedPage> {
        self.pages
            .iter_mut()
            .filter(move |page| !page.dead && page.full_page_rect.intersects(rect))
    }

    pub fn rebuild_dirty(&mut self, tracker: &RectTracker, uploads: &HashMap<u32, TextureUpload>) {
        let mut changed = false;
        for page in self.pages.iter_mut().filter(|page| !page.dead && page.dirty) {
            rebuild_page(page, tracker, uploads);
            changed = true;
        }
        if changed {
            let bytes: u64 = self.pages.iter().map(|page| page.fusion.byte_size()).sum();
            debug!(
                "[tracker] {} fused pages, {:.1} MiB",
                self.pages.len(),
                bytes as f64 / 1_048_576.0
            );
        }
    }

    /// Drops dead pages. Invalidates fused handles.
    pub fn remove_dead(&mut self) {
        self.pages.retain(|page| !page.dead);
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

fn rebuild_page(page: &mut FusedPage, tracker: &RectTracker, uploads: &HashMap<u32, TextureUpload>) {
    page.dirty = false;
    let fusion = FusionRects::collect(&page.full_page_rect, page.palette, tracker, uploads);
    if page.image.is_some() && fusion == page.fusion {
        trace!("[tracker] fused page {:?} unchanged", page.full_page_rect);
        return;
    }
    page.fusion = fusion;
    if page.fusion.rects.is_empty() {
        page.dead = true;
        page.image = None;
        trace!("[tracker] fused page {:?} is now dead", page.full_page_rect);
        return;
    }
    page.image = Some(Arc::new(composite(&page.fusion, page.palette, uploads)));
}

/// Nearest-neighbour composite of every fused rect, then box-filtered mips down to the
/// original VRAM resolution.
fn composite(fusion: &FusionRects, palette: u32, uploads: &HashMap<u32, TextureUpload>) -> HdImage {
    let (scale_x, scale_y) = (fusion.scale_x, fusion.scale_y);
    let origin = fusion.vram_rect;
    let mut base = RgbaImage::from_pixel(origin.width * scale_x, origin.height * scale_y, FALLTHROUGH);
    let mut alpha_flags = AlphaFlags::empty();

    for texture in &fusion.rects {
        let Some(upload) = uploads.get(&texture.upload) else {
            continue;
        };
        let Some(image) = upload.textures.get(&palette) else {
            continue;
        };
        let Some(source) = image.levels.first() else {
            continue;
        };
        alpha_flags |= image.alpha_flags;
        let src_scale_x = source.width() / upload.width;
        let src_scale_y = source.height() / upload.height;
        let sub = texture.texture_subrect();
        let dst_x = (texture.vram_rect.x - origin.x) * scale_x;
        let dst_y = (texture.vram_rect.y - origin.y) * scale_y;
        for y in 0..texture.vram_rect.height * scale_y {
            let src_y = sub.y * src_scale_y + y * src_scale_y / scale_y;
            for x in 0..texture.vram_rect.width * scale_x {
                let src_x = sub.x * src_scale_x + x * src_scale_x / scale_x;
                if let Some(texel) = source.get_pixel_checked(src_x, src_y) {
                    base.put_pixel(dst_x + x, dst_y + y, *texel);
                }
            }
        }
    }

    let mip_levels = scale_x.min(scale_y).max(1).ilog2() + 1;
    let mut levels = vec![base];
    while levels.len() < mip_levels as usize
        && let Some(last) = levels.last()
        && last.width() % 2 == 0
        && last.height() % 2 == 0
    {
        let next = generate_mip(last);
        levels.push(next);
    }
    HdImage {
        levels,
        alpha_flags,
    }
}
