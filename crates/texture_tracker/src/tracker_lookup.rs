//! Palette hashing, replacement lookup and dumping of sampled uploads.

use tracing::{debug, warn};
use vram_model::{Rect, TextureMode};

use crate::image_ops::{AlphaFlags, dump_rgba};
use crate::io_worker::IoRequest;
use crate::rect_tracker::DumpedMode;
use crate::{
    HdLookup, HdTexture, HdTextureHandle, TextureTracker, TrackerError, UsedMode, hash_pixels,
};

const PAGE_HEIGHT: u32 = 256;

/// Width in VRAM words of a texture page sampled in `mode`.
fn page_width(mode: TextureMode) -> u32 {
    match mode {
        TextureMode::Palette4bpp => 64,
        TextureMode::Palette8bpp => 128,
        TextureMode::None | TextureMode::Abgr1555 => 256,
    }
}

impl TextureTracker {
    /// Pixels and CRC32 of a CLUT row, when a single upload without offset holds all of it.
    pub fn palette(&mut self, palette_rect: Rect) -> Option<(Vec<u16>, u32)> {
        debug_assert_eq!(palette_rect.height, 1, "palettes are one row");
        for index in self.tracker.overlapping(palette_rect) {
            let Some(texture) = self.tracker.get(index) else {
                continue;
            };
            if !texture.vram_rect.contains(&palette_rect)
                || texture.offset_x != 0
                || texture.offset_y != 0
            {
                continue;
            }
            let Some(upload) = self.uploads.get(&texture.upload) else {
                continue;
            };
            let x = palette_rect.x - texture.vram_rect.x;
            let y = palette_rect.y - texture.vram_rect.y;
            let start = (y * texture.vram_rect.width + x) as usize;
            let Some(data) = upload.pixels.get(start..start + palette_rect.width as usize) else {
                continue;
            };
            return Some((data.to_vec(), hash_pixels(data)));
        }
        None
    }

    /// CRC32 of the CLUT at `palette_rect`, 0 when it is not tracked.
    pub fn palette_hash(&mut self, palette_rect: Rect) -> u32 {
        if let Some(&(_, hash)) = self
            .palette_hashes
            .iter()
            .find(|(rect, _)| *rect == palette_rect)
        {
            return hash;
        }
        match self.palette(palette_rect) {
            Some((_, hash)) => {
                self.palette_hashes.push((palette_rect, hash));
                hash
            }
            None => 0,
        }
    }

    /// Finds the replacement for a primitive sampling `rect` of VRAM in the texture page
    /// at `page_x`, `page_y`. Dumps every overlapped upload on the way.
    ///
    /// Several replacements under `rect` resolve to a fused page handle.
    pub fn get_hd_texture_index(
        &mut self,
        rect: Rect,
        mode: UsedMode,
        page_x: u32,
        page_y: u32,
    ) -> Result<HdLookup, TrackerError> {
        let mut lookup = HdLookup::default();
        let palette_hash = if (self.replace_enabled || self.config.dump) && mode.mode.is_paletted() {
            self.palette_hash(mode.palette_rect())
        } else {
            0
        };

        if self.replace_enabled
            && let Some(handle) = self.cache.get(&rect, palette_hash)
        {
            lookup.cache_hit = true;
            if let HdTextureHandle::Rect { index, .. } = handle
                && self.tracker.is_alive(index)
            {
                lookup.handle = handle;
                lookup.fastpath_capable = self.fastpath_enabled && self.is_opaque(index, palette_hash);
                return Ok(lookup);
            }
        }

        let overlapping = self.tracker.overlapping(rect);
        let dumped = DumpedMode {
            mode: mode.mode,
            palette_hash,
        };
        for &index in &overlapping {
            if let Some(texture) = self.tracker.get(index) {
                let upload = texture.upload;
                self.dump_texture(upload, mode, dumped)?;
            }
        }
        if !self.replace_enabled {
            return Ok(lookup);
        }

        let mut found: Option<(usize, Rect)> = None;
        for &index in &overlapping {
            let Some(texture) = self.tracker.get(index) else {
                continue;
            };
            let Some(image) = self
                .uploads
                .get(&texture.upload)
                .and_then(|upload| upload.textures.get(&palette_hash))
            else {
                continue;
            };
            if found.is_some() {
                let page_rect = Rect::new(page_x, page_y, page_width(mode.mode), PAGE_HEIGHT);
                let page = self
                    .fused
                    .get_or_make(page_rect, palette_hash, &self.tracker, &self.uploads);
                lookup.handle = HdTextureHandle::Fused { page };
                lookup.fastpath_capable = false;
                return Ok(lookup);
            }
            found = Some((index, texture.vram_rect));
            lookup.fastpath_capable = self.fastpath_enabled
                && texture.vram_rect.contains(&rect)
                && !image.alpha_flags.contains(AlphaFlags::TRANSPARENT);
        }

        if let Some((index, vram_rect)) = found {
            let handle = HdTextureHandle::Rect {
                index,
                palette_hash,
            };
            self.cache.insert(vram_rect, handle);
            lookup.handle = handle;
        }
        Ok(lookup)
    }

    fn is_opaque(&self, index: usize, palette_hash: u32) -> bool {
        self.tracker
            .get(index)
            .and_then(|texture| self.uploads.get(&texture.upload))
            .and_then(|upload| upload.textures.get(&palette_hash))
            .is_some_and(|image| !image.alpha_flags.contains(AlphaFlags::TRANSPARENT))
    }

    /// Resolves a handle from `get_hd_texture_index`. Stale or empty handles give the
    /// transparent placeholder.
    pub fn get_hd_texture(&self, handle: HdTextureHandle) -> HdTexture {
        self.resolve_hd_texture(handle).unwrap_or_else(|| HdTexture {
            vram_rect: Rect::new(0, 0, 1, 1),
            texel_rect: Rect::new(0, 0, self.placeholder.width(), self.placeholder.height()),
            image: self.placeholder.clone(),
        })
    }

    /// Like [`Self::get_hd_texture`] but `None` where the placeholder would stand.
    pub fn resolve_hd_texture(&self, handle: HdTextureHandle) -> Option<HdTexture> {
        match handle {
            HdTextureHandle::None => None,
            HdTextureHandle::Rect {
                index,
                palette_hash,
            } => {
                let texture = self.tracker.get(index);
                let resolved = texture.and_then(|texture| {
                    let upload = self.uploads.get(&texture.upload)?;
                    let image = upload.textures.get(&palette_hash)?;
                    let scale_x = image.width() / upload.width;
                    let scale_y = image.height() / upload.height;
                    let sub = texture.texture_subrect();
                    Some(HdTexture {
                        vram_rect: texture.vram_rect,
                        texel_rect: Rect::new(
                            sub.x * scale_x,
                            sub.y * scale_y,
                            sub.width * scale_x,
                            sub.height * scale_y,
                        ),
                        image: image.clone(),
                    })
                });
                if resolved.is_none() {
                    warn!("[tracker] stale handle {}, {:x}", index, palette_hash);
                }
                resolved
            }
            HdTextureHandle::Fused { page } => {
                let resolved = self.fused.get(page).map(|fused| HdTexture {
                    vram_rect: fused.vram_rect,
                    texel_rect: Rect::new(0, 0, fused.image.width(), fused.image.height()),
                    image: fused.image,
                });
                if resolved.is_none() {
                    warn!("[tracker] missing fused page {}", page);
                }
                resolved
            }
        }
    }

    /// Records that `upload` was sampled with `dumped` and writes it out on first use.
    fn dump_texture(&mut self, upload: u32, mode: UsedMode, dumped: DumpedMode) -> Result<(), TrackerError> {
        let Some(entry) = self.uploads.get_mut(&upload) else {
            return Ok(());
        };
        if !entry.dumpable || entry.dumped_modes.contains(&dumped) {
            return Ok(());
        }
        entry.dumped_modes.push(dumped);
        if self.config.dump {
            self.dump_image(upload, mode)?;
        }
        Ok(())
    }

    fn dump_image(&mut self, hash: u32, mode: UsedMode) -> Result<(), TrackerError> {
        let palette = if mode.mode.is_paletted() {
            self.palette(mode.palette_rect())
        } else {
            None
        };
        let Some(upload) = self.uploads.get(&hash) else {
            return Ok(());
        };
        let Some(image) = dump_rgba(
            &upload.pixels,
            upload.width,
            upload.height,
            mode.mode,
            palette.as_ref().map(|(data, _)| data.as_slice()),
        ) else {
            return Ok(());
        };

        let suffix = match (&palette, mode.mode.is_paletted()) {
            (Some((_, palette_hash)), _) => format!("-{palette_hash:x}"),
            (None, true) => "-missing".to_owned(),
            (None, false) => String::new(),
        };
        let path = self.config.dump_dir().join(format!("{hash:x}{suffix}.png"));
        debug!("[tracker] dumping {:?} as {}", mode.mode, path.display());
        self.io.send(IoRequest::Dump { path, image })
    }
}
