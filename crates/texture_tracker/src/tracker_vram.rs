//! Mirrors VRAM writes and readbacks into the rect tracker.

use std::collections::HashMap;

use tracing::{debug, trace, warn};
use vram_model::{FB_HEIGHT, FB_WIDTH, Rect};

use crate::io_worker::IoRequest;
use crate::rect_tracker::TextureUpload;
use crate::{RestorableRect, TextureTracker, TrackerError, hash_pixels};

/// Readbacks that look like the last FMV frame being saved for a cross fade. Tracking them
/// would evict restorables the game still needs.
fn is_fmv_readback(rect: &Rect) -> bool {
    rect.y == 0
        && rect.height == 224
        && ((rect.width == 96 && rect.x % 96 == 0) || (rect.width == 64 && rect.x % 64 == 0))
}

fn checked_pixels(rect: &Rect, pixels: &[u16]) -> Result<usize, TrackerError> {
    let expected = rect.area() as usize;
    if pixels.len() < expected {
        return Err(TrackerError::ShortUpload {
            expected,
            actual: pixels.len(),
        });
    }
    Ok(expected)
}

impl TextureTracker {
    /// Tracks a CPU upload of `pixels` (row-major, `rect`-sized) into `rect`.
    pub fn upload(&mut self, rect: Rect, pixels: &[u16]) -> Result<(), TrackerError> {
        self.palette_hashes.clear();

        if rect.width == FB_WIDTH && rect.height == FB_HEIGHT {
            // Whole-VRAM loads are save-state restores, not textures.
            self.tracker.clear(rect);
            self.fused.mark_dead(&rect);
            return Ok(());
        }
        if rect.is_empty() {
            return Ok(());
        }
        let area = checked_pixels(&rect, pixels)?;
        let pixels = &pixels[..area];
        let hash = hash_pixels(pixels);

        let existing = self
            .uploads
            .get(&hash)
            .map(|upload| (upload.width, upload.height));
        let preexisting = match existing {
            Some(size) if size != (rect.width, rect.height) => {
                warn!(
                    "[tracker] hash collision for {:x}: {}x{} vs {}x{}",
                    hash, size.0, size.1, rect.width, rect.height
                );
                self.clear_region(rect);
                return Ok(());
            }
            Some(_) => true,
            None => {
                let dumpable = !self.dump_ignore.iter().any(|rule| rule.matches(&rect));
                self.uploads.insert(
                    hash,
                    TextureUpload {
                        hash,
                        width: rect.width,
                        height: rect.height,
                        pixels: pixels.to_vec(),
                        dumpable,
                        dumped_modes: Vec::new(),
                        textures: HashMap::new(),
                    },
                );
                false
            }
        };
        trace!("[tracker] upload {:x} at {:?}", hash, rect);

        let restore = self
            .restorable
            .iter()
            .find(|restorable| restorable.hash == hash && restorable.rect == rect)
            .map(|restorable| restorable.to_restore.clone());
        match restore {
            Some(to_restore) => {
                debug!("[tracker] restoring {:x} at {:?}", hash, rect);
                for texture in to_restore {
                    self.tracker.place(texture);
                }
            }
            None => self.tracker.upload(rect, hash),
        }
        self.fused.mark_dirty(&rect);
        self.fused.rebuild_dirty(&self.tracker, &self.uploads);

        if !preexisting {
            self.request_replacements(hash)?;
        }
        Ok(())
    }

    /// Tracks a VRAM to VRAM copy.
    pub fn blit(&mut self, dst: Rect, src: Rect) {
        trace!("[tracker] blit {:?} -> {:?}", src, dst);
        self.tracker.blit(dst, src);
        self.fused.mark_dirty(&dst);
        self.fused.rebuild_dirty(&self.tracker, &self.uploads);
        self.palette_hashes.clear();
    }

    /// Tracks a fill. Zero-sized fills are ignored.
    pub fn clear_region(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        trace!("[tracker] clear {:?}", rect);
        self.tracker.clear(rect);
        self.fused.mark_dead(&rect);
        self.palette_hashes.clear();
    }

    /// Remembers what backed `rect` when the CPU read it, so a later upload of the same
    /// pixels to the same place restores those rects instead of tracking a new upload.
    pub fn notify_readback(&mut self, rect: Rect, pixels: &[u16]) -> Result<(), TrackerError> {
        if is_fmv_readback(&rect) || rect.is_empty() {
            return Ok(());
        }
        let area = checked_pixels(&rect, pixels)?;
        let hash = hash_pixels(&pixels[..area]);

        self.restorable
            .retain(|restorable| !restorable.rect.intersects(&rect));
        let overlapping = self.tracker.overlapping(rect);
        let to_restore = overlapping
            .into_iter()
            .filter_map(|index| self.tracker.get(index))
            .filter_map(|texture| texture.clipped(&rect))
            .collect();
        self.restorable.push(RestorableRect {
            rect,
            hash,
            to_restore,
        });
        Ok(())
    }

    /// Queues loads for every replacement file of `hash`.
    pub(crate) fn request_replacements(&self, hash: u32) -> Result<(), TrackerError> {
        if !self.replace_enabled {
            return Ok(());
        }
        for (&(_, palette_hash), path) in self.known_files.range((hash, 0)..=(hash, u32::MAX)) {
            trace!("[tracker] requesting {:x}-{:x}", hash, palette_hash);
            self.io.send(IoRequest::Load {
                hash,
                palette_hash,
                path: path.clone(),
            })?;
        }
        Ok(())
    }
}
