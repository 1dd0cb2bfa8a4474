//! Per-frame maintenance, reloads and save states.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vram_model::Rect;

use crate::rect_tracker::{DumpedMode, TextureRect, TextureUpload};
use crate::{RestorableRect, TextureTracker, TrackerError, read_texture_directory};

/// Frames between hit-ratio reports.
const STATS_INTERVAL: u64 = 300;

/// Upload contents without loaded replacements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    pub hash: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    pub dumpable: bool,
    pub dumped_modes: Vec<DumpedMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorableState {
    pub rect: Rect,
    pub hash: u32,
    pub to_restore: Vec<TextureRect>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackerSaveState {
    pub uploads: Vec<UploadState>,
    pub rects: Vec<TextureRect>,
    pub restorable: Vec<RestorableState>,
}

/// Replacements must scale the upload by the same power of two it was drawn at, per axis.
fn is_valid_scale(replacement: u32, original: u32) -> bool {
    original != 0 && replacement % original == 0 && (replacement / original).is_power_of_two()
}

impl TextureTracker {
    /// Call when no handle is held any more. Compacts dead rects and pages and installs
    /// replacements decoded since the last call.
    pub fn on_queues_reset(&mut self) -> Result<(), TrackerError> {
        self.cache.clear();
        self.tracker.release_dead_handles();
        self.release_unreferenced_uploads();

        for response in self.io.drain()? {
            let Some(upload) = self.uploads.get_mut(&response.hash) else {
                continue;
            };
            if upload.textures.contains_key(&response.palette_hash) {
                continue;
            }
            let (width, height) = (response.image.width(), response.image.height());
            if !is_valid_scale(width, upload.width) || !is_valid_scale(height, upload.height) {
                warn!(
                    "[tracker] dimension mismatch for {:x}-{:x}, original {}x{}, replacement {}x{}",
                    response.hash,
                    response.palette_hash,
                    upload.width,
                    upload.height,
                    width,
                    height
                );
                continue;
            }
            debug!(
                "[tracker] replacement {:x}-{:x} ready ({:?})",
                response.hash, response.palette_hash, response.image.alpha_flags
            );
            upload
                .textures
                .insert(response.palette_hash, Arc::new(response.image));
            let touched: Vec<Rect> = self
                .tracker
                .live()
                .filter(|(_, texture)| texture.upload == response.hash)
                .map(|(_, texture)| texture.vram_rect)
                .collect();
            for rect in &touched {
                self.fused.mark_dirty(rect);
            }
        }

        self.fused.rebuild_dirty(&self.tracker, &self.uploads);
        self.fused.remove_dead();
        Ok(())
    }

    fn release_unreferenced_uploads(&mut self) {
        let referenced: BTreeSet<u32> = self
            .tracker
            .referenced_uploads()
            .chain(
                self.restorable
                    .iter()
                    .flat_map(|restorable| restorable.to_restore.iter().map(|texture| texture.upload)),
            )
            .collect();
        self.uploads.retain(|hash, _| referenced.contains(hash));
    }

    pub fn end_frame(&mut self) {
        self.frame += 1;
        if self.frame % STATS_INTERVAL == 0
            && let Some(ratio) = self.cache.take_hit_ratio()
        {
            debug!("[tracker] handle cache hit ratio {:.3}", ratio);
        }
    }

    /// Switches replacement sampling. Enabling requests replacements for every tracked
    /// upload that has none loaded yet.
    pub fn set_replacement_enabled(&mut self, enable: bool) -> Result<(), TrackerError> {
        debug!("[tracker] replacements {}", if enable { "on" } else { "off" });
        let was_enabled = self.replace_enabled;
        self.replace_enabled = enable;
        self.cache.clear();
        if enable && !was_enabled {
            let pending: Vec<u32> = self
                .uploads
                .values()
                .filter(|upload| upload.textures.is_empty())
                .map(|upload| upload.hash)
                .collect();
            for hash in pending {
                self.request_replacements(hash)?;
            }
        }
        Ok(())
    }

    /// Rescans the replacement directory and reloads every replacement of a tracked upload.
    pub fn reload_from_disk(&mut self) -> Result<(), TrackerError> {
        self.known_files = read_texture_directory(&self.config.replacements_dir())?;
        info!("[tracker] {} replacement textures found", self.known_files.len());

        for upload in self.uploads.values_mut() {
            upload.textures.clear();
        }
        self.fused.mark_dead(&Rect::FULL_VRAM);
        self.cache.clear();

        let hashes: Vec<u32> = self.uploads.keys().copied().collect();
        for hash in hashes {
            self.request_replacements(hash)?;
        }
        Ok(())
    }

    pub fn save_state(&self) -> TrackerSaveState {
        let mut uploads: Vec<UploadState> = self
            .uploads
            .values()
            .map(|upload| UploadState {
                hash: upload.hash,
                width: upload.width,
                height: upload.height,
                pixels: upload.pixels.clone(),
                dumpable: upload.dumpable,
                dumped_modes: upload.dumped_modes.clone(),
            })
            .collect();
        uploads.sort_by_key(|upload| upload.hash);
        TrackerSaveState {
            uploads,
            rects: self.tracker.live().map(|(_, texture)| *texture).collect(),
            restorable: self
                .restorable
                .iter()
                .map(|restorable| RestorableState {
                    rect: restorable.rect,
                    hash: restorable.hash,
                    to_restore: restorable.to_restore.clone(),
                })
                .collect(),
        }
    }

    /// Replaces all tracking state and requests replacements for the restored uploads.
    pub fn load_state(&mut self, state: &TrackerSaveState) -> Result<(), TrackerError> {
        self.tracker.reset();
        self.fused.clear();
        self.cache.clear();
        self.palette_hashes.clear();

        self.uploads = state
            .uploads
            .iter()
            .map(|upload| {
                let restored = TextureUpload {
                    hash: upload.hash,
                    width: upload.width,
                    height: upload.height,
                    pixels: upload.pixels.clone(),
                    dumpable: upload.dumpable,
                    dumped_modes: upload.dumped_modes.clone(),
                    textures: HashMap::new(),
                };
                (upload.hash, restored)
            })
            .collect();

        for texture in &state.rects {
            if !self.uploads.contains_key(&texture.upload) {
                warn!("[tracker] save state rect references missing upload {:x}", texture.upload);
                continue;
            }
            self.tracker.place(*texture);
        }
        self.restorable = state
            .restorable
            .iter()
            .map(|restorable| RestorableRect {
                rect: restorable.rect,
                hash: restorable.hash,
                to_restore: restorable
                    .to_restore
                    .iter()
                    .filter(|texture| self.uploads.contains_key(&texture.upload))
                    .copied()
                    .collect(),
            })
            .collect();

        let hashes: Vec<u32> = self.uploads.keys().copied().collect();
        for hash in hashes {
            self.request_replacements(hash)?;
        }
        Ok(())
    }
}
