//! HD texture replacement overlay.
//!
//! The tracker mirrors every CPU upload, VRAM blit, clear and readback so it knows which
//! upload backs each VRAM region. Uploads are identified by the CRC32 of their pixels and
//! matched against `{hash:x}-{palette_hash:x}.png` files in the replacement directory.
//! Lookups hand out [`HdTextureHandle`]s that stay valid until the next
//! [`TextureTracker::on_queues_reset`].
//!
//! - `rect_tracker`: upload ownership of VRAM regions plus a coarse lookup grid.
//! - `fused_pages`: composites for texture pages spanning several replacements.
//! - `io_worker`: background decode and dump thread.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vram_model::{Rect, TextureMode};

mod dump_config;
mod fused_pages;
mod handle_cache;
mod image_ops;
mod io_worker;
mod rect_tracker;
mod tracker_frame;
mod tracker_lookup;
mod tracker_vram;

pub use dump_config::{RectMatch, parse_dump_config};
pub use image_ops::{
    AlphaFlags, HdImage, convert_to_psx, dump_rgba, generate_mip, load_replacement,
    prepare_levels,
};
pub use rect_tracker::{DumpedMode, RectTracker, TextureRect, TextureUpload};
pub use tracker_frame::{RestorableState, TrackerSaveState, UploadState};

use fused_pages::FusedPages;
use handle_cache::HandleLruCache;
use io_worker::IoWorker;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn texture io thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("texture io thread disconnected")]
    WorkerDisconnected,
    #[error("upload needs {expected} pixels, got {actual}")]
    ShortUpload { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Write every sampled upload as PNG to the dump directory.
    pub dump: bool,
    /// Sample replacements from the replacement directory.
    pub replace: bool,
    pub directory: PathBuf,
    pub game_name: String,
}

impl TrackerConfig {
    pub fn replacements_dir(&self) -> PathBuf {
        self.directory
            .join(format!("{}-texture-replacements", self.game_name))
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.directory.join(format!("{}-texture-dump", self.game_name))
    }
}

/// Result of a replacement lookup. Handles are invalidated by `on_queues_reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HdTextureHandle {
    #[default]
    None,
    /// One tracked rect sampled with one palette.
    Rect { index: usize, palette_hash: u32 },
    /// A composite of several replacements within one texture page.
    Fused { page: usize },
}

impl HdTextureHandle {
    pub fn is_none(&self) -> bool {
        *self == HdTextureHandle::None
    }

    pub(crate) fn palette_hash(&self) -> Option<u32> {
        match *self {
            HdTextureHandle::Rect { palette_hash, .. } => Some(palette_hash),
            HdTextureHandle::None | HdTextureHandle::Fused { .. } => None,
        }
    }
}

/// Texture mode and CLUT position a primitive samples with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsedMode {
    pub mode: TextureMode,
    pub palette_offset_x: u32,
    pub palette_offset_y: u32,
}

impl UsedMode {
    pub fn palette_rect(&self) -> Rect {
        Rect::new(
            self.palette_offset_x,
            self.palette_offset_y,
            self.mode.palette_width(),
            1,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdLookup {
    pub handle: HdTextureHandle,
    /// The replacement fully covers the sampled area and has no transparent texels.
    pub fastpath_capable: bool,
    pub cache_hit: bool,
}

/// A replacement image and the VRAM area it stands in for.
#[derive(Debug, Clone)]
pub struct HdTexture {
    pub vram_rect: Rect,
    /// Region of `image` covering `vram_rect`, in replacement texels.
    pub texel_rect: Rect,
    pub image: Arc<HdImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RestorableRect {
    pub rect: Rect,
    pub hash: u32,
    pub to_restore: Vec<TextureRect>,
}

pub struct TextureTracker {
    config: TrackerConfig,
    known_files: BTreeMap<(u32, u32), PathBuf>,
    dump_ignore: Vec<RectMatch>,
    tracker: RectTracker,
    uploads: HashMap<u32, TextureUpload>,
    restorable: Vec<RestorableRect>,
    fused: FusedPages,
    cache: HandleLruCache,
    palette_hashes: Vec<(Rect, u32)>,
    io: IoWorker,
    placeholder: Arc<HdImage>,
    frame: u64,
    replace_enabled: bool,
    fastpath_enabled: bool,
}

impl TextureTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, TrackerError> {
        let known_files = read_texture_directory(&config.replacements_dir())?;
        info!("[tracker] {} replacement textures found", known_files.len());

        let dump_dir = config.dump_dir();
        let dump_ignore = read_dump_config(&dump_dir.join("dump.cfg"))?;
        for rule in &dump_ignore {
            debug!("[tracker] not dumping uploads matching {:?}", rule);
        }
        if config.dump {
            std::fs::create_dir_all(&dump_dir).map_err(|source| TrackerError::Io {
                path: dump_dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            replace_enabled: config.replace,
            config,
            known_files,
            dump_ignore,
            tracker: RectTracker::default(),
            uploads: HashMap::new(),
            restorable: Vec::new(),
            fused: FusedPages::default(),
            cache: HandleLruCache::default(),
            palette_hashes: Vec::new(),
            io: IoWorker::spawn()?,
            placeholder: Arc::new(HdImage::placeholder()),
            frame: 0,
            fastpath_enabled: true,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn replacement_enabled(&self) -> bool {
        self.replace_enabled
    }

    pub fn set_fastpath_enabled(&mut self, enable: bool) {
        self.fastpath_enabled = enable;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn live_rects(&self) -> usize {
        self.tracker.live().count()
    }

    pub fn fused_pages(&self) -> usize {
        self.fused.len()
    }

    pub fn upload_info(&self, hash: u32) -> Option<&TextureUpload> {
        self.uploads.get(&hash)
    }

    /// Blocks until pending loads and dumps are finished. Loaded replacements still
    /// become visible at the next `on_queues_reset`.
    pub fn sync_io(&self) -> Result<(), TrackerError> {
        self.io.sync()
    }
}

/// CRC32 of the pixels as little-endian bytes.
pub fn hash_pixels(pixels: &[u16]) -> u32 {
    let bytes: Vec<u8> = pixels.iter().flat_map(|pixel| pixel.to_le_bytes()).collect();
    let mut crc = flate2::Crc::new();
    crc.update(&bytes);
    crc.sum()
}

/// `{hash:x}-{palette_hash:x}.png` entries of `dir`. A missing directory has none.
pub fn read_texture_directory(dir: &Path) -> Result<BTreeMap<(u32, u32), PathBuf>, TrackerError> {
    let io_error = |source: std::io::Error| TrackerError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(error) => return Err(io_error(error)),
    };
    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(io_error)?;
        let name = entry.file_name();
        let Some(key) = name.to_str().and_then(parse_texture_file_name) else {
            continue;
        };
        files.insert(key, entry.path());
    }
    Ok(files)
}

fn parse_texture_file_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(".png")?;
    let (hash, palette_hash) = stem.split_once('-')?;
    let hex = |text: &str| {
        let valid = !text.is_empty() && text.len() <= 8 && text.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| u32::from_str_radix(text, 16).ok()).flatten()
    };
    Some((hex(hash)?, hex(palette_hash)?))
}

fn read_dump_config(path: &Path) -> Result<Vec<RectMatch>, TrackerError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_dump_config(&text)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(TrackerError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
