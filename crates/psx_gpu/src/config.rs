//! Renderer options loaded from TOML.

use std::path::{Path, PathBuf};

use gpu_runtime::GpuDevice;
use renderer::{Renderer, ScanoutFilter};
use serde::{Deserialize, Serialize};
use texture_tracker::TrackerConfig;

const NTSC_LAST_SCANLINE: i32 = 239;
const PAL_LAST_SCANLINE: i32 = 287;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Where primitive dithering happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherMode {
    /// Dither at console resolution, so the pattern scales with the framebuffer.
    #[default]
    Native,
    /// Dither at the internal resolution.
    Internal,
    /// Ignore the primitive dither bit.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Requested upscaling factor, a power of two up to 16.
    pub internal_resolution: u32,
    pub adaptive_smoothing: bool,
    pub super_sampling: bool,
    pub dither_mode: DitherMode,
    pub crop_overscan: bool,
    pub image_offset_cycles: i32,
    pub initial_scanline: i32,
    pub last_scanline: i32,
    pub initial_scanline_pal: i32,
    pub last_scanline_pal: i32,
    /// Scan out 24-bit content with the YUV-aware filter.
    pub mdec_yuv: bool,
    pub texture_replacement: TrackerConfig,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            internal_resolution: 1,
            adaptive_smoothing: true,
            super_sampling: false,
            dither_mode: DitherMode::Native,
            crop_overscan: false,
            image_offset_cycles: 0,
            initial_scanline: 0,
            last_scanline: NTSC_LAST_SCANLINE,
            initial_scanline_pal: 0,
            last_scanline_pal: PAL_LAST_SCANLINE,
            mdec_yuv: false,
            texture_replacement: TrackerConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_scanlines(
    field: &'static str,
    first: i32,
    last: i32,
    max: i32,
) -> Result<(), ConfigError> {
    if !(0..=max).contains(&first) || !(0..=max).contains(&last) {
        return Err(invalid(field, format!("{first}..={last} is outside 0..={max}")));
    }
    if first > last {
        return Err(invalid(field, format!("first scanline {first} is after last {last}")));
    }
    Ok(())
}

impl GpuConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GpuConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scale = self.internal_resolution;
        if !scale.is_power_of_two() || scale > 16 {
            return Err(invalid(
                "internal_resolution",
                format!("{scale} is not one of 1, 2, 4, 8, 16"),
            ));
        }
        check_scanlines(
            "scanlines",
            self.initial_scanline,
            self.last_scanline,
            NTSC_LAST_SCANLINE,
        )?;
        check_scanlines(
            "pal scanlines",
            self.initial_scanline_pal,
            self.last_scanline_pal,
            PAL_LAST_SCANLINE,
        )?;
        let replacement = &self.texture_replacement;
        if (replacement.dump || replacement.replace) && replacement.game_name.is_empty() {
            return Err(invalid(
                "texture_replacement.game_name",
                "required when dumping or replacing",
            ));
        }
        Ok(())
    }

    /// Scanout filter: supersampling wins over the MDEC filter.
    pub fn display_filter(&self) -> ScanoutFilter {
        if self.super_sampling {
            ScanoutFilter::Ssaa
        } else if self.mdec_yuv {
            ScanoutFilter::MdecYuv
        } else {
            ScanoutFilter::None
        }
    }

    pub fn texture_tracking_enabled(&self) -> bool {
        self.texture_replacement.dump || self.texture_replacement.replace
    }

    pub(crate) fn apply<D: GpuDevice>(&self, renderer: &mut Renderer<D>) {
        renderer.set_adaptive_smoothing(self.adaptive_smoothing);
        renderer.set_display_filter(self.display_filter());
        renderer.set_dither_native_resolution(self.dither_mode == DitherMode::Native);
        renderer.set_horizontal_overscan_cropping(self.crop_overscan);
        renderer.set_horizontal_offset_cycles(self.image_offset_cycles);
        renderer.set_visible_scanlines(
            self.initial_scanline,
            self.last_scanline,
            self.initial_scanline_pal,
            self.last_scanline_pal,
        );
    }
}
