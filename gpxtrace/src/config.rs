//! Runtime configuration, passed explicitly into every entry point.

use crate::error::{Result, TraceError};
use crate::extract::{NativeExtractor, SandboxedExtractor};
use crate::import::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ingestion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Legacy on-disk location of original uploads.
    pub trace_dir: PathBuf,
    /// Legacy on-disk location of rendered pictures and icons.
    pub image_dir: PathBuf,
    /// Points per bulk insert (default: 1000)
    pub import_batch_size: usize,
    /// Wall-clock limit for archive extraction (default: 30s)
    pub extract_timeout_ms: u64,
    /// Cap on decompressed output (default: 512 MiB)
    pub max_extracted_bytes: u64,
    pub render: RenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("traces"),
            image_dir: PathBuf::from("images"),
            import_batch_size: DEFAULT_BATCH_SIZE,
            extract_timeout_ms: 30_000,
            max_extracted_bytes: 512 * 1024 * 1024,
            render: RenderConfig::default(),
        }
    }
}

impl Config {
    /// Parse JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(TraceError::InvalidUserInput {
                message: message.to_string(),
            })
        };
        if self.import_batch_size == 0 {
            return invalid("importBatchSize must be positive");
        }
        if self.render.picture_size == 0 || self.render.icon_size == 0 {
            return invalid("image sizes must be positive");
        }
        if self.render.frames == 0 {
            return invalid("frames must be positive");
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    /// Timeout-bounded extractor built from these settings.
    pub fn extractor(&self) -> SandboxedExtractor {
        SandboxedExtractor::new(
            NativeExtractor::new(self.max_extracted_bytes),
            self.extract_timeout(),
        )
    }
}

/// Picture and icon rendering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfig {
    /// Side of the square animated picture in pixels (default: 250)
    pub picture_size: u32,
    /// Side of the square icon in pixels (default: 50)
    pub icon_size: u32,
    /// Animation frames (default: 10)
    pub frames: u32,
    pub frame_delay_ms: u32,
    /// Pixels kept clear around the track
    pub padding: u32,
    pub background_color: [u8; 4],
    /// Full track, drawn under the highlight
    pub track_color: [u8; 4],
    pub highlight_color: [u8; 4],
    pub highlight_width: f32,
    pub icon_color: [u8; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            picture_size: 250,
            icon_size: 50,
            frames: 10,
            frame_delay_ms: 500,
            padding: 2,
            background_color: [255, 255, 255, 255],
            track_color: [187, 187, 187, 255],
            highlight_color: [0, 0, 0, 255],
            highlight_width: 3.0,
            icon_color: [0, 0, 0, 255],
        }
    }
}
