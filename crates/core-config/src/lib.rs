//! Configuration loading and parsing.
//!
//! Parses `darkroom.toml` (or an override path provided by the caller)
//! into cache sizing, thumbnail, and sidecar settings. Unknown fields are
//! ignored (TOML deserialization tolerance) so the file can grow without
//! breaking older builds; a parse error falls back to defaults rather
//! than refusing to start. All values are clamped to safe ranges by
//! [`Config::apply_limits`], with a log line whenever a value moved.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

/// Memory budget bounds for the pixel caches, in bytes.
pub const MIN_CACHE_MEMORY: u64 = 100 << 20;
pub const MAX_CACHE_MEMORY: u64 = 2 << 30;

/// The five budget shares the cache memory splits into (four pre-sized
/// tiers plus the float tier).
pub const CACHE_SHARES: u64 = 5;

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Total pixel-cache memory in bytes, split evenly across the tiers.
    #[serde(default = "CacheConfig::default_memory")]
    pub memory: u64,
    /// Width of the background worker pool.
    #[serde(default = "CacheConfig::default_worker_threads")]
    pub worker_threads: u32,
}

impl CacheConfig {
    const fn default_memory() -> u64 {
        512 << 20
    }
    const fn default_worker_threads() -> u32 {
        4
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: Self::default_memory(),
            worker_threads: Self::default_worker_threads(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThumbnailConfig {
    #[serde(default = "ThumbnailConfig::default_width")]
    pub width: u32,
    #[serde(default = "ThumbnailConfig::default_height")]
    pub height: u32,
    /// JPEG quality of the on-disk thumbnail snapshot.
    #[serde(default = "ThumbnailConfig::default_snapshot_quality")]
    pub snapshot_quality: u8,
    /// Always render thumbnails through the pipeline, never from the
    /// preview embedded in the file.
    #[serde(default)]
    pub never_use_embedded: bool,
}

impl ThumbnailConfig {
    const fn default_width() -> u32 {
        1280
    }
    const fn default_height() -> u32 {
        1024
    }
    const fn default_snapshot_quality() -> u8 {
        90
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            snapshot_quality: Self::default_snapshot_quality(),
            never_use_embedded: false,
        }
    }
}

/// When edited records sync their sidecar file.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SidecarMode {
    /// On every write release.
    #[default]
    Safe,
    /// Deferred to shutdown.
    Relaxed,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SidecarConfig {
    #[serde(default)]
    pub mode: SidecarMode,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub raw: Option<String>, // original file string (optional)
    pub file: ConfigFile,    // parsed (or default) data
    /// Clamped values; meaningful after [`Config::apply_limits`].
    pub effective: EffectiveLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub cache_memory: u64,
    pub worker_threads: u32,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub snapshot_quality: u8,
}

/// Best-effort config path following platform conventions (XDG / AppData
/// Roaming): prefer a local `darkroom.toml`, then the platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("darkroom.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("darkroom").join("darkroom.toml");
    }
    // Final fallback relative filename.
    PathBuf::from("darkroom.toml")
}

/// Directory for derived data (the thumbnail snapshot file).
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("darkroom"))
        .unwrap_or_else(|| PathBuf::from(".darkroom-cache"))
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(Config {
                raw: Some(content),
                file,
                effective: EffectiveLimits::default(), // computed later
            }),
            Err(_e) => {
                // On parse error fall back to defaults rather than refusing
                // to start; the bad file is left in place for the user.
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}

/// Round up to a multiple of 16 so the value survives halving three times
/// down the tier ladder.
fn round_to_16(v: u32) -> u32 {
    if v & 0xf != 0 { (v & !0xf) + 0x10 } else { v }
}

impl Config {
    /// Clamp every raw value to its documented range and record the
    /// effective set. Returns the computed limits.
    pub fn apply_limits(&mut self) -> EffectiveLimits {
        let cache_memory = self
            .file
            .cache
            .memory
            .clamp(MIN_CACHE_MEMORY, MAX_CACHE_MEMORY);
        let worker_threads = self.file.cache.worker_threads.clamp(1, 8);
        let thumbnail_width = round_to_16(self.file.thumbnails.width.clamp(32, 2048));
        let thumbnail_height = round_to_16(self.file.thumbnails.height.clamp(32, 2048));
        let snapshot_quality = self.file.thumbnails.snapshot_quality.clamp(10, 100);

        let effective = EffectiveLimits {
            cache_memory,
            worker_threads,
            thumbnail_width,
            thumbnail_height,
            snapshot_quality,
        };
        if cache_memory != self.file.cache.memory
            || worker_threads != self.file.cache.worker_threads
            || thumbnail_width != self.file.thumbnails.width
            || thumbnail_height != self.file.thumbnails.height
            || snapshot_quality != self.file.thumbnails.snapshot_quality
        {
            info!(
                target: "config",
                raw_memory = self.file.cache.memory,
                cache_memory,
                raw_threads = self.file.cache.worker_threads,
                worker_threads,
                thumbnail_width,
                thumbnail_height,
                snapshot_quality,
                "config_values_clamped"
            );
        }
        self.effective = effective;
        effective
    }

    /// Byte budget of one pixel-cache tier.
    pub fn memory_per_tier(&self) -> u64 {
        self.effective.cache_memory / CACHE_SHARES
    }
}
