//! Pipeline configuration
//!
//! Settings are loaded from a TOML file, with every field optional in the
//! file (missing keys fall back to defaults) and the whole struct validated
//! before use. Resolution order for the file location:
//! 1. Explicit path (command line)
//! 2. `SEGUE_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/segue/config.toml` or equivalent)
//! 4. Compiled defaults

use crate::fade_curves::FadeCurve;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Repeat policy for the sequencer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Cycle through the playlist indefinitely
    RepeatAll,
    /// Play the same track over and over
    RepeatOne,
    /// Play each track once, then stop
    NoRepeat,
}

impl std::fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepeatMode::RepeatAll => write!(f, "repeat_all"),
            RepeatMode::RepeatOne => write!(f, "repeat_one"),
            RepeatMode::NoRepeat => write!(f, "no_repeat"),
        }
    }
}

/// Pipeline settings
///
/// Accepted at session start and live via the control surface. Output format
/// fields (`sample_rate`, `channels`) are fixed once the device stream is
/// open; the rest apply to clips prepared after the change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Output sample rate in Hz (44100, 48000, 96000, or 192000)
    pub sample_rate: u32,

    /// Output channel count (1 or 2)
    pub channels: u16,

    /// Clip length in seconds; 0 plays each track in full
    pub clip_length_secs: f64,

    /// Crossfade duration in seconds (clamped to half the clip at selection)
    pub crossfade_secs: f64,

    /// Minimum prepared lookahead ahead of the playback cursor, in seconds
    pub prebuffer_secs: f64,

    /// Maximum concurrent download/decode workers
    pub max_workers: usize,

    /// Shuffle play order
    pub shuffle: bool,

    /// Repeat policy
    pub repeat: RepeatMode,

    /// Shuffle history window size; 0 derives max(2, playlist_len / 3)
    pub shuffle_history: usize,

    /// Envelope shape for fades and crossfades
    pub fade_curve: FadeCurve,

    /// Gain trim applied to every clip, in dB
    pub volume_adjustment_db: f32,

    /// Peak limiter threshold (0.0, 1.0]
    pub limiter_threshold: f32,

    /// Per-request download timeout in seconds
    pub download_timeout_secs: u64,

    /// Retry attempts per download before the failure propagates
    pub download_retries: u32,

    /// Directory holding the audio cache (index database + payload files)
    pub cache_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            clip_length_secs: 30.0,
            crossfade_secs: 4.0,
            prebuffer_secs: 12.0,
            max_workers: 4,
            shuffle: false,
            repeat: RepeatMode::RepeatAll,
            shuffle_history: 0,
            fade_curve: FadeCurve::EqualPower,
            volume_adjustment_db: -3.0,
            limiter_threshold: 0.97,
            download_timeout_secs: 30,
            download_retries: 3,
            cache_dir: default_cache_dir(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file and validate them
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load from the resolved location, falling back to defaults
    ///
    /// An explicit path that fails to load is an error; a missing file at
    /// the implicit locations is not.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var("SEGUE_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let default_path = default_config_path();
        if default_path.exists() {
            return Self::load(&default_path);
        }

        info!("No config file found, using defaults");
        let settings = Self::default();
        settings.validate()?;
        Ok(settings)
    }

    /// Write settings back out as TOML
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure every field is within its acceptable range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if ![44100, 48000, 96000, 192000].contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(
                "sample_rate must be 44100, 48000, 96000, or 192000".into(),
            ));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::Invalid("channels must be 1 or 2".into()));
        }
        if self.clip_length_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "clip_length_secs must be non-negative".into(),
            ));
        }
        if self.crossfade_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "crossfade_secs must be non-negative".into(),
            ));
        }
        if self.clip_length_secs > 0.0 && self.crossfade_secs > self.clip_length_secs / 2.0 {
            return Err(ConfigError::Invalid(
                "crossfade_secs must not exceed half the clip length".into(),
            ));
        }
        if self.prebuffer_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "prebuffer_secs must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.limiter_threshold <= 0.0 || self.limiter_threshold > 1.0 {
            return Err(ConfigError::Invalid(
                "limiter_threshold must be within (0.0, 1.0]".into(),
            ));
        }
        if self.download_retries == 0 {
            return Err(ConfigError::Invalid(
                "download_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Configured clip length; `None` means full-song playback
    pub fn clip_length(&self) -> Option<Duration> {
        if self.clip_length_secs > 0.0 {
            Some(Duration::from_secs_f64(self.clip_length_secs))
        } else {
            None
        }
    }

    /// Crossfade duration
    pub fn crossfade(&self) -> Duration {
        Duration::from_secs_f64(self.crossfade_secs)
    }

    /// Prebuffer threshold
    pub fn prebuffer(&self) -> Duration {
        Duration::from_secs_f64(self.prebuffer_secs)
    }

    /// Linear gain factor for the configured dB trim
    pub fn gain_factor(&self) -> f32 {
        10f32.powf(self.volume_adjustment_db / 20.0)
    }
}

/// Platform default for the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("segue").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("segue.toml"))
}

/// Platform default for the audio cache
pub fn default_cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("segue").join("cache"))
        .unwrap_or_else(|| PathBuf::from("segue_cache"))
}
