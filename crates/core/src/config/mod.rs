use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, SoundstageError};

/// Presets that look broken or strobe badly when picked unattended.
pub const DEFAULT_ROTATION_DENY_LIST: [&str; 3] = [
    "Martin - mucus cervix",
    "Martin - fruit machine",
    "Milk Artist At our Best - FED - SlowFast Ft AdamFX n Martin - HD CosmoFX",
];

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub presets: PresetConfig,
    pub render: RenderConfig,
    pub input: InputConfig,
    pub demo: DemoConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Sections that are missing fall back
    /// to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.presets.rotation_interval_secs == 0 {
            return Err(SoundstageError::msg(
                "presets.rotation_interval_secs must be greater than zero",
            ));
        }
        if self.presets.auto_transition_secs <= 0.0 {
            return Err(SoundstageError::msg(
                "presets.auto_transition_secs must be positive",
            ));
        }
        if self.render.fps == 0 {
            return Err(SoundstageError::msg("render.fps must be greater than zero"));
        }
        if self.audio.block_size < 2 {
            return Err(SoundstageError::msg("audio.block_size must be at least 2"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Number of samples the visualiser pulls from the active producer per frame.
    pub block_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
        }
    }
}

/// Preset catalog and rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetConfig {
    /// JSON catalog file; the built-in catalog is used when absent.
    pub catalog: Option<PathBuf>,
    /// Preset loaded at startup. Defaults to the first catalog entry.
    pub initial: Option<String>,
    pub rotation_interval_secs: u64,
    pub manual_transition_secs: f32,
    pub auto_transition_secs: f32,
    pub deny_list: Vec<String>,
}

impl PresetConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            catalog: None,
            initial: None,
            rotation_interval_secs: 25,
            manual_transition_secs: 2.0,
            auto_transition_secs: 2.0,
            deny_list: DEFAULT_ROTATION_DENY_LIST
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl RenderConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Device opened by `live` when none is given on the command line.
    pub default_device: Option<String>,
}

/// Parameters of the headless backends used by the command line demo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Length every decoded file is treated as having.
    pub track_secs: f32,
    /// Simulated capture devices as `(id, label)` pairs.
    pub devices: Vec<(String, String)>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            track_secs: 10.0,
            devices: vec![
                ("mic-0".to_string(), "Built-in Microphone".to_string()),
                ("line-1".to_string(), "Line In".to_string()),
            ],
        }
    }
}
