//! Persistent configuration for the capture core, loaded from and saved to
//! a platform config directory the way the reference project's
//! `ConfigManager` does: a missing file gets defaults written to it, a
//! corrupt file falls back to defaults (and those defaults are persisted
//! back over the corrupt copy).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::resampler::{AudioDesc, SampleFormat};

/// Persistent application configuration for the capture core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub output: OutputSettings,
    pub target: TargetSettings,
    pub buffering: BufferingSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub sample_rate: u32,
    pub channels: usize,
    pub output_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSettings {
    /// `"<exe_name>:<pid>"`, see [`crate::process_target::TargetProcess`].
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingSettings {
    pub ring_buffer_size: usize,
    pub ring_wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output: OutputSettings::default(),
            target: TargetSettings::default(),
            buffering: BufferingSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self { sample_rate: 48_000, channels: 2, output_frames: 480 }
    }
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self { selector: None }
    }
}

impl Default for BufferingSettings {
    fn default() -> Self {
        Self { ring_buffer_size: 1024 * 1024, ring_wait_timeout_ms: 100 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

impl CaptureConfig {
    pub fn out_desc(&self) -> AudioDesc {
        AudioDesc::new(self.output.sample_rate, SampleFormat::F32, self.output.channels)
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: CaptureConfig,
}

impl ConfigManager {
    pub fn with_config(config: CaptureConfig) -> Self {
        Self { config_path: PathBuf::from("fallback_config.toml"), config }
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;
        Ok(Self { config_path, config })
    }

    pub fn get_config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: CaptureConfig) -> Result<()> {
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        Self::save_config_to_path(&self.config, &self.config_path)
    }

    fn load_or_create_config(config_path: &PathBuf) -> Result<CaptureConfig> {
        if config_path.exists() {
            info!("loading configuration from: {:?}", config_path);
            let config_str = fs::read_to_string(config_path).context("failed to read configuration file")?;

            match toml::from_str::<CaptureConfig>(&config_str) {
                Ok(config) => {
                    info!("configuration loaded successfully");
                    Ok(config)
                }
                Err(e) => {
                    warn!("failed to parse configuration file: {e}. using defaults.");
                    let default_config = CaptureConfig::default();
                    if let Err(save_err) = Self::save_config_to_path(&default_config, config_path) {
                        warn!("failed to save default configuration: {save_err}");
                    }
                    Ok(default_config)
                }
            }
        } else {
            info!("no configuration file found, creating default configuration");
            let default_config = CaptureConfig::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &CaptureConfig, path: &PathBuf) -> Result<()> {
        let config_str = toml::to_string_pretty(config).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path, config_str).context("failed to write configuration file")?;
        info!("configuration saved to: {:?}", path);
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("procap")
        } else {
            let home_dir = dirs::home_dir().context("could not determine home directory")?;
            home_dir.join(".procap")
        };
        Ok(config_dir.join("config.toml"))
    }
}
