//! Configuration module for the acquisition pipeline
//!
//! Configuration is loaded from a TOML file. Every section and field has a
//! default so that an empty file (or no file at all) yields a usable
//! configuration.
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! let page_size = config.storage.page_size;
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::decoder::WireVariant;
use crate::emulator::EmulatorConfig;
use crate::storage::PrefetchBias;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub decoder: DecoderConfig,
    pub spike_filter: SpikeFilterConfig,
    pub trigger: TriggerConfig,
    pub folding: FoldingConfig,
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a file if it exists, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.session.samples_per_second > 0.0) {
            return Err(ConfigError::invalid(
                "session.samples_per_second",
                "must be positive",
            ));
        }
        if self.storage.page_size == 0 {
            return Err(ConfigError::invalid("storage.page_size", "must be positive"));
        }
        if self.storage.write_pages == 0 || self.storage.read_pages == 0 {
            return Err(ConfigError::invalid(
                "storage.write_pages/read_pages",
                "must keep at least one page resident",
            ));
        }
        if self.folding.max_elements < 2 || self.folding.max_elements % 2 != 0 {
            return Err(ConfigError::invalid(
                "folding.max_elements",
                format!("must be an even number >= 2, got {}", self.folding.max_elements),
            ));
        }
        if self.decoder.resync_window == 0 {
            return Err(ConfigError::invalid("decoder.resync_window", "must be positive"));
        }
        if self.trigger.enabled {
            let window = crate::trigger::window_size(self.trigger.length_ms, self.sampling_period_us());
            if window >= self.trigger.buffer_len {
                return Err(ConfigError::invalid(
                    "trigger.buffer_len",
                    format!(
                        "must exceed the {window}-sample window, got {}",
                        self.trigger.buffer_len
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Sampling period in microseconds
    pub fn sampling_period_us(&self) -> f64 {
        crate::common::sampling_period_us(self.session.samples_per_second)
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Session-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sample rate of the session log
    pub samples_per_second: f64,
    /// Directory that receives session.raw and the sidecar files
    pub output_dir: PathBuf,
    /// Rates considered when inferring the rate of a bare log
    pub supported_rates: Vec<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            samples_per_second: 100_000.0,
            output_dir: PathBuf::from("./session"),
            supported_rates: crate::session::SUPPORTED_RATES.to_vec(),
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Paged log settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Page size in bytes
    pub page_size: usize,
    /// Pages kept resident behind the write pointer
    pub write_pages: usize,
    /// Pages kept resident around the last read
    pub read_pages: usize,
    /// Direction in which the read cache prefetches
    pub prefetch_bias: PrefetchBias,
    /// Attempts made for a failed disk task before it is dropped
    pub io_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: 60 * 1024, // multiple of the 6-byte record
            write_pages: 16,
            read_pages: 32,
            prefetch_bias: PrefetchBias::Center,
            io_retries: 3,
        }
    }
}

// =============================================================================
// Decoder Configuration
// =============================================================================

/// Protocol decoder settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Wire variant of the probe
    pub variant: WireVariant,
    /// Out-of-sequence frames held before a gap is declared
    pub resync_window: usize,
    /// Lost-sample count at which a loss warning is raised (edge-triggered)
    pub loss_threshold: u64,
    /// Supply voltage in millivolts used by calibration
    pub vdd_mv: u16,
    /// Period of averaged samples on the escaped-burst variant
    pub average_period_us: f64,
    /// Period of burst samples on the escaped-burst variant
    pub burst_period_us: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            variant: WireVariant::FixedFrame,
            resync_window: 4,
            loss_threshold: 500,
            vdd_mv: 3000,
            average_period_us: 130.0,
            burst_period_us: 13.0,
        }
    }
}

/// Spike filter coefficients
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpikeFilterConfig {
    /// Smoothing coefficient of the rolling average
    pub alpha: f64,
    /// Smoothing coefficient of the top-range rolling average
    pub alpha5: f64,
    /// Samples replaced by the rolling average after a range switch
    pub samples: u32,
}

impl Default for SpikeFilterConfig {
    fn default() -> Self {
        Self {
            alpha: 0.18,
            alpha5: 0.06,
            samples: 3,
        }
    }
}

// =============================================================================
// Trigger / Folding Configuration
// =============================================================================

/// Trigger engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Enable trigger mode
    pub enabled: bool,
    /// Soft trigger level in microamperes
    pub level_ua: f32,
    /// Window length in milliseconds
    pub length_ms: f64,
    /// Pre/post trigger offset in microseconds
    pub offset_us: f64,
    /// Stop after the first window
    pub single_shot: bool,
    /// Length of the circular trigger buffer in samples
    pub buffer_len: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level_ua: 1000.0,
            length_ms: 10.0,
            offset_us: 0.0,
            single_shot: false,
            buffer_len: 1 << 24,
        }
    }
}

/// Folding buffer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FoldingConfig {
    /// Slots kept per min/max array
    pub max_elements: usize,
}

impl Default for FoldingConfig {
    fn default() -> Self {
        Self {
            max_elements: crate::folding::DEFAULT_MAX_ELEMENTS,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
