//! Configuration for the scan tools
//!
//! Loaded from a TOML file; every section and field has a default.
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! let mask = config.decoder.default_mask()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::builder::BuilderConfig;
use crate::correlator::{CorrelatorConfig, ProcessorConfig};
use crate::decoder::{DecodeError, ListModeMask};
use crate::emulator::EmulatorConfig;
use crate::unpacker::UnpackerConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid list-mode mask: {0}")]
    Mask(#[from] DecodeError),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub unpacker: UnpackerConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.decoder.default_mask()?;
        for module in &self.decoder.modules {
            module.mask()?;
        }
        if self.builder.event_width <= 0.0 {
            return Err(invalid("builder.event_width", "must be positive"));
        }
        if self.correlator.correlation_window <= 0.0 {
            return Err(invalid("correlator.correlation_window", "must be positive"));
        }
        if self.socket.max_words < 2 {
            return Err(invalid("socket.max_words", "must hold the end-of-spill marker"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Input / Output
// =============================================================================

fn default_max_spill_words() -> usize {
    250_000
}

/// Input selection
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// .ldf file opened at startup
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Largest spill accepted from a file, in words
    #[serde(default = "default_max_spill_words")]
    pub max_spill_words: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_spill_words: default_max_spill_words(),
        }
    }
}

fn default_prefix() -> String {
    "run".to_string()
}

fn default_title() -> String {
    "pixie-scan".to_string()
}

fn default_run_number() -> u32 {
    1
}

fn default_max_file_size_mb() -> u64 {
    2048
}

/// Output of accepted spills and correlation reports
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory for .ldf output; no spills are written when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// File name prefix (`<prefix>_<run>.ldf`)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Run title stored in the HEAD buffer
    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_run_number")]
    pub run_number: u32,

    /// Maximum file size in MB before a continuation file is opened
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// JSON-lines file for flagged correlation chains
    #[serde(default)]
    pub reports: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: default_prefix(),
            title: default_title(),
            run_number: default_run_number(),
            max_file_size_mb: default_max_file_size_mb(),
            reports: None,
        }
    }
}

impl OutputConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

// =============================================================================
// Socket
// =============================================================================

fn default_port() -> u16 {
    5555
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_target() -> String {
    "127.0.0.1:5555".to_string()
}

/// Datagram transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    /// Receive port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-datagram receive timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Largest reassembled spill, in words
    #[serde(default = "default_max_spill_words")]
    pub max_words: usize,
    /// Destination used by the emulator
    #[serde(default = "default_target")]
    pub target: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            max_words: default_max_spill_words(),
            target: default_target(),
        }
    }
}

impl SocketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Decoder
// =============================================================================

fn default_firmware() -> String {
    "R30474".to_string()
}

fn default_frequency() -> u32 {
    250
}

/// Firmware and sampling frequency of the modules
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_firmware")]
    pub firmware: String,
    /// Sampling frequency in MHz
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    /// Modules that differ from the defaults
    #[serde(default)]
    pub modules: Vec<ModuleDecoderConfig>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            firmware: default_firmware(),
            frequency: default_frequency(),
            modules: Vec::new(),
        }
    }
}

impl DecoderConfig {
    pub fn default_mask(&self) -> Result<ListModeMask, ConfigError> {
        Ok(ListModeMask::from_config(&self.firmware, self.frequency)?)
    }
}

/// Per-module firmware override
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDecoderConfig {
    pub module: u32,
    pub firmware: String,
    pub frequency: u32,
}

impl ModuleDecoderConfig {
    pub fn mask(&self) -> Result<ListModeMask, ConfigError> {
        Ok(ListModeMask::from_config(&self.firmware, self.frequency)?)
    }
}
