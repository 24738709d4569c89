//! `emds` Configuration Module
//!
//! Provides configuration file support via `emds.toml`, environment variables, and
//! runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (constructed directly with [`Config`])
//! 2. Environment variables (`EMDS_*`)
//! 3. Configuration file (`emds.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file or environment overrides.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },

    /// IO error while reading a configuration file.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Mapped-file growth configuration: `new_size = size + size * numerator / denominator`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    /// Numerator of the growth fraction (default 1, paired with `denominator: 2` gives
    /// the spec's x1.5 growth).
    pub numerator: u64,
    /// Denominator of the growth fraction.
    pub denominator: u64,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 2,
        }
    }
}

/// Map-container configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Initial bucket count (must be a power of two).
    pub initial_buckets: u64,
    /// Initial size, in bytes, of a freshly created `keys.bin`/`values.bin`.
    pub initial_data_size: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 65_536,
            initial_data_size: 64 * 1024,
        }
    }
}

/// Sequence-container configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Initial size, in bytes, of a freshly created `values.bin`.
    pub initial_data_size: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            initial_data_size: 64 * 1024,
        }
    }
}

/// Top-level configuration for `emds` containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mapped-file growth policy.
    pub growth: GrowthConfig,
    /// Map-specific defaults.
    pub map: MapConfig,
    /// Sequence-specific defaults.
    pub sequence: SequenceConfig,
    /// Whether to flush mapped regions to disk on close.
    pub sync_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            growth: GrowthConfig::default(),
            map: MapConfig::default(),
            sequence: SequenceConfig::default(),
            sync_on_close: true,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional `emds.toml` file, and `EMDS_*`
    /// environment variables, in that priority order (later sources win).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but fails to parse, or if an
    /// environment override cannot be deserialized into the expected shape.
    pub fn load<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path.as_ref()));
        }

        figment = figment.merge(Env::prefixed("EMDS_").split("_"));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Returns the default configuration without consulting any file or environment.
    #[must_use]
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Validates this configuration, returning an error describing the first violated
    /// constraint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a bucket count is not a power of two, or
    /// if the growth denominator is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map.initial_buckets == 0 || !self.map.initial_buckets.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                key: "map.initial_buckets".to_string(),
                message: "must be a nonzero power of two".to_string(),
            });
        }
        if self.growth.denominator == 0 {
            return Err(ConfigError::InvalidValue {
                key: "growth.denominator".to_string(),
                message: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    /// Serializes this configuration as a pretty-printed `emds.toml` document, suitable
    /// for writing out a starting-point config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
