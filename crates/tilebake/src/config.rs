//! Batch configuration, loaded from JSON with every field defaulted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::spikes::SpikeParams;

/// Settings shared by the `despike` and `split` stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub spike: SpikeParams,
    /// Concurrent files in the spike stage.
    pub despike_workers: usize,
    /// Concurrent files in the split stage.
    pub split_workers: usize,
    /// Extension of tile files picked up by discovery (without the dot).
    pub tile_extension: String,
    /// Extension appended to a tile's name for its compressed artifact.
    pub compressed_extension: String,
    /// zlib level, 0..=10.
    pub compression_level: u8,
    /// Grid cell edge used by the split stage.
    pub cell_size: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            spike: SpikeParams::default(),
            despike_workers: 32,
            split_workers: 6,
            tile_extension: "bin".to_owned(),
            compressed_extension: tilemesh::ZLIB_EXTENSION.to_owned(),
            compression_level: 9,
            cell_size: 1000.0,
        }
    }
}

impl BatchConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: BatchConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spike.validate()?;

        if self.despike_workers == 0 || self.split_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be at least 1".to_owned()));
        }

        if !(self.cell_size > 0.0 && self.cell_size.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "cell_size must be a positive number, got {}",
                self.cell_size
            )));
        }

        if self.compression_level > 10 {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be within 0..=10, got {}",
                self.compression_level
            )));
        }

        for (name, ext) in [
            ("tile_extension", &self.tile_extension),
            ("compressed_extension", &self.compressed_extension),
        ] {
            if ext.is_empty() || ext.starts_with('.') {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a bare extension such as \"bin\", got {:?}",
                    name, ext
                )));
            }
        }

        Ok(())
    }
}
