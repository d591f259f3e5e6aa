//! Manager configuration.
//!
//! Loaded from `config.json` in the storage root when present; every field
//! has a default so a partial file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash_tree::TreeGeometry;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid JSON for [`PinWeaverConfig`].
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// The violated bound.
        reason: String,
    },
}

/// Tunables for the manager and the software backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PinWeaverConfig {
    /// Label bits consumed per tree level (fan-out is `2^bits_per_level`).
    pub bits_per_level: u8,
    /// Number of tree levels.
    pub height: u8,
    /// Entries kept in the software backend's replay log.
    pub log_capacity: usize,
    /// Attempts at persisting a leaf after the backend accepted an update.
    pub store_retries: usize,
    /// Pause between persistence attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for PinWeaverConfig {
    fn default() -> Self {
        let geometry = TreeGeometry::default();
        Self {
            bits_per_level: geometry.bits_per_level,
            height: geometry.height,
            log_capacity: 2,
            store_retries: 3,
            retry_delay_ms: 10,
        }
    }
}

impl PinWeaverConfig {
    /// Tree geometry described by this config.
    #[must_use]
    pub const fn geometry(&self) -> TreeGeometry {
        TreeGeometry {
            bits_per_level: self.bits_per_level,
            height: self.height,
        }
    }

    /// Checks every bound.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry()
            .validate()
            .map_err(|reason| ConfigError::Invalid { reason })?;
        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "log_capacity must be at least 1".to_string(),
            });
        }
        if self.store_retries == 0 {
            return Err(ConfigError::Invalid {
                reason: "store_retries must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Loads and validates `path`, falling back to defaults if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds
    /// out-of-range values.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                serde_json::from_str::<Self>(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PinWeaverConfig::load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, PinWeaverConfig::default());
        assert_eq!(config.geometry(), TreeGeometry::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"height": 4, "log_capacity": 5}"#).unwrap();

        let config = PinWeaverConfig::load_or_default(&path).unwrap();
        assert_eq!(config.height, 4);
        assert_eq!(config.log_capacity, 5);
        assert_eq!(config.bits_per_level, 2);
        assert_eq!(config.store_retries, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"bits_per_level": 4, "height": 9}"#).unwrap();
        assert!(matches!(
            PinWeaverConfig::load_or_default(&path),
            Err(ConfigError::Invalid { .. })
        ));

        std::fs::write(&path, r#"{"heigth": 4}"#).unwrap();
        assert!(matches!(
            PinWeaverConfig::load_or_default(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
