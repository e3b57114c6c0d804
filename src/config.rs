use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid setting `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Every knob the curation pipeline reads. Passed by value into
/// [`crate::pipeline::curate`]; nothing here is global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurateConfig {
    /// Similarity a neighbor needs to join a cluster in the collection-wide pass.
    pub global_threshold: f32,
    /// Tighter threshold for the per-group refinement pass.
    pub group_threshold: f32,
    /// Neighbors fetched per query (K).
    pub fan_out: usize,
    /// Upper bound on members per cluster (M).
    pub max_cluster_size: usize,
    pub one_off_max: usize,
    pub small_max: usize,
    pub min_reps: usize,
    pub max_reps: usize,
    /// Backfill seed. `None` draws a fresh seed, which the manifest records.
    pub seed: Option<u64>,
    /// Numeric suffixes tried before a destination name collision gives up.
    pub max_name_attempts: usize,
    /// Also place every selection in a single flat folder.
    pub flat_collection: bool,
}

impl Default for CurateConfig {
    fn default() -> Self {
        Self {
            global_threshold: 0.965,
            group_threshold: 0.955,
            fan_out: 50,
            max_cluster_size: 4,
            one_off_max: 5,
            small_max: 14,
            min_reps: 15,
            max_reps: 50,
            seed: None,
            max_name_attempts: 1000,
            flat_collection: false,
        }
    }
}

impl CurateConfig {
    /// Read a TOML file. Fields it omits keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Explicit path if given, else `<config_dir>/cullset/config.toml` when it
    /// exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_toml_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_toml_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("global_threshold", self.global_threshold),
            ("group_threshold", self.group_threshold),
        ] {
            if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("{} is outside [-1, 1]", value),
                });
            }
        }
        if self.fan_out == 0 {
            return Err(ConfigError::Invalid {
                field: "fan_out",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_cluster_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_cluster_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.one_off_max > self.small_max {
            return Err(ConfigError::Invalid {
                field: "one_off_max",
                message: format!(
                    "{} exceeds small_max ({})",
                    self.one_off_max, self.small_max
                ),
            });
        }
        if self.min_reps == 0 || self.min_reps > self.max_reps {
            return Err(ConfigError::Invalid {
                field: "min_reps",
                message: format!(
                    "must be in 1..={} (max_reps), got {}",
                    self.max_reps, self.min_reps
                ),
            });
        }
        if self.max_name_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_name_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cullset").join("config.toml"))
}
