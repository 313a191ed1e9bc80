//! Configuration management for the capture pipeline.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use crate::types::ScopeKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub dataset: DatasetConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            storage: StorageConfig::default(),
            capture: CaptureConfig::default(),
            dedup: DedupConfig::default(),
            dataset: DatasetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the pipeline is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding region geometry
    #[serde(default = "default_region_db")]
    pub region_db: PathBuf,

    /// Optional `(site, style, table_id)` scope; when set, the same label
    /// resolves to different geometries per poker-room layout
    #[serde(default)]
    pub scope: Option<ScopeKey>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region_db: default_region_db(),
            scope: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Tick period in seconds
    #[serde(default = "default_capture_interval")]
    pub interval_seconds: u64,

    /// Directory where region crops are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_capture_interval(),
            output_dir: default_output_dir(),
        }
    }
}

/// Which duplicate-detection strategy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Structural pixel similarity (SSIM), no model required
    Structural,
    /// Feature-vector cosine distance
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_strategy")]
    pub strategy: DedupStrategy,

    /// SSIM score above which an image counts as a duplicate
    #[serde(default = "default_structural_threshold")]
    pub structural_threshold: f64,

    /// Cosine distance below which an image counts as a duplicate
    #[serde(default = "default_embedding_threshold")]
    pub embedding_threshold: f32,

    /// Seconds between dedup sweeps over the output directory
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Path to an external feature-extraction model (embedding strategy).
    /// When set but unreadable, the pipeline falls back to the structural
    /// strategy.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: default_dedup_strategy(),
            structural_threshold: default_structural_threshold(),
            embedding_threshold: default_embedding_threshold(),
            sweep_interval_seconds: default_sweep_interval(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Root of the labeled dataset directory tree
    #[serde(default = "default_dataset_root")]
    pub dataset_root: PathBuf,

    /// Labels routed to deletion instead of the dataset tree
    #[serde(default = "default_reject_labels")]
    pub reject_labels: Vec<String>,

    /// External classifier binary; routing is disabled when unset
    #[serde(default)]
    pub classifier_command: Option<PathBuf>,

    /// Seconds between classify-and-route passes
    #[serde(default = "default_route_interval")]
    pub route_interval_seconds: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_root: default_dataset_root(),
            reject_labels: default_reject_labels(),
            classifier_command: None,
            route_interval_seconds: default_route_interval(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capture_interval() -> u64 {
    1
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_route_interval() -> u64 {
    15
}

fn default_dedup_strategy() -> DedupStrategy {
    DedupStrategy::Structural
}

fn default_structural_threshold() -> f64 {
    0.97
}

fn default_embedding_threshold() -> f32 {
    0.03
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("region-capture")
}

fn default_region_db() -> PathBuf {
    data_dir().join("regions.db")
}

fn default_output_dir() -> PathBuf {
    data_dir().join("captures")
}

fn default_dataset_root() -> PathBuf {
    data_dir().join("dataset")
}

fn default_reject_labels() -> Vec<String> {
    vec![
        "cartes_retournees".to_string(),
        "cartes_combinees_retournees".to_string(),
        "non_cartes".to_string(),
    ]
}

/// Where the effective configuration came from. Loading happens before the
/// tracing subscriber exists, so the outcome is returned for the caller to
/// log rather than logged here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from this file
    File(PathBuf),
    /// No file at this path; defaults in effect
    Missing(PathBuf),
    /// File exists but failed to parse; defaults in effect
    Invalid { path: PathBuf, error: String },
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> (Self, ConfigOrigin) {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path. Never fails: a missing or
    /// invalid file yields defaults, with the outcome in the returned
    /// [`ConfigOrigin`].
    pub fn load_from_path(path: PathBuf) -> (Self, ConfigOrigin) {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigOrigin::File(path)),
                Err(e) => (
                    Self::default(),
                    ConfigOrigin::Invalid {
                        path,
                        error: e.to_string(),
                    },
                ),
            },
            Err(_) => (Self::default(), ConfigOrigin::Missing(path)),
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("region-capture")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
