//! Configuration loading and validation for fc-core.
//!
//! This module handles:
//! - Loading `config.toml`
//! - Config resolution order (explicit path > env > XDG > defaults)
//! - Semantic validation (worker counts, probe sizes, xattr namespace)

mod validation;

pub use validation::{validate_config, ValidationError};

use crate::logging::event_names;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "fscompat";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FC_CONFIG";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Semantic validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl From<ConfigError> for fc_common::Error {
    fn from(err: ConfigError) -> Self {
        fc_common::Error::Config(err.to_string())
    }
}

/// Impersonation worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpersonationConfig {
    /// Dedicated OS threads serving impersonated operations.
    pub workers: usize,
    /// Compare each worker's credentials against its start-up snapshot
    /// after every job.
    pub verify_restore: bool,
}

impl Default for ImpersonationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            verify_restore: true,
        }
    }
}

/// Quirk probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuirkConfig {
    /// Id of the preallocation classifier.
    pub fallocate_classifier: String,
    /// Bytes requested by the preallocation probe.
    pub probe_len_bytes: u64,
    pub probe_fallocate: bool,
    pub probe_xattr: bool,
    /// Attribute written by the xattr probe; must be in the `user.` namespace.
    pub xattr_name: String,
}

impl Default for QuirkConfig {
    fn default() -> Self {
        Self {
            fallocate_classifier: crate::quirks::DEFAULT_CLASSIFIER.to_string(),
            probe_len_bytes: 1 << 20,
            probe_fallocate: true,
            probe_xattr: true,
            xattr_name: "user.fscompat.probe".to_string(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsCompatConfig {
    pub schema_version: String,
    pub impersonation: ImpersonationConfig,
    pub quirks: QuirkConfig,
}

impl Default for FsCompatConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            impersonation: ImpersonationConfig::default(),
            quirks: QuirkConfig::default(),
        }
    }
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: FsCompatConfig,
    /// Path the configuration was read from (None if using defaults).
    pub path: Option<PathBuf>,
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
    /// Explicit config directory, replacing the XDG lookup.
    pub config_dir: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit path (via ConfigOptions)
/// 2. Environment variable (FC_CONFIG)
/// 3. XDG config home (~/.config/fscompat/config.toml)
/// 4. Built-in defaults
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    load_config_with_env(options, |key| std::env::var(key).ok())
}

fn load_config_with_env(
    options: &ConfigOptions,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig, ConfigError> {
    let resolved = match resolve_config_path(options, &env) {
        Some(path) => {
            let config = load_config_from_file(&path)?;
            ResolvedConfig {
                config,
                path: Some(path),
            }
        }
        None => ResolvedConfig {
            config: FsCompatConfig::default(),
            path: None,
        },
    };

    validate_config(&resolved.config)?;
    debug!(
        target: event_names::CONFIG_LOADED,
        path = ?resolved.path,
        workers = resolved.config.impersonation.workers,
        classifier = %resolved.config.quirks.fallocate_classifier,
        "configuration loaded"
    );
    Ok(resolved)
}

/// Explicit and env paths must exist; the XDG path is used only if present.
fn resolve_config_path(
    options: &ConfigOptions,
    env: &impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(path) = &options.config_path {
        return Some(path.clone());
    }

    if let Some(path) = env(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }

    let dir = options.config_dir.clone().unwrap_or_else(|| {
        env("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config")
            })
            .join(CONFIG_DIR_NAME)
    });
    let default_path = dir.join(CONFIG_FILE_NAME);
    default_path.exists().then_some(default_path)
}

/// Load configuration from a specific file.
pub fn load_config_from_file(path: &Path) -> Result<FsCompatConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::IoError {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let config: FsCompatConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Check schema version
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(ConfigError::VersionMismatch {
            expected: CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    Ok(config)
}
