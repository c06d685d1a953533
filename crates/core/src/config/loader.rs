use std::path::{Path, PathBuf};

use altec_common::config::SystemConfig;

use super::validation;

/// Complete ALTEC process configuration loaded from the config directory.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Parsed system.toml.
    pub system: SystemConfig,
    /// Base config directory path (kept around for future config reload).
    #[allow(dead_code)]
    pub config_dir: PathBuf,
}

/// Load configuration from the given config directory.
///
/// Fails loudly with clear error messages if anything is misconfigured — the process
/// refuses to start on validation failure.
pub fn load_config(config_dir: &Path) -> Result<CoreConfig, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "Loading configuration");

    let system_path = config_dir.join("system.toml");
    let system = load_system_config(&system_path)?;

    let config = CoreConfig {
        system,
        config_dir: config_dir.to_path_buf(),
    };

    validation::validate(&config)?;

    tracing::info!("Configuration loaded successfully");
    Ok(config)
}

fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for altec_common::AltecError {
    fn from(e: ConfigError) -> Self {
        altec_common::AltecError::Config(e.to_string())
    }
}
