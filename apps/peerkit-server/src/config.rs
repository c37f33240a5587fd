use std::path::{Path, PathBuf};

use peerkit_core::Config;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "configs/peerkit.toml";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("failed to load config {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("invalid environment override: {0}")]
    Env(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Effective configuration and the file it came from, if any.
#[derive(Debug, Clone)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) source: Option<PathBuf>,
}

/// `PEERKIT_CONFIG` when set, otherwise the default path when it exists.
fn discover() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("PEERKIT_CONFIG").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    default.exists().then(|| default.to_path_buf())
}

/// File (or built-in defaults), then `PEERKIT_*` overrides, then validation.
pub(crate) fn load_effective() -> Result<LoadedConfig, ConfigError> {
    let source = discover();
    let mut config = match &source {
        Some(path) => {
            let display = path.display().to_string();
            peerkit_core::load_config(&display).map_err(|err| ConfigError::Load {
                path: display.clone(),
                reason: format!("{err:#}"),
            })?
        }
        None => Config::default(),
    };
    config
        .apply_env_overrides()
        .map_err(|err| ConfigError::Env(format!("{err:#}")))?;
    config
        .validate()
        .map_err(|err| ConfigError::Invalid(format!("{err:#}")))?;
    Ok(LoadedConfig { config, source })
}
