use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_VIEWPORT_WIDTH: f32 = 1280.0;
const DEFAULT_VIEWPORT_HEIGHT: f32 = 800.0;

pub const CONFIG_ENV_VAR: &str = "FRONTIER_TRANSITION_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read transition config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid transition config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: DEFAULT_VIEWPORT_WIDTH,
            height: DEFAULT_VIEWPORT_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Upper bound on how long the pipeline waits for author extensions.
    pub timeout_ms: u64,
    pub viewport: Viewport,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            viewport: Viewport::default(),
        }
    }
}

impl TransitionConfig {
    /// Load from `config_path`, falling back to defaults when no path is given
    /// or the file does not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };

        config.validate()
    }

    /// Load using `FRONTIER_TRANSITION_CONFIG`, then the per-user config
    /// directory.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .ok()
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::load(path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if !(self.viewport.width > 0.0 && self.viewport.height > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "viewport must be positive, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        Ok(self)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "Frontier", "FrontierBrowser").map(|dirs| {
        let mut path = dirs.config_dir().to_path_buf();
        path.push("transitions.yaml");
        path
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = TransitionConfig::load(None).unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(4_000));
        assert_eq!(config.viewport, Viewport::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config =
            TransitionConfig::load(Some(PathBuf::from("/nonexistent/transitions.yaml"))).unwrap();
        assert_eq!(config, TransitionConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms: 2500\nviewport:\n  width: 640").unwrap();
        let config = TransitionConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.timeout_ms, 2_500);
        assert_eq!(config.viewport.width, 640.0);
        assert_eq!(config.viewport.height, DEFAULT_VIEWPORT_HEIGHT);
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms: 0").unwrap();
        let err = TransitionConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms: [not, a, number]").unwrap();
        let err = TransitionConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
