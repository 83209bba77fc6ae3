use crate::capture::CameraSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pam-face/config.toml";
pub const DEFAULT_MODEL_PATH: &str = "/var/lib/pam-face/models.bin";
pub const DEFAULT_DETECTOR_MODEL_PATH: &str = "/usr/share/pam-face/scrfd_500m.onnx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Unknown module argument: {0}")]
    Argument(String),
}

/// Per-deployment settings read from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub global: GlobalConfig,
    pub authentication: AuthenticationConfig,
    /// Username to model label.
    #[serde(default)]
    pub users: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlobalConfig {
    pub camera: CameraSource,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationConfig {
    /// Maximum accepted distance, lower is more similar
    pub threshold: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "Timeout", default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    30
}

fn default_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load and validate configuration from a specific file path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::parse(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text without validating it
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.width == 0 || self.global.height == 0 {
            return Err(ConfigError::Validation(
                "Camera dimensions must be non-zero".to_string(),
            ));
        }

        if let CameraSource::Path(path) = &self.global.camera {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "Camera source cannot be empty".to_string(),
                ));
            }
        }

        if self.authentication.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "Max attempts must be greater than 0".to_string(),
            ));
        }

        if self.authentication.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Label assigned to `username`, if the user was added
    pub fn user_label(&self, username: &str) -> Option<i32> {
        self.users.get(username).copied()
    }
}

/// File locations and version the host module is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSettings {
    pub version: String,
    pub config_path: PathBuf,
    pub model_path: PathBuf,
    pub detector_model_path: PathBuf,
}

impl ModuleSettings {
    /// Apply `key=value` module arguments on top of the defaults.
    ///
    /// Recognized keys are `config`, `model` and `detector`.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| ConfigError::Argument(arg.to_string()))?;

            match key {
                "config" => settings.config_path = PathBuf::from(value),
                "model" => settings.model_path = PathBuf::from(value),
                "detector" => settings.detector_model_path = PathBuf::from(value),
                _ => return Err(ConfigError::Argument(arg.to_string())),
            }
        }

        Ok(settings)
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            detector_model_path: PathBuf::from(DEFAULT_DETECTOR_MODEL_PATH),
        }
    }
}
