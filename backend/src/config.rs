use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

pub const DEFAULT_CONFIG_PATH: &str = "config/service.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub preprocessing: PreprocessingConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub allowed_origins: Vec<String>,
    pub allow_degraded_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            workers: 4,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
            allow_degraded_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub max_upload_bytes: usize,
    /// Decoded width times height; checked from the image header.
    pub max_image_pixels: u64,
    pub blur_sigma: f32,
    pub resize_method: String,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            max_image_pixels: 40_000_000,
            blur_sigma: 10.0,
            resize_method: "triangle".to_string(),
        }
    }
}

impl PreprocessingConfig {
    pub fn filter(&self) -> Result<FilterType, ConfigError> {
        match self.resize_method.to_ascii_lowercase().as_str() {
            "nearest" => Ok(FilterType::Nearest),
            "triangle" | "bilinear" | "linear" => Ok(FilterType::Triangle),
            "catmullrom" | "cubic" => Ok(FilterType::CatmullRom),
            "gaussian" => Ok(FilterType::Gaussian),
            "lanczos3" => Ok(FilterType::Lanczos3),
            other => Err(ConfigError::Invalid {
                field: "preprocessing.resize_method",
                reason: format!("unknown resize method '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub primary_artifact: PathBuf,
    pub weights_artifact: PathBuf,
    pub device: String,
    pub verify_on_load: bool,
    pub fusion: FusionConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary_artifact: PathBuf::from("models/fusion_dr_model.pt"),
            weights_artifact: PathBuf::from("models/fusion_dr_model.safetensors"),
            device: "auto".to_string(),
            verify_on_load: true,
            fusion: FusionConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn device(&self) -> Result<Device, ConfigError> {
        match self.device.to_ascii_lowercase().as_str() {
            "auto" => Ok(Device::cuda_if_available()),
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(ordinal)) => Ok(Device::Cuda(ordinal)),
                _ => Err(ConfigError::Invalid {
                    field: "model.device",
                    reason: format!("unknown device '{}'", other),
                }),
            },
        }
    }
}

/// Width parameters of the fusion network. They must match the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub projection_channels: i64,
    pub hidden_units: i64,
    pub dropout: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            projection_channels: 512,
            hidden_units: 256,
            dropout: 0.5,
        }
    }
}

impl ServiceConfig {
    /// Reads `DR_CONFIG` (or the default path) through [`ServiceConfig::load_from`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Reads `path`, falling back to defaults when the file is absent, then
    /// applies environment overrides and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            log::info!("Loading service config from {}", path.display());
            Self::from_file(path)?
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Invalid {
                field: "PORT",
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(path) = lookup("DR_PRIMARY_ARTIFACT") {
            self.model.primary_artifact = PathBuf::from(path);
        }
        if let Some(path) = lookup("DR_WEIGHTS_ARTIFACT") {
            self.model.weights_artifact = PathBuf::from(path);
        }
        if let Some(device) = lookup("DR_DEVICE") {
            self.model.device = device;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preprocessing.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "preprocessing.max_upload_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.preprocessing.max_image_pixels == 0 {
            return Err(ConfigError::Invalid {
                field: "preprocessing.max_image_pixels",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(self.preprocessing.blur_sigma.is_finite() && self.preprocessing.blur_sigma > 0.0) {
            return Err(ConfigError::Invalid {
                field: "preprocessing.blur_sigma",
                reason: format!("{} is not a positive sigma", self.preprocessing.blur_sigma),
            });
        }
        self.preprocessing.filter()?;
        self.model.device()?;

        let fusion = &self.model.fusion;
        if fusion.projection_channels <= 0 || fusion.hidden_units <= 0 {
            return Err(ConfigError::Invalid {
                field: "model.fusion",
                reason: "layer widths must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&fusion.dropout) {
            return Err(ConfigError::Invalid {
                field: "model.fusion.dropout",
                reason: format!("{} is outside [0, 1)", fusion.dropout),
            });
        }
        Ok(())
    }
}
