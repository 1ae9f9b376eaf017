use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tch::nn::VarStore;
use tch::{CModule, Device, TchError, Tensor};

use super::engine::FusionInferenceEngine;
use super::fusion::FusionNet;
use super::handle::ModelHandle;
use crate::config::{ConfigError, FusionConfig, ModelConfig};

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("artifact {0} does not exist")]
    Missing(PathBuf),
    #[error("artifact {path} could not be read: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("artifact {path} is incompatible with the fusion architecture: {reason}")]
    Incompatible { path: PathBuf, reason: String },
}

#[derive(Debug)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub error: StrategyError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

fn summarize(failures: &[StrategyFailure]) -> String {
    if failures.is_empty() {
        return "no load strategies configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model unavailable: {}", summarize(.failures))]
    ModelUnavailable { failures: Vec<StrategyFailure> },
}

/// One way of turning an on-disk artifact into a ready [`ModelHandle`].
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn artifact(&self) -> &Path;

    fn load(&self, device: Device) -> Result<ModelHandle, StrategyError>;
}

fn ensure_exists(path: &Path) -> Result<(), StrategyError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StrategyError::Missing(path.to_path_buf()))
    }
}

fn verify(handle: &ModelHandle, path: &Path) -> Result<(), StrategyError> {
    FusionInferenceEngine::new()
        .blank_inference(handle)
        .map(|_| ())
        .map_err(|e| StrategyError::Incompatible {
            path: path.to_path_buf(),
            reason: format!("blank inference failed: {}", e),
        })
}

/// Loads a complete scripted model.
#[derive(Debug, Clone)]
pub struct TorchScriptStrategy {
    path: PathBuf,
    fusion: FusionConfig,
    verify: bool,
}

impl TorchScriptStrategy {
    pub fn new(path: impl Into<PathBuf>, fusion: FusionConfig, verify: bool) -> Self {
        Self {
            path: path.into(),
            fusion,
            verify,
        }
    }
}

impl LoadStrategy for TorchScriptStrategy {
    fn name(&self) -> &'static str {
        "torchscript"
    }

    fn artifact(&self) -> &Path {
        &self.path
    }

    fn load(&self, device: Device) -> Result<ModelHandle, StrategyError> {
        ensure_exists(&self.path)?;
        let mut module =
            CModule::load_on_device(&self.path, device).map_err(|e| StrategyError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        module.set_eval();

        let handle = ModelHandle::torchscript(module, device, &self.fusion, self.name(), &self.path)
            .map_err(|e| StrategyError::Incompatible {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if self.verify {
            verify(&handle, &self.path)?;
        }
        Ok(handle)
    }
}

/// Rebuilds the fusion network in code and fills it from a named weights file.
#[derive(Debug, Clone)]
pub struct RebuildFromWeightsStrategy {
    path: PathBuf,
    fusion: FusionConfig,
    verify: bool,
}

impl RebuildFromWeightsStrategy {
    pub fn new(path: impl Into<PathBuf>, fusion: FusionConfig, verify: bool) -> Self {
        Self {
            path: path.into(),
            fusion,
            verify,
        }
    }
}

impl LoadStrategy for RebuildFromWeightsStrategy {
    fn name(&self) -> &'static str {
        "rebuild_from_weights"
    }

    fn artifact(&self) -> &Path {
        &self.path
    }

    fn load(&self, device: Device) -> Result<ModelHandle, StrategyError> {
        ensure_exists(&self.path)?;
        let mut vars = VarStore::new(device);
        let net = FusionNet::new(&vars.root(), &self.fusion);
        self.fill(&vars)?;
        vars.freeze();

        let handle = ModelHandle::native(net, vars, &self.fusion, self.name(), &self.path);
        if self.verify {
            verify(&handle, &self.path)?;
        }
        Ok(handle)
    }
}

impl RebuildFromWeightsStrategy {
    fn read_saved(&self) -> Result<HashMap<String, Tensor>, TchError> {
        let named = match self.path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Tensor::read_safetensors(&self.path)?,
            _ => Tensor::load_multi(&self.path)?,
        };
        Ok(named.into_iter().collect())
    }

    /// Copies every saved tensor into the store after checking that each
    /// variable is present with the same shape.
    fn fill(&self, vars: &VarStore) -> Result<(), StrategyError> {
        let incompatible = |reason: String| StrategyError::Incompatible {
            path: self.path.clone(),
            reason,
        };
        let saved = self.read_saved().map_err(|e| StrategyError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut variables = vars.variables();
        for (name, var) in variables.iter_mut() {
            let src = saved
                .get(name)
                .ok_or_else(|| incompatible(format!("no tensor named '{}'", name)))?;
            if src.size() != var.size() {
                return Err(incompatible(format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    name,
                    src.size(),
                    var.size()
                )));
            }
            tch::no_grad(|| var.f_copy_(src)).map_err(|e| StrategyError::Corrupt {
                path: self.path.clone(),
                reason: format!("{}: {}", name, e),
            })?;
        }
        Ok(())
    }
}

/// Produces the shared model handle, trying each strategy in order until one
/// succeeds. The first success is cached for the life of the loader; failures
/// are not, so a later call retries from the top.
pub struct ModelLoader {
    strategies: Vec<Box<dyn LoadStrategy>>,
    device: Device,
    cached: Mutex<Option<Arc<ModelHandle>>>,
}

impl ModelLoader {
    pub fn new(device: Device) -> Self {
        Self {
            strategies: Vec::new(),
            device,
            cached: Mutex::new(None),
        }
    }

    pub fn with_strategy(mut self, strategy: impl LoadStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Primary scripted artifact first, then the weights rebuild.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.device()?)
            .with_strategy(TorchScriptStrategy::new(
                &config.primary_artifact,
                config.fusion,
                config.verify_on_load,
            ))
            .with_strategy(RebuildFromWeightsStrategy::new(
                &config.weights_artifact,
                config.fusion,
                config.verify_on_load,
            )))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn acquire(&self) -> Result<Arc<ModelHandle>, LoadError> {
        // Held across the load so concurrent first callers wait for one load.
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = cached.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            log::info!(
                "Loading model with strategy '{}' from {} on {:?}",
                strategy.name(),
                strategy.artifact().display(),
                self.device
            );
            match strategy.load(self.device) {
                Ok(handle) => {
                    let meta = handle.metadata();
                    log::info!(
                        "Model loaded via '{}': {}, {} parameters ({} trainable)",
                        strategy.name(),
                        meta.architecture(),
                        meta.total_parameters,
                        meta.trainable_parameters
                    );
                    let handle = Arc::new(handle);
                    *cached = Some(Arc::clone(&handle));
                    return Ok(handle);
                }
                Err(error) => {
                    log::warn!("Strategy '{}' failed: {}", strategy.name(), error);
                    failures.push(StrategyFailure {
                        strategy: strategy.name(),
                        error,
                    });
                }
            }
        }

        let error = LoadError::ModelUnavailable { failures };
        log::error!("{}", error);
        Err(error)
    }
}
