use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tch::nn::VarStore;
use tch::{CModule, Device, Tensor};

use super::backbones::BackboneKind;
use super::engine::InferenceFailure;
use super::fusion::{mean_branch_weights, ForwardError, FusionNet};
use crate::config::FusionConfig;
use crate::vision::{INPUT_CHANNELS, INPUT_SIZE};
use shared::{ArtifactInfo, DrGrade, ModelInfoResponse};

pub const MODEL_NAME: &str = "Fusion DR Detection Model";

enum Network {
    TorchScript(CModule),
    Native { net: FusionNet, _vars: VarStore },
}

/// Descriptive facts about a loaded model.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub branches: [BackboneKind; 3],
    pub projection_channels: i64,
    /// Every stored tensor, batch-norm running statistics included.
    pub total_parameters: u64,
    pub trainable_parameters: u64,
    /// Mean normalized fusion weight per branch, when the artifact exposes it.
    pub branch_weights: Option<Vec<f32>>,
    pub strategy: &'static str,
    pub artifact: PathBuf,
}

impl ModelMetadata {
    pub fn architecture(&self) -> String {
        let names: Vec<&str> = self.branches.iter().map(|b| b.display_name()).collect();
        format!("{} with Attention", names.join(" + "))
    }
}

/// A fully constructed fusion model, ready for inference. Shared read-only
/// between requests.
pub struct ModelHandle {
    network: Network,
    device: Device,
    metadata: ModelMetadata,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.network {
            Network::TorchScript(_) => "torchscript",
            Network::Native { .. } => "native",
        };
        f.debug_struct("ModelHandle")
            .field("network", &kind)
            .field("device", &self.device)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl ModelHandle {
    /// Wraps a natively rebuilt network together with the store owning its
    /// parameters.
    pub fn native(
        net: FusionNet,
        vars: VarStore,
        config: &FusionConfig,
        strategy: &'static str,
        artifact: &Path,
    ) -> Self {
        let total_parameters = vars.variables().values().map(|t| t.numel() as u64).sum();
        let trainable_parameters = vars
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as u64)
            .sum();
        let branch_weights = Some(mean_branch_weights(net.fusion_weights()));
        let metadata = ModelMetadata {
            branches: net.branch_kinds(),
            projection_channels: config.projection_channels,
            total_parameters,
            trainable_parameters,
            branch_weights,
            strategy,
            artifact: artifact.to_path_buf(),
        };
        Self {
            device: vars.device(),
            network: Network::Native { net, _vars: vars },
            metadata,
        }
    }

    /// Wraps a scripted module. Counts and fusion weights are read from the
    /// module's named parameters; a scripted module does not expose its
    /// buffers, so both counts are the parameter total.
    pub fn torchscript(
        module: CModule,
        device: Device,
        config: &FusionConfig,
        strategy: &'static str,
        artifact: &Path,
    ) -> Result<Self, tch::TchError> {
        let params = module.named_parameters()?;
        let parameter_count: u64 = params.iter().map(|(_, t)| t.numel() as u64).sum();
        let branch_weights = params
            .iter()
            .find(|(name, t)| name.ends_with("fusion.weights") && t.dim() == 2)
            .map(|(_, t)| tch::no_grad(|| mean_branch_weights(t)));
        let metadata = ModelMetadata {
            branches: BackboneKind::ALL,
            projection_channels: config.projection_channels,
            total_parameters: parameter_count,
            trainable_parameters: parameter_count,
            branch_weights,
            strategy,
            artifact: artifact.to_path_buf(),
        };
        Ok(Self {
            network: Network::TorchScript(module),
            device,
            metadata,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// NCHW input on `self.device()` to `[1, 5]` probabilities.
    pub(crate) fn forward(&self, input: &Tensor) -> Result<Tensor, InferenceFailure> {
        match &self.network {
            Network::TorchScript(module) => Ok(module.forward_ts(&[input])?),
            Network::Native { net, .. } => net.forward_checked(input).map_err(|e| match e {
                ForwardError::NonFiniteBranch { branch } => InferenceFailure::BranchFault {
                    branch,
                    input_shape: input.size(),
                },
            }),
        }
    }

    pub fn model_info(&self) -> ModelInfoResponse {
        let meta = &self.metadata;
        let branch_weights = meta.branch_weights.as_ref().map(|weights| {
            meta.branches
                .iter()
                .zip(weights)
                .map(|(kind, w)| (kind.name().to_string(), *w))
                .collect::<BTreeMap<_, _>>()
        });
        ModelInfoResponse {
            model_name: MODEL_NAME.to_string(),
            architecture: meta.architecture(),
            input_shape: [INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS],
            num_classes: DrGrade::label_table().len(),
            classes: DrGrade::label_table(),
            total_parameters: meta.total_parameters,
            trainable_parameters: meta.trainable_parameters,
            artifact: ArtifactInfo {
                strategy: meta.strategy.to_string(),
                path: meta.artifact.display().to_string(),
            },
            branch_weights,
        }
    }
}
