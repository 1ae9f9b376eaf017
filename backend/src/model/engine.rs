use ndarray::Array3;
use tch::{Device, Kind, Tensor};

use super::handle::ModelHandle;
use crate::vision::{INPUT_CHANNELS, INPUT_SIZE, PreprocessedTensor};

pub const NUM_GRADES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum InferenceFailure {
    #[error("Input shape {actual:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: Vec<usize>,
    },
    #[error("Branch {branch} produced non-finite features for input {input_shape:?}")]
    BranchFault {
        branch: &'static str,
        input_shape: Vec<i64>,
    },
    #[error("Model output is not a valid probability vector: {0}")]
    InvalidOutput(String),
    #[error("Torch runtime error: {0}")]
    Runtime(#[from] tch::TchError),
}

/// Five finite, non-negative class probabilities summing to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityVector([f32; NUM_GRADES]);

impl ProbabilityVector {
    pub const TOLERANCE: f32 = 1e-4;

    pub fn new(values: [f32; NUM_GRADES]) -> Result<Self, InferenceFailure> {
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(InferenceFailure::InvalidOutput(format!(
                "entry {} is negative or non-finite",
                bad
            )));
        }
        let sum: f32 = values.iter().sum();
        if (sum - 1.0).abs() > Self::TOLERANCE {
            return Err(InferenceFailure::InvalidOutput(format!(
                "entries sum to {}",
                sum
            )));
        }
        Ok(Self(values))
    }

    pub fn from_slice(values: &[f32]) -> Result<Self, InferenceFailure> {
        let values: [f32; NUM_GRADES] = values.try_into().map_err(|_| {
            InferenceFailure::InvalidOutput(format!(
                "expected {} entries, got {}",
                NUM_GRADES,
                values.len()
            ))
        })?;
        Self::new(values)
    }

    pub fn as_array(&self) -> &[f32; NUM_GRADES] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }
}

/// Runs preprocessed tensors through the fused model held by a handle.
/// Holds no state of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionInferenceEngine;

impl FusionInferenceEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn infer(
        &self,
        tensor: &PreprocessedTensor,
        handle: &ModelHandle,
    ) -> Result<ProbabilityVector, InferenceFailure> {
        let expected = [INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS];
        if tensor.shape() != expected {
            log::error!(
                "Rejecting tensor with shape {:?}, expected {:?}",
                tensor.shape(),
                expected
            );
            return Err(InferenceFailure::ShapeMismatch {
                expected,
                actual: tensor.shape().to_vec(),
            });
        }

        let values = tensor.view().as_standard_layout().into_owned();
        let slice = values.as_slice().ok_or_else(|| {
            InferenceFailure::InvalidOutput("input tensor is not contiguous".to_string())
        })?;
        let size = INPUT_SIZE as i64;
        let input = Tensor::f_from_slice(slice)?
            .f_view([1, size, size, INPUT_CHANNELS as i64])?
            .f_permute([0, 3, 1, 2])?
            .contiguous()
            .to_device(handle.device());

        let output = tch::no_grad(|| handle.forward(&input)).map_err(|e| {
            log::error!(
                "Inference failed on input {:?} ({}): {}",
                input.size(),
                handle.metadata().strategy,
                e
            );
            e
        })?;

        let flat = output
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .f_view([-1])?;
        let numel = flat.numel();
        if numel != NUM_GRADES {
            return Err(InferenceFailure::InvalidOutput(format!(
                "model returned {} values (shape {:?})",
                numel,
                output.size()
            )));
        }
        let mut probs = [0f32; NUM_GRADES];
        flat.f_copy_data(&mut probs, NUM_GRADES)?;

        let probs = ProbabilityVector::new(probs).inspect_err(|e| {
            log::error!("Model output failed validation: {}", e);
        })?;
        log::debug!("Class probabilities: {:?}", probs.as_array());
        Ok(probs)
    }

    /// Forward pass on an all-zero input, used to vet a freshly loaded model.
    pub fn blank_inference(
        &self,
        handle: &ModelHandle,
    ) -> Result<ProbabilityVector, InferenceFailure> {
        let blank = PreprocessedTensor::new(Array3::zeros((INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS)));
        self.infer(&blank, handle)
    }
}
