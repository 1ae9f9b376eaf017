use std::sync::Arc;

use crate::model::{FusionInferenceEngine, InferenceFailure, ModelHandle};
use crate::report::{PredictionResult, ResultFormatter};
use crate::vision::{ImageBytes, PreprocessError, Preprocessor};
use shared::ModelInfoResponse;

#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] InferenceFailure),
}

impl GradingError {
    /// True when the caller sent something unusable, as opposed to a fault in
    /// the model or runtime.
    pub fn is_client_error(&self) -> bool {
        matches!(self, GradingError::Preprocess(_))
    }
}

/// Preprocess -> infer -> format against one loaded model.
#[derive(Debug, Clone)]
pub struct Grader {
    preprocessor: Preprocessor,
    engine: FusionInferenceEngine,
    formatter: ResultFormatter,
    handle: Arc<ModelHandle>,
}

impl Grader {
    pub fn new(preprocessor: Preprocessor, handle: Arc<ModelHandle>) -> Self {
        Self {
            preprocessor,
            engine: FusionInferenceEngine::new(),
            formatter: ResultFormatter::new(),
            handle,
        }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    pub fn grade(&self, image: &ImageBytes) -> Result<PredictionResult, GradingError> {
        let tensor = self.preprocessor.prepare(image)?;
        let probabilities = self.engine.infer(&tensor, &self.handle)?;
        let result = self.formatter.format(&probabilities);
        log::info!(
            "Graded image {} as {} ({}, confidence {:.4})",
            image.digest(),
            result.diagnosis,
            result.severity,
            result.confidence
        );
        Ok(result)
    }

    pub fn model_info(&self) -> ModelInfoResponse {
        self.handle.model_info()
    }
}
