pub mod backbones;
pub mod engine;
pub mod fusion;
pub mod handle;
pub mod loader;

pub use backbones::BackboneKind;
pub use engine::{FusionInferenceEngine, InferenceFailure, ProbabilityVector};
pub use fusion::FusionNet;
pub use handle::{ModelHandle, ModelMetadata};
pub use loader::{
    LoadError, LoadStrategy, ModelLoader, RebuildFromWeightsStrategy, StrategyError,
    TorchScriptStrategy,
};
