pub mod filters;
pub mod preprocess;

pub use preprocess::{
    ImageBytes, ImageKind, INPUT_CHANNELS, INPUT_SIZE, PreprocessError, PreprocessedTensor,
    Preprocessor,
};
