use thiserror::Error;

#[derive(Debug, Error)]
pub enum WispError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model: {0}")]
    FailedToLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Generation failed: {0}")]
    GenerationFailed(String),
}

pub type Result<T> = std::result::Result<T, WispError>;
