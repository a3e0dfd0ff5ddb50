use thiserror::Error;

/// Errors surfaced by an inference backend.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend returned a null/failed context for the given parameters.
    #[error("failed to create inference context: {0}")]
    ContextCreationFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("upscale failed: {0}")]
    UpscaleFailed(String),

    #[error("model conversion failed: {0}")]
    ConvertFailed(String),

    /// Image decode/encode problems at the engine boundary.
    #[error("image error: {0}")]
    Image(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}
