//! Engine interface for the sdhost orchestration server.
//!
//! The native diffusion library is an external collaborator: this crate
//! defines the exact surface the core consumes from it: context creation
//! from a fully validated parameter record, synchronous generation entry
//! points, an independent upscaler context, model conversion, and the three
//! global hooks (log, progress, preview) that the worker installs around
//! each job.
//!
//! [`software::SoftwareEngine`] is a deterministic pure-Rust implementation
//! used by tests and by deployments without a native backend linked.

use std::fmt;

mod error;
pub mod hooks;
mod images;
mod lora;
mod params;
pub mod software;

pub use error::EngineError;
pub use images::{decode_base64_image, load_image, save_png};
pub use lora::{ParsedLora, parse_loras_from_prompt};
pub use params::*;

/// Raw interleaved 8-bit image as produced by the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A loaded main-model inference context.
///
/// One context is resident at a time; the core serializes access through its
/// inference-slot mutex, so implementations only need `Send`.
pub trait GenerationContext: Send {
    /// Architecture label reported by the engine for the loaded model
    /// (e.g. "SD1.x", "SDXL", "Flux", "Z-Image").
    fn architecture(&self) -> &str;

    fn txt2img(
        &self,
        params: &Txt2ImgParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError>;

    fn img2img(
        &self,
        params: &Img2ImgParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError>;

    /// Generate video frames. The returned vec holds one image per frame.
    fn txt2vid(
        &self,
        params: &Txt2VidParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError>;
}

/// A loaded upscaler (ESRGAN) context, independent of the main model slot.
pub trait UpscaleContext: Send {
    /// Upscale factor of the loaded model (typically 2 or 4).
    fn factor(&self) -> u32;

    fn upscale(&self, image: &RawImage) -> Result<RawImage, EngineError>;
}

/// Entry point to an inference backend.
pub trait DiffusionEngine: Send + Sync {
    /// Human-readable backend identifier for logs and `/health`.
    fn name(&self) -> &str;

    /// Number of physical CPU cores, used when `n_threads <= 0`.
    fn physical_cores(&self) -> i32;

    /// Closed list of sampling methods this build supports.
    fn samplers(&self) -> &[&'static str];

    /// Closed list of sigma schedulers this build supports.
    fn schedulers(&self) -> &[&'static str];

    /// Quantization types accepted by [`DiffusionEngine::convert_model`].
    fn quantization_types(&self) -> &[&'static str];

    /// Load a model (and its satellite components) into a fresh context.
    /// May take seconds to minutes; reports progress through the global
    /// progress hook.
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn GenerationContext>, EngineError>;

    fn new_upscaler(&self, params: &UpscalerParams) -> Result<Box<dyn UpscaleContext>, EngineError>;

    /// Convert a model file to GGUF with the requested quantization.
    fn convert_model(&self, request: &ConvertRequest) -> Result<(), EngineError>;
}
