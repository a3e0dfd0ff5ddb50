//! Pure-Rust reference engine.
//!
//! Stands in for the native diffusion library when none is linked: produces
//! deterministic procedural images, drives the progress/preview/log hooks
//! with the same cadence the native backend would, and honours the same
//! failure surfaces (null context, failed generation). Used by the test
//! suite and by development deployments.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::hooks::{self, LogLevel};
use crate::{
    ContextParams, ConvertRequest, DiffusionEngine, EngineError, GenerationContext, Img2ImgParams,
    ParsedLora, QUANTIZATION_TYPES, RawImage, SAMPLERS, SCHEDULERS, Txt2ImgParams, Txt2VidParams,
    UpscaleContext, UpscalerParams, decode_base64_image,
};

/// Deterministic software engine.
#[derive(Debug, Default)]
pub struct SoftwareEngine {
    fail_context: AtomicBool,
    fail_generation: AtomicBool,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `new_context` calls fail, mimicking a null native
    /// context (bad weights, out of memory).
    pub fn set_fail_context(&self, fail: bool) {
        self.fail_context.store(fail, Ordering::SeqCst);
    }

    /// Make generation calls fail, mimicking a native inference error.
    pub fn set_fail_generation(&self, fail: bool) {
        self.fail_generation.store(fail, Ordering::SeqCst);
    }
}

impl DiffusionEngine for SoftwareEngine {
    fn name(&self) -> &str {
        "software"
    }

    fn physical_cores(&self) -> i32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1)
    }

    fn samplers(&self) -> &[&'static str] {
        SAMPLERS
    }

    fn schedulers(&self) -> &[&'static str] {
        SCHEDULERS
    }

    fn quantization_types(&self) -> &[&'static str] {
        QUANTIZATION_TYPES
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn GenerationContext>, EngineError> {
        let main = if !params.model_path.is_empty() {
            &params.model_path
        } else {
            &params.diffusion_model_path
        };
        if main.is_empty() {
            hooks::emit_log(LogLevel::Error, "no model path supplied");
            return Err(EngineError::ContextCreationFailed(
                "no model path supplied".into(),
            ));
        }
        if self.fail_context.load(Ordering::SeqCst) {
            hooks::emit_log(LogLevel::Error, "failed to read model weights");
            return Err(EngineError::ContextCreationFailed(format!(
                "failed to load model: {main}"
            )));
        }

        // Simulated weight-loading phase, reported like the native loader.
        const LOAD_STEPS: i32 = 4;
        for step in 1..=LOAD_STEPS {
            hooks::emit_progress(step, LOAD_STEPS);
        }

        let architecture = guess_architecture(main);
        hooks::emit_log(
            LogLevel::Info,
            &format!("model loaded ({architecture}): {main}"),
        );
        Ok(Box::new(SoftwareContext {
            architecture,
            seed_base: stable_hash(main),
            fail_generation: self.fail_generation.load(Ordering::SeqCst),
        }))
    }

    fn new_upscaler(&self, params: &UpscalerParams) -> Result<Box<dyn UpscaleContext>, EngineError> {
        if params.model_path.is_empty() {
            return Err(EngineError::ContextCreationFailed(
                "no upscaler model path supplied".into(),
            ));
        }
        if self.fail_context.load(Ordering::SeqCst) {
            return Err(EngineError::ContextCreationFailed(format!(
                "failed to load upscaler: {}",
                params.model_path
            )));
        }
        Ok(Box::new(SoftwareUpscaler { factor: 4 }))
    }

    fn convert_model(&self, request: &ConvertRequest) -> Result<(), EngineError> {
        if !QUANTIZATION_TYPES.contains(&request.output_type.as_str()) {
            return Err(EngineError::ConvertFailed(format!(
                "unsupported quantization type: {}",
                request.output_type
            )));
        }
        if !Path::new(&request.input_path).is_file() {
            return Err(EngineError::ConvertFailed(format!(
                "input file does not exist: {}",
                request.input_path
            )));
        }
        for step in 1..=4 {
            hooks::emit_progress(step, 4);
        }
        std::fs::write(
            &request.output_path,
            format!("GGUF\0{}\0{}", request.output_type, request.input_path),
        )
        .map_err(|e| EngineError::ConvertFailed(format!("write failed: {e}")))?;
        Ok(())
    }
}

struct SoftwareContext {
    architecture: String,
    seed_base: u64,
    fail_generation: bool,
}

impl SoftwareContext {
    fn run(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        steps: i32,
        seed: i64,
        batch_count: i32,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError> {
        if self.fail_generation {
            hooks::emit_log(LogLevel::Error, "ggml compute graph failed");
            return Err(EngineError::GenerationFailed("inference failed".into()));
        }

        let steps = steps.max(1);
        let batch = batch_count.max(1);
        let lora_salt: u64 = loras
            .iter()
            .map(|l| stable_hash(&l.path.display().to_string()))
            .fold(0, u64::wrapping_add);

        let mut images = Vec::with_capacity(batch as usize);
        for b in 0..batch {
            let mut canvas = vec![0u8; (width * height * 3) as usize];
            for step in 1..=steps {
                hooks::emit_progress(step, steps);
                let salt = self
                    .seed_base
                    .wrapping_add(stable_hash(prompt))
                    .wrapping_add(lora_salt)
                    .wrapping_add(seed as u64)
                    .wrapping_add(b as u64)
                    .wrapping_add(step as u64);
                paint(&mut canvas, width, height, salt);
                hooks::emit_preview(
                    step,
                    1,
                    &RawImage {
                        width,
                        height,
                        channels: 3,
                        data: canvas.clone(),
                    },
                    step < steps,
                );
            }
            images.push(RawImage {
                width,
                height,
                channels: 3,
                data: canvas,
            });
        }
        Ok(images)
    }
}

impl GenerationContext for SoftwareContext {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn txt2img(
        &self,
        params: &Txt2ImgParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError> {
        self.run(
            &params.prompt,
            params.width,
            params.height,
            params.steps,
            params.seed,
            params.batch_count,
            loras,
        )
    }

    fn img2img(
        &self,
        params: &Img2ImgParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError> {
        // The init image gates on decode errors exactly like the native path.
        let init = decode_base64_image(&params.init_image_base64)?;
        self.run(
            &params.prompt,
            if params.width > 0 { params.width } else { init.width },
            if params.height > 0 { params.height } else { init.height },
            params.steps,
            params.seed,
            params.batch_count,
            loras,
        )
    }

    fn txt2vid(
        &self,
        params: &Txt2VidParams,
        loras: &[ParsedLora],
    ) -> Result<Vec<RawImage>, EngineError> {
        if self.fail_generation {
            return Err(EngineError::GenerationFailed("inference failed".into()));
        }
        let frames = params.video_frames.max(1);
        let steps = params.steps.max(1);
        let mut out = Vec::with_capacity(frames as usize);
        for step in 1..=steps {
            hooks::emit_progress(step, steps);
        }
        for f in 0..frames {
            let mut canvas = vec![0u8; (params.width * params.height * 3) as usize];
            let salt = self
                .seed_base
                .wrapping_add(stable_hash(&params.prompt))
                .wrapping_add(params.seed as u64)
                .wrapping_add(f as u64);
            paint(&mut canvas, params.width, params.height, salt);
            let frame = RawImage {
                width: params.width,
                height: params.height,
                channels: 3,
                data: canvas,
            };
            hooks::emit_preview(steps, frames, &frame, false);
            out.push(frame);
        }
        Ok(out)
    }
}

struct SoftwareUpscaler {
    factor: u32,
}

impl UpscaleContext for SoftwareUpscaler {
    fn factor(&self) -> u32 {
        self.factor
    }

    fn upscale(&self, image: &RawImage) -> Result<RawImage, EngineError> {
        if image.channels != 3 || image.data.is_empty() {
            return Err(EngineError::UpscaleFailed("empty input image".into()));
        }
        let f = self.factor;
        let (w, h) = (image.width * f, image.height * f);
        let mut data = vec![0u8; (w * h * 3) as usize];
        for y in 0..h {
            for x in 0..w {
                let sx = x / f;
                let sy = y / f;
                let src = ((sy * image.width + sx) * 3) as usize;
                let dst = ((y * w + x) * 3) as usize;
                data[dst..dst + 3].copy_from_slice(&image.data[src..src + 3]);
            }
        }
        Ok(RawImage {
            width: w,
            height: h,
            channels: 3,
            data,
        })
    }
}

fn stable_hash(s: &str) -> u64 {
    let mut h = DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

fn paint(canvas: &mut [u8], width: u32, height: u32, salt: u64) {
    for y in 0..height {
        for x in 0..width {
            let i = ((y * width + x) * 3) as usize;
            let v = salt
                .wrapping_mul(6364136223846793005)
                .wrapping_add((x as u64) << 16 | y as u64);
            canvas[i] = (v >> 16) as u8;
            canvas[i + 1] = (v >> 24) as u8;
            canvas[i + 2] = (v >> 32) as u8;
        }
    }
}

fn guess_architecture(model_path: &str) -> String {
    let name = model_path.to_ascii_lowercase();
    if name.contains("flux") {
        "Flux"
    } else if name.contains("sd3") {
        "SD3"
    } else if name.contains("z-image") || name.contains("z_image") || name.contains("zimage") {
        "Z-Image"
    } else if name.contains("qwen") {
        "Qwen-Image"
    } else if name.contains("wan") {
        "Wan"
    } else if name.contains("xl") {
        "SDXL"
    } else {
        "SD1.x"
    }
    .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(engine: &SoftwareEngine, model: &str) -> Box<dyn GenerationContext> {
        engine
            .new_context(&ContextParams {
                model_path: model.into(),
                ..ContextParams::default()
            })
            .unwrap()
    }

    #[test]
    fn context_requires_a_model_path() {
        let engine = SoftwareEngine::new();
        assert!(engine.new_context(&ContextParams::default()).is_err());
    }

    #[test]
    fn generation_is_deterministic() {
        let engine = SoftwareEngine::new();
        let c = ctx(&engine, "models/sdxl_base.safetensors");
        assert_eq!(c.architecture(), "SDXL");

        let params = Txt2ImgParams {
            prompt: "lighthouse".into(),
            width: 16,
            height: 16,
            steps: 2,
            seed: 42,
            ..Txt2ImgParams::default()
        };
        let a = c.txt2img(&params, &[]).unwrap();
        let b = c.txt2img(&params, &[]).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].data, b[0].data);
    }

    #[test]
    fn failing_engine_surfaces_generation_error() {
        let engine = SoftwareEngine::new();
        engine.set_fail_generation(true);
        let c = ctx(&engine, "m.safetensors");
        let err = c.txt2img(&Txt2ImgParams::default(), &[]).unwrap_err();
        assert!(matches!(err, EngineError::GenerationFailed(_)));
    }

    #[test]
    fn upscale_multiplies_dimensions() {
        let engine = SoftwareEngine::new();
        let up = engine
            .new_upscaler(&UpscalerParams {
                model_path: "esrgan.pth".into(),
                n_threads: 1,
                tile_size: 128,
            })
            .unwrap();
        let out = up
            .upscale(&RawImage {
                width: 3,
                height: 2,
                channels: 3,
                data: vec![7; 18],
            })
            .unwrap();
        assert_eq!((out.width, out.height), (12, 8));
    }

    #[test]
    fn convert_rejects_unknown_quantization() {
        let engine = SoftwareEngine::new();
        let err = engine
            .convert_model(&ConvertRequest {
                input_path: "x".into(),
                output_type: "q9_9".into(),
                ..ConvertRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::ConvertFailed(_)));
    }
}
