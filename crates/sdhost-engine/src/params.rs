//! Parameter records exchanged with the inference backend.
//!
//! All generation parameter structs deserialize with defaults so a sparse
//! API request materializes into a complete record; that record is written
//! back into the job (and into the on-disk `config.json`) so a finished job
//! can be replayed exactly.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Sampling methods of the reference stable-diffusion backend.
pub const SAMPLERS: &[&str] = &[
    "euler", "euler_a", "heun", "dpm2", "dpm++2s_a", "dpm++2m", "dpm++2mv2", "ipndm", "ipndm_v",
    "lcm", "ddim_trailing", "tcd",
];

/// Sigma schedulers of the reference backend.
pub const SCHEDULERS: &[&str] = &[
    "discrete", "karras", "exponential", "ays", "gits", "smoothstep", "sgm_uniform", "simple",
];

/// Quantization types accepted by model conversion.
pub const QUANTIZATION_TYPES: &[&str] = &[
    "f32", "f16", "bf16", "q8_0", "q6_k", "q5_k", "q5_1", "q5_0", "q4_k", "q4_1", "q4_0", "q3_k",
    "q2_k",
];

/// Live-preview decode mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PreviewMode {
    None,
    /// Fast latent projection, lowest quality.
    Proj,
    /// TAESD tiny autoencoder, the balanced default.
    Tae,
    /// Full VAE decode, slowest.
    Vae,
}

/// Noise RNG selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RngKind {
    StdDefault,
    Cuda,
    Cpu,
}

/// When LoRA weights are merged into the model.
///
/// `at_runtime` is the default: `auto` caches merged weights across jobs and
/// serves stale LoRAs when the prompt set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LoraApplyMode {
    Auto,
    Immediately,
    AtRuntime,
}

/// Everything the backend needs to construct a main-model context.
///
/// Path fields use the empty string for "not provided". `flow_shift = None`
/// lets the backend auto-detect from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    pub model_path: String,
    pub diffusion_model_path: String,
    pub clip_l_path: String,
    pub clip_g_path: String,
    pub clip_vision_path: String,
    pub t5xxl_path: String,
    pub llm_path: String,
    pub llm_vision_path: String,
    pub high_noise_diffusion_model_path: String,
    pub vae_path: String,
    pub taesd_path: String,
    pub control_net_path: String,
    pub photo_maker_path: String,
    pub embedding_dir: String,

    /// Resolved thread count (> 0; the caller substitutes the physical core
    /// count before handing the record over).
    pub n_threads: i32,
    /// Weight/quantization override; empty keeps the file's own type.
    pub weight_type: String,
    /// Per-tensor weight rules, e.g. `^vae\.=f16`.
    pub tensor_type_rules: String,
    pub rng_type: RngKind,
    /// Sampler RNG; `None` follows `rng_type`.
    pub sampler_rng_type: Option<RngKind>,
    /// Prediction override (`eps`, `v`, `sd3_flow`, ...); empty = auto.
    pub prediction: String,
    pub lora_apply_mode: LoraApplyMode,

    pub keep_clip_on_cpu: bool,
    pub keep_vae_on_cpu: bool,
    pub keep_control_net_on_cpu: bool,
    pub offload_params_to_cpu: bool,
    pub enable_mmap: bool,
    pub vae_decode_only: bool,
    pub vae_conv_direct: bool,
    pub diffusion_conv_direct: bool,
    pub tae_preview_only: bool,
    pub free_params_immediately: bool,
    pub flash_attn: bool,
    pub flow_shift: Option<f32>,

    pub vae_tiling: bool,
    pub vae_tile_size_x: i32,
    pub vae_tile_size_y: i32,
    pub vae_tile_overlap: f32,
    pub force_sdxl_vae_conv_scale: bool,

    pub chroma_use_dit_mask: bool,
    pub chroma_use_t5_mask: bool,
    pub chroma_t5_mask_pad: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            diffusion_model_path: String::new(),
            clip_l_path: String::new(),
            clip_g_path: String::new(),
            clip_vision_path: String::new(),
            t5xxl_path: String::new(),
            llm_path: String::new(),
            llm_vision_path: String::new(),
            high_noise_diffusion_model_path: String::new(),
            vae_path: String::new(),
            taesd_path: String::new(),
            control_net_path: String::new(),
            photo_maker_path: String::new(),
            embedding_dir: String::new(),
            n_threads: 0,
            weight_type: String::new(),
            tensor_type_rules: String::new(),
            rng_type: RngKind::Cuda,
            sampler_rng_type: None,
            prediction: String::new(),
            lora_apply_mode: LoraApplyMode::AtRuntime,
            keep_clip_on_cpu: true,
            keep_vae_on_cpu: false,
            keep_control_net_on_cpu: false,
            offload_params_to_cpu: false,
            enable_mmap: true,
            vae_decode_only: true,
            vae_conv_direct: false,
            diffusion_conv_direct: false,
            tae_preview_only: false,
            free_params_immediately: false,
            flash_attn: true,
            flow_shift: None,
            vae_tiling: false,
            vae_tile_size_x: 0,
            vae_tile_size_y: 0,
            vae_tile_overlap: 0.5,
            force_sdxl_vae_conv_scale: false,
            chroma_use_dit_mask: true,
            chroma_use_t5_mask: false,
            chroma_t5_mask_pad: 1,
        }
    }
}

/// Upscaler (ESRGAN) context parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscalerParams {
    pub model_path: String,
    pub n_threads: i32,
    pub tile_size: i32,
}

/// A model conversion request (`convert` jobs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertRequest {
    pub input_path: String,
    /// VAE to bake into the output; empty to skip.
    pub vae_path: String,
    pub output_path: String,
    /// One of [`QUANTIZATION_TYPES`] for the linked backend.
    pub output_type: String,
    pub tensor_type_rules: String,
}

/// Text-to-image generation parameters.
///
/// LoRAs ride inline in the prompt with `<lora:name:weight>` syntax and are
/// extracted before the prompt reaches the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Txt2ImgParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: i32,
    pub cfg_scale: f32,
    pub seed: i64,
    pub sampler: String,
    pub scheduler: String,
    pub batch_count: i32,
    pub clip_skip: i32,

    pub distilled_guidance: f32,
    pub eta: f32,
    pub shifted_timestep: i32,

    // Skip Layer Guidance for DiT models.
    pub slg_scale: f32,
    pub skip_layers: Vec<i32>,
    pub slg_start: f32,
    pub slg_end: f32,

    /// Custom sigma schedule; overrides `scheduler` when non-empty.
    pub custom_sigmas: Vec<f32>,

    // Reference images (Flux Kontext).
    pub ref_images_base64: Vec<String>,
    pub auto_resize_ref_image: bool,
    pub increase_ref_index: bool,

    // ControlNet; requires a ControlNet loaded with the model.
    pub control_image_base64: Option<String>,
    pub control_strength: f32,

    pub vae_tiling: bool,
    pub vae_tile_size_x: i32,
    pub vae_tile_size_y: i32,
    pub vae_tile_overlap: f32,

    pub easycache_enabled: bool,
    pub easycache_threshold: f32,
    pub easycache_start: f32,
    pub easycache_end: f32,

    // PhotoMaker; requires a PhotoMaker model loaded.
    pub pm_id_images_base64: Vec<String>,
    pub pm_id_embed_path: String,
    pub pm_style_strength: f32,

    // Post-generation upscaling; requires an upscaler loaded.
    pub upscale: bool,
    pub upscale_auto_unload: bool,
    pub upscale_repeats: i32,
}

impl Default for Txt2ImgParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.0,
            seed: -1,
            sampler: "euler_a".into(),
            scheduler: "discrete".into(),
            batch_count: 1,
            clip_skip: -1,
            distilled_guidance: 3.5,
            eta: 0.0,
            shifted_timestep: 0,
            slg_scale: 0.0,
            skip_layers: vec![7, 8, 9],
            slg_start: 0.01,
            slg_end: 0.2,
            custom_sigmas: Vec::new(),
            ref_images_base64: Vec::new(),
            auto_resize_ref_image: true,
            increase_ref_index: false,
            control_image_base64: None,
            control_strength: 0.9,
            vae_tiling: false,
            vae_tile_size_x: 0,
            vae_tile_size_y: 0,
            vae_tile_overlap: 0.5,
            easycache_enabled: false,
            easycache_threshold: 0.2,
            easycache_start: 0.15,
            easycache_end: 0.95,
            pm_id_images_base64: Vec::new(),
            pm_id_embed_path: String::new(),
            pm_style_strength: 20.0,
            upscale: false,
            upscale_auto_unload: true,
            upscale_repeats: 1,
        }
    }
}

/// Image-to-image generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Img2ImgParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub init_image_base64: String,
    pub mask_image_base64: Option<String>,
    pub strength: f32,
    pub width: u32,
    pub height: u32,
    pub steps: i32,
    pub cfg_scale: f32,
    /// Image CFG for instruct-pix2pix; -1 follows `cfg_scale`.
    pub img_cfg_scale: f32,
    pub seed: i64,
    pub sampler: String,
    pub scheduler: String,
    pub batch_count: i32,
    pub clip_skip: i32,

    pub distilled_guidance: f32,
    pub eta: f32,
    pub shifted_timestep: i32,

    pub slg_scale: f32,
    pub skip_layers: Vec<i32>,
    pub slg_start: f32,
    pub slg_end: f32,

    pub custom_sigmas: Vec<f32>,

    pub ref_images_base64: Vec<String>,
    pub auto_resize_ref_image: bool,
    pub increase_ref_index: bool,

    pub control_image_base64: Option<String>,
    pub control_strength: f32,

    pub vae_tiling: bool,
    pub vae_tile_size_x: i32,
    pub vae_tile_size_y: i32,
    pub vae_tile_overlap: f32,

    pub easycache_enabled: bool,
    pub easycache_threshold: f32,
    pub easycache_start: f32,
    pub easycache_end: f32,

    pub pm_id_images_base64: Vec<String>,
    pub pm_id_embed_path: String,
    pub pm_style_strength: f32,

    pub upscale: bool,
    pub upscale_auto_unload: bool,
    pub upscale_repeats: i32,
}

impl Default for Img2ImgParams {
    fn default() -> Self {
        let base = Txt2ImgParams::default();
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            init_image_base64: String::new(),
            mask_image_base64: None,
            strength: 0.75,
            width: base.width,
            height: base.height,
            steps: base.steps,
            cfg_scale: base.cfg_scale,
            img_cfg_scale: -1.0,
            seed: base.seed,
            sampler: base.sampler,
            scheduler: base.scheduler,
            batch_count: base.batch_count,
            clip_skip: base.clip_skip,
            distilled_guidance: base.distilled_guidance,
            eta: base.eta,
            shifted_timestep: base.shifted_timestep,
            slg_scale: base.slg_scale,
            skip_layers: base.skip_layers,
            slg_start: base.slg_start,
            slg_end: base.slg_end,
            custom_sigmas: Vec::new(),
            ref_images_base64: Vec::new(),
            auto_resize_ref_image: true,
            increase_ref_index: false,
            control_image_base64: None,
            control_strength: base.control_strength,
            vae_tiling: false,
            vae_tile_size_x: 0,
            vae_tile_size_y: 0,
            vae_tile_overlap: 0.5,
            easycache_enabled: false,
            easycache_threshold: 0.2,
            easycache_start: 0.15,
            easycache_end: 0.95,
            pm_id_images_base64: Vec::new(),
            pm_id_embed_path: String::new(),
            pm_style_strength: 20.0,
            upscale: false,
            upscale_auto_unload: true,
            upscale_repeats: 1,
        }
    }
}

/// Text-to-video generation parameters (Wan-style MoE models included).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Txt2VidParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub video_frames: i32,
    pub fps: i32,
    pub steps: i32,
    pub cfg_scale: f32,
    pub seed: i64,
    pub sampler: String,
    pub scheduler: String,
    pub flow_shift: f32,
    pub clip_skip: i32,

    pub distilled_guidance: f32,
    pub eta: f32,

    pub slg_scale: f32,
    pub skip_layers: Vec<i32>,
    pub slg_start: f32,
    pub slg_end: f32,

    /// First/last frame conditioning for vid2vid / FLF2V.
    pub init_image_base64: Option<String>,
    pub end_image_base64: Option<String>,
    pub strength: f32,

    pub control_image_base64: Option<String>,
    pub control_frames_base64: Vec<String>,

    // High-noise expert parameters (MoE models such as Wan2.2).
    pub high_noise_steps: i32,
    pub high_noise_cfg_scale: f32,
    pub high_noise_sampler: String,
    pub high_noise_distilled_guidance: f32,
    pub high_noise_slg_scale: f32,
    pub high_noise_skip_layers: Vec<i32>,
    pub high_noise_slg_start: f32,
    pub high_noise_slg_end: f32,
    /// Timestep boundary between the high-noise and base experts.
    pub moe_boundary: f32,
    pub vace_strength: f32,

    pub vae_tiling: bool,
    pub vae_tile_size_x: i32,
    pub vae_tile_size_y: i32,
    pub vae_tile_overlap: f32,

    pub easycache_enabled: bool,
    pub easycache_threshold: f32,
    pub easycache_start: f32,
    pub easycache_end: f32,
}

impl Default for Txt2VidParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 832,
            height: 480,
            video_frames: 33,
            fps: 16,
            steps: 30,
            cfg_scale: 6.0,
            seed: -1,
            sampler: "euler".into(),
            scheduler: "discrete".into(),
            flow_shift: 3.0,
            clip_skip: -1,
            distilled_guidance: 3.5,
            eta: 0.0,
            slg_scale: 0.0,
            skip_layers: vec![7, 8, 9],
            slg_start: 0.01,
            slg_end: 0.2,
            init_image_base64: None,
            end_image_base64: None,
            strength: 0.75,
            control_image_base64: None,
            control_frames_base64: Vec::new(),
            high_noise_steps: -1,
            high_noise_cfg_scale: 7.0,
            high_noise_sampler: String::new(),
            high_noise_distilled_guidance: 3.5,
            high_noise_slg_scale: 0.0,
            high_noise_skip_layers: vec![7, 8, 9],
            high_noise_slg_start: 0.01,
            high_noise_slg_end: 0.2,
            moe_boundary: 0.875,
            vace_strength: 1.0,
            vae_tiling: false,
            vae_tile_size_x: 0,
            vae_tile_size_y: 0,
            vae_tile_overlap: 0.5,
            easycache_enabled: false,
            easycache_threshold: 0.2,
            easycache_start: 0.15,
            easycache_end: 0.95,
        }
    }
}

/// Standalone upscale-job parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleParams {
    /// Base64-encoded input image; alternative to `image_path`.
    pub image_base64: Option<String>,
    /// Path relative to the output directory (reuse a finished job's output).
    pub image_path: Option<String>,
    pub upscale_factor: i32,
    pub tile_size: i32,
    pub repeats: i32,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            image_base64: None,
            image_path: None,
            upscale_factor: 4,
            tile_size: 128,
            repeats: 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txt2img_defaults_materialize() {
        let p: Txt2ImgParams = serde_json::from_value(serde_json::json!({
            "prompt": "a cat"
        }))
        .unwrap();
        assert_eq!(p.prompt, "a cat");
        assert_eq!(p.width, 512);
        assert_eq!(p.steps, 20);
        assert_eq!(p.sampler, "euler_a");
        assert_eq!(p.skip_layers, vec![7, 8, 9]);
        assert!(p.upscale_auto_unload);

        // Round trip materializes every field.
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["cfg_scale"], 7.0);
        assert_eq!(v["batch_count"], 1);
        assert_eq!(v["scheduler"], "discrete");
    }

    #[test]
    fn txt2vid_defaults_differ_from_images() {
        let p = Txt2VidParams::default();
        assert_eq!(p.width, 832);
        assert_eq!(p.height, 480);
        assert_eq!(p.video_frames, 33);
        assert_eq!(p.sampler, "euler");
        assert_eq!(p.steps, 30);
    }

    #[test]
    fn lora_apply_mode_defaults_to_at_runtime() {
        let p = ContextParams::default();
        assert_eq!(p.lora_apply_mode, LoraApplyMode::AtRuntime);
        assert_eq!(
            serde_json::to_value(p.lora_apply_mode).unwrap(),
            serde_json::json!("at_runtime")
        );
    }

    #[test]
    fn rng_kind_strings() {
        assert_eq!(RngKind::StdDefault.to_string(), "std_default");
        assert_eq!("cuda".parse::<RngKind>().unwrap(), RngKind::Cuda);
    }

    #[test]
    fn preview_mode_round_trips_lowercase() {
        let m: PreviewMode = serde_json::from_value(serde_json::json!("tae")).unwrap();
        assert_eq!(m, PreviewMode::Tae);
        assert_eq!(serde_json::to_value(m).unwrap(), serde_json::json!("tae"));
    }
}
