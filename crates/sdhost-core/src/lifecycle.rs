//! Single-slot model lifecycle.
//!
//! One inference context may be resident at a time; loading a new model
//! swaps it atomically. Validation of every referenced file happens before
//! the current context is touched, so a bad request never costs a loaded
//! model. `status()` answers without blocking on an in-flight load or
//! generation: the loaded/loading flags are atomics and the cached
//! name/architecture strings live behind their own read-write lock that is
//! only written during load/unload.
//!
//! The upscaler is an independent slot of the same shape; both can be
//! resident at once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use sdhost_engine::{
    ContextParams, DiffusionEngine, EngineError, GenerationContext, LoraApplyMode, RngKind,
    UpscaleContext, UpscalerParams, hooks,
};

use crate::catalog::ArchitectureCatalog;
use crate::config::SdDefaultsConfig;
use crate::events::{EventBus, EventKind};
use crate::registry::{ModelKind, ModelRegistry};

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// One or more referenced files are missing; the message lists all of
    /// them with the directory searched.
    #[error("{0}")]
    Validation(String),

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("no upscaler loaded")]
    NoUpscalerLoaded,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// `/models/load` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadParams {
    pub model_name: String,
    pub model_type: ModelKind,

    // Satellite components, by name relative to their respective roots.
    pub vae: Option<String>,
    pub clip_l: Option<String>,
    pub clip_g: Option<String>,
    pub clip_vision: Option<String>,
    pub t5xxl: Option<String>,
    pub controlnet: Option<String>,
    pub llm: Option<String>,
    pub llm_vision: Option<String>,
    pub taesd: Option<String>,
    pub high_noise_diffusion_model: Option<String>,
    pub photo_maker: Option<String>,

    /// <= 0 resolves to the detected physical core count.
    pub n_threads: i32,
    pub keep_clip_on_cpu: bool,
    pub keep_vae_on_cpu: bool,
    pub keep_controlnet_on_cpu: bool,
    pub flash_attn: bool,
    pub offload_to_cpu: bool,
    pub enable_mmap: bool,
    pub vae_decode_only: bool,
    pub vae_conv_direct: bool,
    pub diffusion_conv_direct: bool,
    pub tae_preview_only: bool,
    pub free_params_immediately: bool,
    /// `None` lets the library auto-detect from the model.
    pub flow_shift: Option<f32>,
    /// Empty keeps the file's own weight type.
    pub weight_type: String,
    pub tensor_type_rules: String,

    pub rng_type: RngKind,
    pub sampler_rng_type: Option<RngKind>,
    /// Prediction override; empty = auto.
    pub prediction: String,
    pub lora_apply_mode: LoraApplyMode,

    pub vae_tiling: bool,
    pub vae_tile_size_x: i32,
    pub vae_tile_size_y: i32,
    pub vae_tile_overlap: f32,
    pub force_sdxl_vae_conv_scale: bool,

    pub chroma_use_dit_mask: bool,
    pub chroma_use_t5_mask: bool,
    pub chroma_t5_mask_pad: i32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            model_type: ModelKind::Checkpoint,
            vae: None,
            clip_l: None,
            clip_g: None,
            clip_vision: None,
            t5xxl: None,
            controlnet: None,
            llm: None,
            llm_vision: None,
            taesd: None,
            high_noise_diffusion_model: None,
            photo_maker: None,
            n_threads: -1,
            keep_clip_on_cpu: true,
            keep_vae_on_cpu: false,
            keep_controlnet_on_cpu: false,
            flash_attn: true,
            offload_to_cpu: false,
            enable_mmap: true,
            vae_decode_only: true,
            vae_conv_direct: false,
            diffusion_conv_direct: false,
            tae_preview_only: false,
            free_params_immediately: false,
            flow_shift: None,
            weight_type: String::new(),
            tensor_type_rules: String::new(),
            rng_type: RngKind::Cuda,
            sampler_rng_type: None,
            prediction: String::new(),
            lora_apply_mode: LoraApplyMode::AtRuntime,
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

impl LoadParams {
    /// Apply server-wide defaults to fields the request left untouched is
    /// handled at the route layer; this merges the configured baseline.
    pub fn with_defaults(mut self, defaults: &SdDefaultsConfig) -> Self {
        if self.n_threads <= 0 && defaults.n_threads > 0 {
            self.n_threads = defaults.n_threads;
        }
        self
    }
}

#[derive(Debug, Default, Clone)]
struct LoadedSnapshot {
    model_name: String,
    model_kind: ModelKind,
    architecture: String,
    components: BTreeMap<&'static str, String>,
    options: Value,
    loading_model_name: String,
    last_error: String,
}

#[derive(Debug, Default)]
struct UpscalerSnapshot {
    model_name: String,
    last_error: String,
}

pub struct ModelLifecycle {
    registry: Arc<ModelRegistry>,
    engine: Arc<dyn DiffusionEngine>,
    bus: Arc<EventBus>,
    /// Preset catalog used to gate loads on required satellite components.
    catalog: RwLock<Option<Arc<ArchitectureCatalog>>>,

    slot: Mutex<Option<Box<dyn GenerationContext>>>,
    loaded: AtomicBool,
    loading: AtomicBool,
    loading_step: Arc<AtomicI32>,
    loading_total: Arc<AtomicI32>,
    snapshot: RwLock<LoadedSnapshot>,

    upscaler_slot: Mutex<Option<Box<dyn UpscaleContext>>>,
    upscaler_loaded: AtomicBool,
    upscaler: RwLock<UpscalerSnapshot>,
}

impl std::fmt::Debug for ModelLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("loaded", &self.is_loaded())
            .field("loading", &self.is_loading())
            .finish()
    }
}

impl ModelLifecycle {
    pub fn new(
        registry: Arc<ModelRegistry>,
        engine: Arc<dyn DiffusionEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            engine,
            bus,
            catalog: RwLock::new(None),
            slot: Mutex::new(None),
            loaded: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            loading_step: Arc::new(AtomicI32::new(0)),
            loading_total: Arc::new(AtomicI32::new(0)),
            snapshot: RwLock::new(LoadedSnapshot::default()),
            upscaler_slot: Mutex::new(None),
            upscaler_loaded: AtomicBool::new(false),
            upscaler: RwLock::new(UpscalerSnapshot::default()),
        }
    }

    /// Attach the architecture catalog; loads are then validated against
    /// the matched preset's required components.
    pub fn set_catalog(&self, catalog: Arc<ArchitectureCatalog>) {
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Some(catalog);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn is_upscaler_loaded(&self) -> bool {
        self.upscaler_loaded.load(Ordering::Acquire)
    }

    pub fn loaded_model(&self) -> Option<(String, ModelKind)> {
        if !self.is_loaded() {
            return None;
        }
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Some((snap.model_name.clone(), snap.model_kind))
    }

    pub fn architecture(&self) -> Option<String> {
        if !self.is_loaded() {
            return None;
        }
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        if snap.architecture.is_empty() {
            None
        } else {
            Some(snap.architecture.clone())
        }
    }

    pub fn upscaler_name(&self) -> Option<String> {
        if !self.is_upscaler_loaded() {
            return None;
        }
        let snap = self.upscaler.read().unwrap_or_else(|e| e.into_inner());
        Some(snap.model_name.clone())
    }

    /// Load a model and its satellite components, swapping out whatever is
    /// resident. Validation failures leave the current model untouched.
    pub fn load(&self, params: LoadParams) -> Result<(), LifecycleError> {
        // Phase 0: flag the load so /health reflects it immediately.
        self.loading.store(true, Ordering::Release);
        self.loading_step.store(0, Ordering::Relaxed);
        self.loading_total.store(0, Ordering::Relaxed);
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.loading_model_name = params.model_name.clone();
            snap.last_error.clear();
        }

        let result = self.load_inner(&params);

        self.loading.store(false, Ordering::Release);
        self.loading_step.store(0, Ordering::Relaxed);
        self.loading_total.store(0, Ordering::Relaxed);
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.loading_model_name.clear();
        }

        result
    }

    fn load_inner(&self, params: &LoadParams) -> Result<(), LifecycleError> {
        // Phase 1: validate every referenced file before touching the GPU.
        let mut errors = Vec::new();
        let searched = |kind: ModelKind| -> String {
            self.registry
                .base_dir(kind)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<not configured>".to_string())
        };

        let main = self.registry.get(params.model_type, &params.model_name);
        if main.is_none() {
            errors.push(format!(
                "Main model not found: '{}' (type: {}, searched in: {})",
                params.model_name,
                params.model_type.as_ref(),
                searched(params.model_type)
            ));
        }

        let mut resolve = |label: &str, name: &Option<String>, kind: ModelKind| -> Option<String> {
            let name = name.as_deref()?;
            match self.registry.get(kind, name) {
                Some(entry) => Some(entry.full_path.to_string_lossy().into_owned()),
                None => {
                    errors.push(format!(
                        "{label} model not found: '{name}' (searched in: {})",
                        searched(kind)
                    ));
                    None
                }
            }
        };

        let vae = resolve("VAE", &params.vae, ModelKind::Vae);
        let clip_l = resolve("CLIP-L", &params.clip_l, ModelKind::Clip);
        let clip_g = resolve("CLIP-G", &params.clip_g, ModelKind::Clip);
        let clip_vision = resolve("CLIP Vision", &params.clip_vision, ModelKind::Clip);
        let t5xxl = resolve("T5", &params.t5xxl, ModelKind::T5);
        let controlnet = resolve("ControlNet", &params.controlnet, ModelKind::Controlnet);
        let llm = resolve("LLM", &params.llm, ModelKind::Llm);
        let llm_vision = resolve("LLM Vision", &params.llm_vision, ModelKind::Llm);
        let taesd = resolve("TAESD", &params.taesd, ModelKind::Taesd);
        let high_noise = resolve(
            "High-noise diffusion",
            &params.high_noise_diffusion_model,
            ModelKind::Diffusion,
        );
        let photo_maker = resolve("PhotoMaker", &params.photo_maker, ModelKind::Checkpoint);

        // Architecture gating: a model whose name matches a preset must come
        // with every component that preset requires.
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(preset) = catalog.and_then(|c| c.get(&params.model_name)) {
            for (component, description) in &preset.required_components {
                let (provided, kind) = match component.as_str() {
                    "vae" => (params.vae.is_some(), ModelKind::Vae),
                    "clip_l" => (params.clip_l.is_some(), ModelKind::Clip),
                    "clip_g" => (params.clip_g.is_some(), ModelKind::Clip),
                    "clip_vision" => (params.clip_vision.is_some(), ModelKind::Clip),
                    "t5xxl" => (params.t5xxl.is_some(), ModelKind::T5),
                    "controlnet" => (params.controlnet.is_some(), ModelKind::Controlnet),
                    "llm" => (params.llm.is_some(), ModelKind::Llm),
                    "llm_vision" => (params.llm_vision.is_some(), ModelKind::Llm),
                    "taesd" => (params.taesd.is_some(), ModelKind::Taesd),
                    "high_noise_diffusion_model" => (
                        params.high_noise_diffusion_model.is_some(),
                        ModelKind::Diffusion,
                    ),
                    "photo_maker" => (params.photo_maker.is_some(), ModelKind::Checkpoint),
                    _ => continue,
                };
                if !provided {
                    errors.push(format!(
                        "Missing required component for {}: '{component}' ({description}) \
                         (searched in: {})",
                        preset.id,
                        searched(kind)
                    ));
                }
            }
        }

        if !errors.is_empty() {
            let mut message = String::from("Model validation failed:\n");
            for err in &errors {
                message.push_str("  - ");
                message.push_str(err);
                message.push('\n');
            }
            self.record_load_failure(&params.model_name, &message);
            return Err(LifecycleError::Validation(message));
        }
        let main = main.expect("validated above");

        // Phase 2: swap. Free the resident context before constructing the
        // next one so both never occupy the GPU together.
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            self.loaded.store(false, Ordering::Release);
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.model_name.clear();
            snap.architecture.clear();
            snap.components.clear();
        }

        // Phase 3: build the context-parameter record.
        let main_path = main.full_path.to_string_lossy().into_owned();
        let mut cp = ContextParams {
            n_threads: if params.n_threads > 0 {
                params.n_threads
            } else {
                self.engine.physical_cores()
            },
            weight_type: params.weight_type.clone(),
            tensor_type_rules: params.tensor_type_rules.clone(),
            rng_type: params.rng_type,
            sampler_rng_type: params.sampler_rng_type,
            prediction: params.prediction.clone(),
            lora_apply_mode: params.lora_apply_mode,
            keep_clip_on_cpu: params.keep_clip_on_cpu,
            keep_vae_on_cpu: params.keep_vae_on_cpu,
            keep_control_net_on_cpu: params.keep_controlnet_on_cpu,
            offload_params_to_cpu: params.offload_to_cpu,
            enable_mmap: params.enable_mmap,
            vae_decode_only: params.vae_decode_only,
            vae_conv_direct: params.vae_conv_direct,
            diffusion_conv_direct: params.diffusion_conv_direct,
            tae_preview_only: params.tae_preview_only,
            free_params_immediately: params.free_params_immediately,
            flash_attn: params.flash_attn,
            flow_shift: params.flow_shift,
            vae_tiling: params.vae_tiling,
            vae_tile_size_x: params.vae_tile_size_x,
            vae_tile_size_y: params.vae_tile_size_y,
            vae_tile_overlap: params.vae_tile_overlap,
            force_sdxl_vae_conv_scale: params.force_sdxl_vae_conv_scale,
            chroma_use_dit_mask: params.chroma_use_dit_mask,
            chroma_use_t5_mask: params.chroma_use_t5_mask,
            chroma_t5_mask_pad: params.chroma_t5_mask_pad,
            ..ContextParams::default()
        };
        match params.model_type {
            ModelKind::Diffusion => cp.diffusion_model_path = main_path,
            _ => cp.model_path = main_path,
        }
        cp.vae_path = vae.unwrap_or_default();
        cp.clip_l_path = clip_l.unwrap_or_default();
        cp.clip_g_path = clip_g.unwrap_or_default();
        cp.clip_vision_path = clip_vision.unwrap_or_default();
        cp.t5xxl_path = t5xxl.unwrap_or_default();
        cp.control_net_path = controlnet.unwrap_or_default();
        cp.llm_path = llm.unwrap_or_default();
        cp.llm_vision_path = llm_vision.unwrap_or_default();
        cp.taesd_path = taesd.unwrap_or_default();
        cp.high_noise_diffusion_model_path = high_noise.unwrap_or_default();
        cp.photo_maker_path = photo_maker.unwrap_or_default();
        if let Some(dir) = self.registry.base_dir(ModelKind::Embedding) {
            cp.embedding_dir = dir.to_string_lossy().into_owned();
        }

        info!(
            model = %params.model_name,
            threads = cp.n_threads,
            lora_mode = %params.lora_apply_mode,
            "loading model"
        );

        // Phase 4: loader progress feeds the atomics and the event bus.
        let step = Arc::clone(&self.loading_step);
        let total = Arc::clone(&self.loading_total);
        let bus = Arc::clone(&self.bus);
        let loading_name = params.model_name.clone();
        hooks::set_progress_hook(Box::new(move |s, t| {
            step.store(s, Ordering::Relaxed);
            total.store(t, Ordering::Relaxed);
            bus.broadcast(
                EventKind::ModelLoadingProgress,
                json!({ "model_name": loading_name, "step": s, "total_steps": t }),
            );
        }));

        let created = self.engine.new_context(&cp);
        hooks::clear_progress_hook();

        let context = match created {
            Ok(ctx) => ctx,
            Err(e) => {
                let message = format!("Failed to load model: {}: {e}", params.model_name);
                // Leave no stale names behind a failed swap.
                {
                    let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                    *snap = LoadedSnapshot {
                        last_error: message.clone(),
                        ..LoadedSnapshot::default()
                    };
                }
                self.loaded.store(false, Ordering::Release);
                self.bus.broadcast(
                    EventKind::ModelLoadFailed,
                    json!({ "model_name": params.model_name, "error": message }),
                );
                return Err(LifecycleError::Engine(e));
            }
        };

        // Phase 5: publish the new resident model.
        let architecture = context.architecture().to_string();
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.model_name = params.model_name.clone();
            snap.model_kind = params.model_type;
            snap.architecture = architecture.clone();
            snap.components.clear();
            let mut put = |key: &'static str, v: &Option<String>| {
                if let Some(v) = v {
                    snap.components.insert(key, v.clone());
                }
            };
            put("vae", &params.vae);
            put("clip_l", &params.clip_l);
            put("clip_g", &params.clip_g);
            put("clip_vision", &params.clip_vision);
            put("t5xxl", &params.t5xxl);
            put("controlnet", &params.controlnet);
            put("llm", &params.llm);
            put("llm_vision", &params.llm_vision);
            put("taesd", &params.taesd);
            put("high_noise_diffusion_model", &params.high_noise_diffusion_model);
            put("photo_maker", &params.photo_maker);
            snap.options = load_options_json(params);
            snap.last_error.clear();
        }
        *slot = Some(context);
        self.loaded.store(true, Ordering::Release);

        info!(model = %params.model_name, architecture = %architecture, "model loaded");
        self.bus.broadcast(
            EventKind::ModelLoaded,
            json!({
                "model_name": params.model_name,
                "model_type": params.model_type.as_ref(),
                "model_architecture": architecture,
            }),
        );
        Ok(())
    }

    fn record_load_failure(&self, model_name: &str, message: &str) {
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.last_error = message.to_string();
        }
        self.bus.broadcast(
            EventKind::ModelLoadFailed,
            json!({ "model_name": model_name, "error": message }),
        );
    }

    pub fn unload(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let name = {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.last_error.clear();
            std::mem::take(&mut snap.model_name)
        };
        if slot.take().is_none() {
            return;
        }
        self.loaded.store(false, Ordering::Release);
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            *snap = LoadedSnapshot::default();
        }
        info!(model = %name, "model unloaded");
        self.bus
            .broadcast(EventKind::ModelUnloaded, json!({ "model_name": name }));
    }

    /// Run `f` while exclusively holding the inference slot. The HTTP
    /// status paths must never call this; it blocks for the whole
    /// generation.
    pub fn with_context<R>(
        &self,
        f: impl FnOnce(&dyn GenerationContext) -> R,
    ) -> Result<R, LifecycleError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = slot.as_deref().ok_or(LifecycleError::NoModelLoaded)?;
        Ok(f(ctx))
    }

    /// Resident snapshot used by `/health`, job `model_settings` copies and
    /// the assistant's `get_status`. Lock-free with respect to the slot.
    pub fn loaded_models_info(&self) -> Value {
        let is_loaded = self.is_loaded();
        let is_loading = self.is_loading();
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());

        let mut result = json!({
            "model_loaded": is_loaded,
            "model_loading": is_loading,
            "loading_model_name": if is_loading && !snap.loading_model_name.is_empty() {
                json!(snap.loading_model_name)
            } else {
                Value::Null
            },
            "last_error": if snap.last_error.is_empty() {
                Value::Null
            } else {
                json!(snap.last_error)
            },
            "loading_step": if is_loading {
                json!(self.loading_step.load(Ordering::Relaxed))
            } else {
                Value::Null
            },
            "loading_total_steps": if is_loading {
                json!(self.loading_total.load(Ordering::Relaxed))
            } else {
                Value::Null
            },
        });

        if is_loaded {
            result["model_name"] = json!(snap.model_name);
            result["model_type"] = json!(snap.model_kind.as_ref());
            result["model_architecture"] = if snap.architecture.is_empty() {
                Value::Null
            } else {
                json!(snap.architecture)
            };
            result["loaded_components"] = json!(snap.components);
            if !snap.options.is_null() {
                result["load_options"] = snap.options.clone();
            }
        } else {
            result["model_name"] = Value::Null;
            result["model_type"] = Value::Null;
            result["model_architecture"] = Value::Null;
            result["loaded_components"] = json!({});
        }
        drop(snap);

        let upscaler = self.upscaler.read().unwrap_or_else(|e| e.into_inner());
        result["upscaler_loaded"] = json!(self.is_upscaler_loaded());
        result["upscaler_name"] = if upscaler.model_name.is_empty() {
            Value::Null
        } else {
            json!(upscaler.model_name)
        };

        result
    }

    // ── Upscaler slot ────────────────────────────────────────────────────

    pub fn load_upscaler(
        &self,
        model_name: &str,
        n_threads: i32,
        tile_size: i32,
    ) -> Result<(), LifecycleError> {
        let entry = self
            .registry
            .get(ModelKind::Esrgan, model_name)
            .ok_or_else(|| {
                let dir = self
                    .registry
                    .base_dir(ModelKind::Esrgan)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "<not configured>".to_string());
                LifecycleError::Validation(format!(
                    "Upscaler model not found: '{model_name}' (searched in: {dir})"
                ))
            })?;

        let params = UpscalerParams {
            model_path: entry.full_path.to_string_lossy().into_owned(),
            n_threads: if n_threads > 0 {
                n_threads
            } else {
                self.engine.physical_cores()
            },
            tile_size,
        };

        let mut slot = self.upscaler_slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take();
        self.upscaler_loaded.store(false, Ordering::Release);

        match self.engine.new_upscaler(&params) {
            Ok(ctx) => {
                *slot = Some(ctx);
                self.upscaler_loaded.store(true, Ordering::Release);
                {
                    let mut snap = self.upscaler.write().unwrap_or_else(|e| e.into_inner());
                    snap.model_name = model_name.to_string();
                    snap.last_error.clear();
                }
                info!(model = model_name, "upscaler loaded");
                self.bus
                    .broadcast(EventKind::UpscalerLoaded, json!({ "model_name": model_name }));
                Ok(())
            }
            Err(e) => {
                {
                    let mut snap = self.upscaler.write().unwrap_or_else(|e| e.into_inner());
                    snap.model_name.clear();
                    snap.last_error = e.to_string();
                }
                warn!(model = model_name, error = %e, "upscaler load failed");
                Err(LifecycleError::Engine(e))
            }
        }
    }

    pub fn unload_upscaler(&self) {
        let mut slot = self.upscaler_slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_none() {
            return;
        }
        self.upscaler_loaded.store(false, Ordering::Release);
        let name = {
            let mut snap = self.upscaler.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut snap.model_name)
        };
        info!(model = %name, "upscaler unloaded");
        self.bus
            .broadcast(EventKind::UpscalerUnloaded, json!({ "model_name": name }));
    }

    pub fn with_upscaler<R>(
        &self,
        f: impl FnOnce(&dyn UpscaleContext) -> R,
    ) -> Result<R, LifecycleError> {
        let slot = self.upscaler_slot.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = slot.as_deref().ok_or(LifecycleError::NoUpscalerLoaded)?;
        Ok(f(ctx))
    }

    pub fn upscale_factor(&self) -> Option<u32> {
        self.with_upscaler(|u| u.factor()).ok()
    }
}

/// The options persisted into the loaded snapshot so a job can be reloaded
/// with the exact configuration it ran under.
fn load_options_json(params: &LoadParams) -> Value {
    let mut options = json!({
        "n_threads": params.n_threads,
        "keep_clip_on_cpu": params.keep_clip_on_cpu,
        "keep_vae_on_cpu": params.keep_vae_on_cpu,
        "keep_controlnet_on_cpu": params.keep_controlnet_on_cpu,
        "flash_attn": params.flash_attn,
        "offload_to_cpu": params.offload_to_cpu,
        "enable_mmap": params.enable_mmap,
        "vae_decode_only": params.vae_decode_only,
        "vae_conv_direct": params.vae_conv_direct,
        "diffusion_conv_direct": params.diffusion_conv_direct,
        "tae_preview_only": params.tae_preview_only,
        "free_params_immediately": params.free_params_immediately,
        "rng_type": params.rng_type,
        "lora_apply_mode": params.lora_apply_mode,
        "vae_tiling": params.vae_tiling,
        "vae_tile_size_x": params.vae_tile_size_x,
        "vae_tile_size_y": params.vae_tile_size_y,
        "vae_tile_overlap": params.vae_tile_overlap,
        "chroma_use_dit_mask": params.chroma_use_dit_mask,
        "chroma_use_t5_mask": params.chroma_use_t5_mask,
        "chroma_t5_mask_pad": params.chroma_t5_mask_pad,
    });
    if let Some(fs) = params.flow_shift {
        options["flow_shift"] = json!(fs);
    }
    if !params.weight_type.is_empty() {
        options["weight_type"] = json!(params.weight_type);
    }
    if !params.tensor_type_rules.is_empty() {
        options["tensor_type_rules"] = json!(params.tensor_type_rules);
    }
    if let Some(rng) = params.sampler_rng_type {
        options["sampler_rng_type"] = json!(rng);
    }
    if !params.prediction.is_empty() {
        options["prediction"] = json!(params.prediction);
    }
    options
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PathsConfig;
    use sdhost_engine::software::SoftwareEngine;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Arc<SoftwareEngine>,
        lifecycle: ModelLifecycle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("checkpoints");
        let vae = dir.path().join("vae");
        std::fs::create_dir_all(&ckpt).unwrap();
        std::fs::create_dir_all(&vae).unwrap();
        std::fs::write(ckpt.join("sdxl_base.safetensors"), b"w").unwrap();
        std::fs::write(vae.join("fixed.safetensors"), b"v").unwrap();

        let registry = Arc::new(ModelRegistry::new(PathsConfig {
            checkpoints: ckpt.to_string_lossy().into_owned(),
            vae: vae.to_string_lossy().into_owned(),
            ..PathsConfig::default()
        }));
        registry.scan();

        let engine = Arc::new(SoftwareEngine::new());
        let bus = Arc::new(EventBus::new(64));
        let lifecycle = ModelLifecycle::new(registry, engine.clone(), bus);
        Fixture {
            _dir: dir,
            engine,
            lifecycle,
        }
    }

    fn load_request(name: &str) -> LoadParams {
        LoadParams {
            model_name: name.into(),
            ..LoadParams::default()
        }
    }

    #[test]
    fn load_then_status_then_unload() {
        let fx = fixture();
        fx.lifecycle.load(load_request("sdxl_base.safetensors")).unwrap();
        assert!(fx.lifecycle.is_loaded());

        let info = fx.lifecycle.loaded_models_info();
        assert_eq!(info["model_loaded"], true);
        assert_eq!(info["model_name"], "sdxl_base.safetensors");
        assert_eq!(info["model_architecture"], "SDXL");
        assert_eq!(info["load_options"]["lora_apply_mode"], "at_runtime");

        fx.lifecycle.unload();
        assert!(!fx.lifecycle.is_loaded());
        let info = fx.lifecycle.loaded_models_info();
        assert_eq!(info["model_name"], Value::Null);
        assert_eq!(info["loaded_components"], json!({}));
    }

    #[test]
    fn validation_lists_every_missing_component() {
        let fx = fixture();
        let err = fx
            .lifecycle
            .load(LoadParams {
                model_name: "missing.safetensors".into(),
                vae: Some("ghost.safetensors".into()),
                t5xxl: Some("t5.gguf".into()),
                ..LoadParams::default()
            })
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("Main model not found: 'missing.safetensors'"));
        assert!(msg.contains("VAE model not found: 'ghost.safetensors'"));
        assert!(msg.contains("T5 model not found: 't5.gguf'"));
        assert!(msg.contains("<not configured>"), "t5 root is unset: {msg}");

        // Validation failure never evicts the resident model.
        assert!(!fx.lifecycle.is_loaded());
        let info = fx.lifecycle.loaded_models_info();
        assert!(info["last_error"].as_str().unwrap().contains("validation failed"));
    }

    #[test]
    fn validation_failure_keeps_current_model() {
        let fx = fixture();
        fx.lifecycle.load(load_request("sdxl_base.safetensors")).unwrap();
        let err = fx.lifecycle.load(load_request("missing.safetensors"));
        assert!(err.is_err());
        assert!(fx.lifecycle.is_loaded());
        assert_eq!(
            fx.lifecycle.loaded_model().unwrap().0,
            "sdxl_base.safetensors"
        );
    }

    #[test]
    fn engine_failure_clears_all_cached_names() {
        let fx = fixture();
        fx.lifecycle.load(load_request("sdxl_base.safetensors")).unwrap();

        fx.engine.set_fail_context(true);
        let err = fx.lifecycle.load(LoadParams {
            model_name: "sdxl_base.safetensors".into(),
            vae: Some("fixed.safetensors".into()),
            ..LoadParams::default()
        });
        assert!(matches!(err, Err(LifecycleError::Engine(_))));
        assert!(!fx.lifecycle.is_loaded());

        let info = fx.lifecycle.loaded_models_info();
        assert_eq!(info["model_name"], Value::Null);
        assert!(info["last_error"].as_str().unwrap().contains("Failed to load model"));
    }

    #[test]
    fn architecture_gating_lists_missing_required_components() {
        let fx = fixture();
        std::fs::write(
            fx._dir.path().join("checkpoints").join("flux1-dev.safetensors"),
            b"w",
        )
        .unwrap();
        fx.lifecycle.registry.scan();
        std::fs::write(
            fx._dir.path().join("model_architectures.json"),
            r#"{"architectures": {"Flux": {
                "name": "Flux",
                "requiredComponents": {
                    "vae": "Autoencoder",
                    "clip_l": "CLIP-L text encoder",
                    "t5xxl": "T5-XXL text encoder"
                }
            }}}"#,
        )
        .unwrap();
        let catalog = Arc::new(crate::catalog::ArchitectureCatalog::new(fx._dir.path()));
        fx.lifecycle.set_catalog(catalog);

        let err = fx
            .lifecycle
            .load(load_request("flux1-dev.safetensors"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'vae'"), "{msg}");
        assert!(msg.contains("'clip_l'"), "{msg}");
        assert!(msg.contains("'t5xxl'"), "{msg}");
        assert!(!fx.lifecycle.is_loaded());

        // Supplying the required components (where they exist) narrows the
        // report to what is still missing.
        let err = fx
            .lifecycle
            .load(LoadParams {
                model_name: "flux1-dev.safetensors".into(),
                vae: Some("fixed.safetensors".into()),
                ..LoadParams::default()
            })
            .unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("'vae'"), "{msg}");
        assert!(msg.contains("'clip_l'"), "{msg}");
    }

    #[test]
    fn with_context_requires_a_loaded_model() {
        let fx = fixture();
        assert!(matches!(
            fx.lifecycle.with_context(|_| ()),
            Err(LifecycleError::NoModelLoaded)
        ));
    }

    #[test]
    fn upscaler_slot_is_independent() {
        let fx = fixture();
        // No esrgan root configured: a clean validation error.
        let err = fx.lifecycle.load_upscaler("RealESRGAN_x4plus.pth", -1, 128);
        assert!(matches!(err, Err(LifecycleError::Validation(_))));
        assert!(!fx.lifecycle.is_upscaler_loaded());
    }
}
