//! The queue worker: a single consumer thread over the pending FIFO.
//!
//! Per iteration it marks a job Processing under the store lock, releases
//! every lock, installs the progress/preview hooks, dispatches to the
//! type-specific handler, uninstalls the hooks on every exit path, writes
//! the final status back and persists. Exactly one worker exists; it is the
//! only thread that takes the inference slot while a job runs.
//!
//! In-flight jobs cannot be interrupted (the backend has no mid-step
//! cancellation), so `stop()` waits up to five seconds for the current job
//! and then detaches the thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use sdhost_engine::{
    ConvertRequest, DiffusionEngine, Img2ImgParams, PreviewMode, RawImage, Txt2ImgParams,
    Txt2VidParams, UpscaleParams, decode_base64_image, hooks, load_image,
    parse_loras_from_prompt, save_png,
};
use sdhost_fetch::{DownloadRequest, DownloadSource, Fetcher};

use super::job::JobType;
use super::preview::{PreviewBuffer, PreviewFrame};
use super::store::{Dispatched, JobStore};
use crate::capture::ErrorCapture;
use crate::events::{EventBus, EventKind};
use crate::lifecycle::ModelLifecycle;
use crate::registry::{ModelKind, ModelRegistry, sha256_file_with_progress};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    store: Arc<JobStore>,
    lifecycle: Arc<ModelLifecycle>,
    registry: Arc<ModelRegistry>,
    previews: Arc<PreviewBuffer>,
    bus: Arc<EventBus>,
    capture: Arc<ErrorCapture>,
    engine: Arc<dyn DiffusionEngine>,
    fetcher: Arc<dyn Fetcher>,
    output_dir: PathBuf,
    runtime: tokio::runtime::Handle,

    preview: Mutex<hooks::PreviewSettings>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        lifecycle: Arc<ModelLifecycle>,
        registry: Arc<ModelRegistry>,
        previews: Arc<PreviewBuffer>,
        bus: Arc<EventBus>,
        capture: Arc<ErrorCapture>,
        engine: Arc<dyn DiffusionEngine>,
        fetcher: Arc<dyn Fetcher>,
        output_dir: PathBuf,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            lifecycle,
            registry,
            previews,
            bus,
            capture,
            engine,
            fetcher,
            output_dir,
            runtime,
            preview: Mutex::new(hooks::PreviewSettings::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn preview_settings(&self) -> hooks::PreviewSettings {
        *self.preview.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_preview_settings(&self, settings: hooks::PreviewSettings) {
        *self.preview.lock().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("queue-worker".into())
            .spawn(move || {
                info!("worker thread started");
                loop {
                    let Some(dispatched) = worker.store.next_job(&worker.running) else {
                        break;
                    };
                    worker.run_job(dispatched);
                }
                info!("worker thread stopped");
            })
            .expect("spawn queue-worker thread");
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop after the current job. Waits up to five seconds, then detaches:
    /// the backend cannot abort a generation mid-step.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.store.notify();

        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let start = Instant::now();
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                if start.elapsed() >= SHUTDOWN_TIMEOUT {
                    warn!("worker did not stop in time; detaching thread");
                    drop(handle);
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        self.store.save();
    }

    fn report_progress(&self, step: i32, total_steps: i32) {
        if let Some(job_id) = self.store.record_progress(step, total_steps) {
            self.bus.broadcast(
                EventKind::JobProgress,
                json!({ "job_id": job_id, "step": step, "total_steps": total_steps }),
            );
        }
    }

    fn run_job(&self, dispatched: Dispatched) {
        let job_id = dispatched.id.clone();
        self.store.begin_current(&job_id);

        // Progress: the store cell is updated unconditionally for polling;
        // the broadcast side is throttled by the bus.
        {
            let store = Arc::clone(&self.store);
            let bus = Arc::clone(&self.bus);
            hooks::set_progress_hook(Box::new(move |step, total| {
                if let Some(id) = store.record_progress(step, total) {
                    bus.broadcast(
                        EventKind::JobProgress,
                        json!({ "job_id": id, "step": step, "total_steps": total }),
                    );
                }
            }));
        }

        // Previews: every frame lands in the buffer for HTTP; WebSocket gets
        // a throttled metadata-only notification.
        let settings = self.preview_settings();
        if settings.mode != PreviewMode::None {
            let store = Arc::clone(&self.store);
            let bus = Arc::clone(&self.bus);
            let previews = Arc::clone(&self.previews);
            hooks::set_preview_hook(
                Box::new(move |step, frame_count, jpeg, width, height, is_noisy| {
                    let Some(id) = store.current_job_id() else {
                        return;
                    };
                    previews.store(
                        &id,
                        PreviewFrame {
                            jpeg: jpeg.to_vec(),
                            width,
                            height,
                            step,
                            frame_count,
                            is_noisy,
                        },
                    );
                    bus.broadcast(
                        EventKind::JobPreview,
                        json!({
                            "job_id": id,
                            "step": step,
                            "frame_count": frame_count,
                            "width": width,
                            "height": height,
                            "is_noisy": is_noisy,
                            "preview_url": format!("/jobs/{id}/preview"),
                        }),
                    );
                }),
                settings,
            );
        }

        // The worker must outlive any single job: a panicking handler (or
        // backend) becomes a failed job, not a dead queue.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process(&dispatched)
        }))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job handler panicked".to_string());
            Err(anyhow!("{message}"))
        });

        hooks::clear_progress_hook();
        hooks::clear_preview_hook();

        let outcome = result.map_err(|e| {
            let mut message = format!("{e:#}");
            // The backend's return values are often just "failed"; the log
            // hook captured the real reason if one was emitted recently.
            let native = self.capture.get_and_clear();
            if !native.is_empty() && !message.contains(&native) {
                message = format!("{message}: {native}");
            }
            message
        });

        self.store.finalize(&job_id, outcome);
        self.store.clear_current();
        self.previews.clear(&job_id);
        self.store.save();
    }

    fn process(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        match dispatched.job_type {
            JobType::Txt2img => self.process_txt2img(dispatched),
            JobType::Img2img => self.process_img2img(dispatched),
            JobType::Txt2vid => self.process_txt2vid(dispatched),
            JobType::Upscale => self.process_upscale(dispatched),
            JobType::Convert => self.process_convert(dispatched),
            JobType::ModelDownload => self.process_download(dispatched),
            JobType::ModelHash => self.process_hash(dispatched),
        }
    }

    // ── Generation handlers ──────────────────────────────────────────────

    fn process_txt2img(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let mut params: Txt2ImgParams = serde_json::from_value(dispatched.params.clone())
            .context("invalid txt2img parameters")?;
        let full = serde_json::to_value(&params)?;
        self.store.update_params(&dispatched.id, full.clone());

        let (prompt, loras) = parse_loras_from_prompt(&params.prompt, &self.registry.lora_dir());
        params.prompt = prompt;

        let mut images = self
            .lifecycle
            .with_context(|ctx| ctx.txt2img(&params, &loras))
            .map_err(|e| anyhow!("{e}"))?
            .map_err(|e| anyhow!("{e}"))?;

        if params.upscale {
            images = self.maybe_upscale(images, params.upscale_repeats)?;
        }

        let outputs = self.write_images(&dispatched.id, &images, "image", 3)?;
        self.save_job_config(&dispatched.id, dispatched.job_type, &full);
        Ok(outputs)
    }

    fn process_img2img(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let mut params: Img2ImgParams = serde_json::from_value(dispatched.params.clone())
            .context("invalid img2img parameters")?;
        if params.init_image_base64.is_empty() {
            bail!("init_image is required for img2img");
        }
        let full = serde_json::to_value(&params)?;
        self.store.update_params(&dispatched.id, full.clone());

        let (prompt, loras) = parse_loras_from_prompt(&params.prompt, &self.registry.lora_dir());
        params.prompt = prompt;

        let mut images = self
            .lifecycle
            .with_context(|ctx| ctx.img2img(&params, &loras))
            .map_err(|e| anyhow!("{e}"))?
            .map_err(|e| anyhow!("{e}"))?;

        if params.upscale {
            images = self.maybe_upscale(images, params.upscale_repeats)?;
        }

        let outputs = self.write_images(&dispatched.id, &images, "image", 3)?;
        self.save_job_config(&dispatched.id, dispatched.job_type, &full);
        Ok(outputs)
    }

    fn process_txt2vid(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let mut params: Txt2VidParams = serde_json::from_value(dispatched.params.clone())
            .context("invalid txt2vid parameters")?;
        let full = serde_json::to_value(&params)?;
        self.store.update_params(&dispatched.id, full.clone());

        let (prompt, loras) = parse_loras_from_prompt(&params.prompt, &self.registry.lora_dir());
        params.prompt = prompt;

        let frames = self
            .lifecycle
            .with_context(|ctx| ctx.txt2vid(&params, &loras))
            .map_err(|e| anyhow!("{e}"))?
            .map_err(|e| anyhow!("{e}"))?;

        let outputs = self.write_images(&dispatched.id, &frames, "frame", 5)?;
        self.save_job_config(&dispatched.id, dispatched.job_type, &full);
        Ok(outputs)
    }

    fn process_upscale(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let params: UpscaleParams = serde_json::from_value(dispatched.params.clone())
            .context("invalid upscale parameters")?;
        let full = serde_json::to_value(&params)?;
        self.store.update_params(&dispatched.id, full.clone());

        let mut image = if let Some(b64) = params.image_base64.as_deref() {
            decode_base64_image(b64).map_err(|e| anyhow!("{e}"))?
        } else if let Some(path) = params.image_path.as_deref() {
            load_image(&self.output_dir.join(path)).map_err(|e| anyhow!("{e}"))?
        } else {
            bail!("either image_base64 or image_path is required for upscale");
        };

        let repeats = params.repeats.max(1);
        image = self
            .lifecycle
            .with_upscaler(|up| -> Result<RawImage, sdhost_engine::EngineError> {
                let mut current = image.clone();
                for pass in 1..=repeats {
                    self.report_progress(pass, repeats);
                    current = up.upscale(&current)?;
                }
                Ok(current)
            })
            .map_err(|e| anyhow!("{e}. Load an ESRGAN model first using /upscaler/load"))?
            .map_err(|e| anyhow!("{e}"))?;

        let outputs = self.write_images(&dispatched.id, &[image], "upscaled", 3)?;
        self.save_job_config(&dispatched.id, dispatched.job_type, &full);
        Ok(outputs)
    }

    fn maybe_upscale(
        &self,
        images: Vec<RawImage>,
        repeats: i32,
    ) -> anyhow::Result<Vec<RawImage>> {
        if !self.lifecycle.is_upscaler_loaded() {
            warn!("upscale requested but no upscaler loaded; keeping original size");
            return Ok(images);
        }
        self.lifecycle
            .with_upscaler(|up| -> Result<Vec<RawImage>, sdhost_engine::EngineError> {
                let mut out = Vec::with_capacity(images.len());
                for image in &images {
                    let mut current = image.clone();
                    for _ in 0..repeats.max(1) {
                        current = up.upscale(&current)?;
                    }
                    out.push(current);
                }
                Ok(out)
            })
            .map_err(|e| anyhow!("{e}"))?
            .map_err(|e| anyhow!("{e}"))
    }

    // ── Model maintenance handlers ───────────────────────────────────────

    fn process_convert(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let params = &dispatched.params;
        let input_path = required_str(params, "input_path")?;
        let output_path = required_str(params, "output_path")?;
        let output_type = required_str(params, "output_type")?;

        if !std::path::Path::new(&input_path).exists() {
            bail!("input file does not exist: {input_path}");
        }

        info!(input = %input_path, output = %output_path, r#type = %output_type, "converting model");
        self.engine
            .convert_model(&ConvertRequest {
                input_path,
                vae_path: params["vae_path"].as_str().unwrap_or("").to_string(),
                output_path: output_path.clone(),
                output_type,
                tensor_type_rules: params["tensor_type_rules"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            })
            .map_err(|e| anyhow!("{e}"))?;

        // Make the converted file discoverable right away.
        self.registry.scan();
        Ok(vec![output_path])
    }

    fn process_download(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let hash_job_id = self
            .store
            .get(&dispatched.id)
            .and_then(|j| j.linked_job_id);

        let outcome = self.run_download(dispatched, hash_job_id.as_deref());

        if let Err(e) = &outcome {
            // The paired hash job must reach a terminal state even when the
            // download never produced a file.
            if let Some(hash_id) = &hash_job_id {
                self.store
                    .fail_linked(hash_id, &format!("Download failed: {e:#}"));
                self.store.save();
            }
        }
        outcome
    }

    fn run_download(
        &self,
        dispatched: &Dispatched,
        hash_job_id: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        let params = &dispatched.params;
        let model_type: ModelKind = params["model_type"]
            .as_str()
            .unwrap_or("checkpoint")
            .parse()
            .map_err(|_| anyhow!("unknown model type: {}", params["model_type"]))?;
        let dest_dir = self
            .registry
            .base_dir(model_type)
            .ok_or_else(|| anyhow!("no directory configured for model type {model_type}"))?;

        let source = match params["source"].as_str().unwrap_or("url") {
            "civitai" => DownloadSource::Civitai {
                model_id: required_str(params, "model_id")
                    .map_err(|_| anyhow!("CivitAI model_id is required"))?,
            },
            "huggingface" | "hf" => DownloadSource::Huggingface {
                repo_id: required_str(params, "repo_id")
                    .map_err(|_| anyhow!("HuggingFace repo_id and filename are required"))?,
                filename: required_str(params, "filename")
                    .map_err(|_| anyhow!("HuggingFace repo_id and filename are required"))?,
                revision: params["revision"]
                    .as_str()
                    .filter(|r| !r.is_empty())
                    .unwrap_or("main")
                    .to_string(),
            },
            _ => DownloadSource::Url {
                url: required_str(params, "url").map_err(|_| anyhow!("download URL is required"))?,
                filename: params["filename"].as_str().unwrap_or("").to_string(),
            },
        };

        let request = DownloadRequest {
            source,
            dest_dir,
            subfolder: params["subfolder"].as_str().unwrap_or("").to_string(),
        };

        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let progress = move |downloaded: u64, total: u64| {
            let pct = if total > 0 {
                ((downloaded.saturating_mul(100)) / total) as i32
            } else {
                0
            };
            if let Some(id) = store.record_progress(pct, 100) {
                bus.broadcast(
                    EventKind::JobProgress,
                    json!({ "job_id": id, "step": pct, "total_steps": 100 }),
                );
            }
        };

        let result = self
            .runtime
            .block_on(self.fetcher.download(&request, &progress))
            .map_err(|e| anyhow!("{e}"))?;

        if let Some(hash_id) = hash_job_id {
            self.store.enqueue_linked_hash(
                hash_id,
                &result.file_path.to_string_lossy(),
                &result.file_name,
                result.metadata.clone(),
            );
        }
        self.registry.scan();

        Ok(vec![result.file_path.to_string_lossy().into_owned()])
    }

    fn process_hash(&self, dispatched: &Dispatched) -> anyhow::Result<Vec<String>> {
        let file_path = required_str(&dispatched.params, "file_path")
            .map_err(|_| anyhow!("file path is required for hashing"))?;
        if !std::path::Path::new(&file_path).exists() {
            bail!("file not found: {file_path}");
        }

        self.report_progress(0, 100);
        let hash = sha256_file_with_progress(std::path::Path::new(&file_path), |read, total| {
            if total > 0 {
                let pct = ((read.saturating_mul(100)) / total) as i32;
                self.report_progress(pct, 100);
            }
        })
        .with_context(|| format!("failed to hash {file_path}"))?;
        self.report_progress(100, 100);

        info!(file = %file_path, hash = %hash, "model hash computed");
        Ok(vec![hash])
    }

    // ── Output helpers ───────────────────────────────────────────────────

    fn write_images(
        &self,
        job_id: &str,
        images: &[RawImage],
        prefix: &str,
        index_width: usize,
    ) -> anyhow::Result<Vec<String>> {
        let dir = self.output_dir.join(job_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create job output dir {}", dir.display()))?;

        let mut outputs = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let name = format!("{prefix}_{i:0index_width$}.png");
            save_png(&dir.join(&name), image).map_err(|e| anyhow!("{e}"))?;
            outputs.push(format!("{job_id}/{name}"));
        }
        Ok(outputs)
    }

    /// `config.json` written beside the outputs is the canonical record for
    /// replaying a job: fully materialized params plus the model snapshot.
    fn save_job_config(&self, job_id: &str, job_type: JobType, params: &Value) {
        let dir = self.output_dir.join(job_id);
        if !dir.exists() {
            return;
        }
        let mut config = json!({
            "job_id": job_id,
            "type": job_type.as_ref(),
            "created_at": Utc::now().to_rfc3339(),
            "params": params,
        });
        let model_settings = self.store.model_settings_of(job_id);
        if !model_settings.is_null() {
            config["model_settings"] = model_settings;
        }
        let path = dir.join("config.json");
        match serde_json::to_string_pretty(&config) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    warn!(path = %path.display(), error = %e, "failed to write job config");
                }
            }
            Err(e) => warn!(error = %e, "cannot serialize job config"),
        }
    }
}

fn required_str(params: &Value, key: &str) -> anyhow::Result<String> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{key} is required"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PathsConfig, RecycleBinConfig};
    use crate::queue::{JobStatus, JobType};
    use base64::Engine as _;
    use sdhost_engine::software::SoftwareEngine;
    use sdhost_fetch::{DownloadResult, FetchError, ProgressFn};

    /// Test double for the download seam: materializes a small file, or
    /// fails when constructed with `failing`.
    struct StubFetcher {
        payload: Vec<u8>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Fetcher for StubFetcher {
        async fn download(
            &self,
            request: &DownloadRequest,
            progress: &ProgressFn,
        ) -> Result<DownloadResult, FetchError> {
            if self.fail {
                return Err(FetchError::Upstream("HTTP 404".into()));
            }
            let name = "fetched.safetensors".to_string();
            let path = request.dest_dir.join(&name);
            std::fs::create_dir_all(&request.dest_dir)?;
            std::fs::write(&path, &self.payload)?;
            progress(self.payload.len() as u64, self.payload.len() as u64);
            Ok(DownloadResult {
                file_path: path,
                file_name: name,
                file_size: self.payload.len() as u64,
                metadata: json!({"source": "stub"}),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        rt: tokio::runtime::Runtime,
        engine: Arc<SoftwareEngine>,
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<ModelLifecycle>,
        store: Arc<JobStore>,
        previews: Arc<PreviewBuffer>,
        bus: Arc<EventBus>,
        capture: Arc<ErrorCapture>,
        output_dir: PathBuf,
        checkpoints: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let checkpoints = dir.path().join("checkpoints");
            let esrgan = dir.path().join("esrgan");
            let output_dir = dir.path().join("output");
            std::fs::create_dir_all(&checkpoints).unwrap();
            std::fs::create_dir_all(&esrgan).unwrap();
            std::fs::create_dir_all(&output_dir).unwrap();
            std::fs::write(checkpoints.join("sd15.safetensors"), b"w").unwrap();
            std::fs::write(esrgan.join("RealESRGAN_x4plus.pth"), b"u").unwrap();

            let registry = Arc::new(ModelRegistry::new(PathsConfig {
                checkpoints: checkpoints.to_string_lossy().into_owned(),
                esrgan: esrgan.to_string_lossy().into_owned(),
                output: output_dir.to_string_lossy().into_owned(),
                ..PathsConfig::default()
            }));
            registry.scan();

            let bus = Arc::new(EventBus::new(1024));
            let engine = Arc::new(SoftwareEngine::new());
            let lifecycle = Arc::new(ModelLifecycle::new(
                Arc::clone(&registry),
                engine.clone() as Arc<dyn DiffusionEngine>,
                Arc::clone(&bus),
            ));
            let store = Arc::new(JobStore::new(
                Arc::clone(&lifecycle),
                Arc::clone(&bus),
                output_dir.join("queue_state.json"),
                RecycleBinConfig::default(),
            ));

            Self {
                rt: tokio::runtime::Runtime::new().unwrap(),
                engine,
                registry,
                lifecycle,
                store,
                previews: Arc::new(PreviewBuffer::new()),
                bus,
                capture: Arc::new(ErrorCapture::new()),
                output_dir,
                checkpoints,
                _dir: dir,
            }
        }

        fn worker(&self, fetcher: Arc<dyn Fetcher>) -> Arc<Worker> {
            Worker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.lifecycle),
                Arc::clone(&self.registry),
                Arc::clone(&self.previews),
                Arc::clone(&self.bus),
                Arc::clone(&self.capture),
                self.engine.clone() as Arc<dyn DiffusionEngine>,
                fetcher,
                self.output_dir.clone(),
                self.rt.handle().clone(),
            )
        }

        fn load_model(&self) {
            self.lifecycle
                .load(crate::lifecycle::LoadParams {
                    model_name: "sd15.safetensors".into(),
                    ..crate::lifecycle::LoadParams::default()
                })
                .unwrap();
        }

        fn wait_for(&self, job_id: &str, status: JobStatus) -> crate::queue::Job {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let job = self.store.get(job_id).expect("job exists");
                if job.status == status {
                    return job;
                }
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for {job_id} to become {status}; currently {}",
                    job.status
                );
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    fn nop_fetcher() -> Arc<dyn Fetcher> {
        Arc::new(StubFetcher {
            payload: vec![],
            fail: true,
        })
    }

    #[test]
    fn txt2img_completes_with_outputs_and_replayable_config() {
        let fx = Fixture::new();
        fx.load_model();
        let worker = fx.worker(nop_fetcher());
        worker.start();

        let id = fx.store.add(
            JobType::Txt2img,
            json!({"prompt": "a lighthouse", "width": 16, "height": 16, "steps": 2}),
        );
        let job = fx.wait_for(&id, JobStatus::Completed);
        worker.stop();

        assert!(!job.outputs.is_empty());
        for rel in &job.outputs {
            assert!(fx.output_dir.join(rel).is_file(), "missing output {rel}");
        }
        // Params were materialized with defaults before running.
        assert_eq!(job.params["sampler"], "euler_a");
        assert_eq!(job.params["cfg_scale"], 7.0);

        let config: Value = serde_json::from_str(
            &std::fs::read_to_string(fx.output_dir.join(&id).join("config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(config["job_id"], id.as_str());
        assert_eq!(config["type"], "txt2img");
        assert_eq!(config["params"]["prompt"], "a lighthouse");
        assert_eq!(config["model_settings"]["model_name"], "sd15.safetensors");

        // Preview buffer is cleared once the job finalizes.
        assert!(fx.previews.get(&id).is_none());
    }

    #[test]
    fn jobs_run_in_fifo_order() {
        let fx = Fixture::new();
        fx.load_model();

        let a = fx.store.add(
            JobType::Txt2img,
            json!({"prompt": "a", "width": 8, "height": 8, "steps": 1}),
        );
        let b = fx.store.add(
            JobType::Txt2img,
            json!({"prompt": "b", "width": 8, "height": 8, "steps": 1}),
        );
        let worker = fx.worker(nop_fetcher());
        worker.start();

        let job_a = fx.wait_for(&a, JobStatus::Completed);
        let job_b = fx.wait_for(&b, JobStatus::Completed);
        worker.stop();

        assert!(job_a.completed_at.unwrap() <= job_b.started_at.unwrap() || job_a.started_at < job_b.started_at);
    }

    #[test]
    fn generation_without_model_fails_cleanly() {
        let fx = Fixture::new();
        let worker = fx.worker(nop_fetcher());
        worker.start();

        let id = fx.store.add(JobType::Txt2img, json!({"prompt": "x", "steps": 1}));
        let job = fx.wait_for(&id, JobStatus::Failed);
        worker.stop();

        assert!(job.error_message.unwrap().contains("no model loaded"));
    }

    #[test]
    fn native_failure_is_enriched_from_the_capture_ring() {
        let fx = Fixture::new();
        fx.load_model();
        fx.engine.set_fail_generation(true);
        // The engine emitted this through the log hook just before failing.
        fx.capture.capture("ggml compute graph failed");

        let worker = fx.worker(nop_fetcher());
        worker.start();
        let id = fx.store.add(JobType::Txt2img, json!({"prompt": "x", "steps": 1}));
        let job = fx.wait_for(&id, JobStatus::Failed);
        worker.stop();

        let msg = job.error_message.unwrap();
        assert!(msg.contains("generation failed"), "{msg}");
        assert!(msg.contains("ggml compute graph failed"), "{msg}");
    }

    #[test]
    fn download_then_hash_chain() {
        let fx = Fixture::new();
        let payload = b"model-bytes".to_vec();
        let worker = fx.worker(Arc::new(StubFetcher {
            payload,
            fail: false,
        }));
        worker.start();

        let (download_id, hash_id) = fx
            .store
            .add_download(json!({"source": "url", "url": "https://x/m.safetensors", "model_type": "checkpoint"}));

        let download = fx.wait_for(&download_id, JobStatus::Completed);
        let hash = fx.wait_for(&hash_id, JobStatus::Completed);
        worker.stop();

        assert_eq!(download.outputs.len(), 1);
        // The hash job's single output is the hex digest of the fetched file.
        assert_eq!(hash.outputs.len(), 1);
        assert_eq!(hash.outputs[0].len(), 64);
        assert!(hash.outputs[0].chars().all(|c| c.is_ascii_hexdigit()));
        // The new file is discoverable after the automatic rescan.
        assert!(fx
            .registry
            .get(ModelKind::Checkpoint, "fetched.safetensors")
            .is_some());
    }

    #[test]
    fn failed_download_fails_its_linked_hash_job() {
        let fx = Fixture::new();
        let worker = fx.worker(Arc::new(StubFetcher {
            payload: vec![],
            fail: true,
        }));
        worker.start();

        let (download_id, hash_id) =
            fx.store
                .add_download(json!({"source": "url", "url": "https://x/m.safetensors", "model_type": "checkpoint"}));

        let download = fx.wait_for(&download_id, JobStatus::Failed);
        let hash = fx.wait_for(&hash_id, JobStatus::Failed);
        worker.stop();

        assert!(download.error_message.unwrap().contains("404"));
        let hash_err = hash.error_message.unwrap();
        assert!(hash_err.starts_with("Download failed:"), "{hash_err}");
    }

    #[test]
    fn convert_job_rescans_registry() {
        let fx = Fixture::new();
        let output = fx.checkpoints.join("converted.q8_0.gguf");
        let worker = fx.worker(nop_fetcher());
        worker.start();

        let id = fx.store.add(
            JobType::Convert,
            json!({
                "input_path": fx.checkpoints.join("sd15.safetensors").to_string_lossy(),
                "output_path": output.to_string_lossy(),
                "output_type": "q8_0",
            }),
        );
        let job = fx.wait_for(&id, JobStatus::Completed);
        worker.stop();

        assert!(output.is_file());
        assert_eq!(job.outputs.len(), 1);
        assert!(fx
            .registry
            .get(ModelKind::Checkpoint, "converted.q8_0.gguf")
            .is_some());
    }

    #[test]
    fn upscale_job_from_base64() {
        let fx = Fixture::new();
        fx.lifecycle
            .load_upscaler("RealESRGAN_x4plus.pth", 1, 128)
            .unwrap();

        // A 2x2 PNG as base64.
        let img = RawImage {
            width: 2,
            height: 2,
            channels: 3,
            data: vec![200; 12],
        };
        let png = fx.output_dir.join("in.png");
        save_png(&png, &img).unwrap();
        let b64 = base64::engine::general_purpose::STANDARD
            .encode(std::fs::read(&png).unwrap());

        let worker = fx.worker(nop_fetcher());
        worker.start();
        let id = fx
            .store
            .add(JobType::Upscale, json!({"image_base64": b64, "repeats": 1}));
        let job = fx.wait_for(&id, JobStatus::Completed);
        worker.stop();

        let out = load_image(&fx.output_dir.join(&job.outputs[0])).unwrap();
        assert_eq!((out.width, out.height), (8, 8));
    }

    #[test]
    fn upscale_with_missing_input_fails() {
        let fx = Fixture::new();
        let worker = fx.worker(nop_fetcher());
        worker.start();
        let id = fx
            .store
            .add(JobType::Upscale, json!({"image_path": "missing.png"}));
        let job = fx.wait_for(&id, JobStatus::Failed);
        worker.stop();
        assert!(job.error_message.unwrap().contains("missing.png"));
    }

    #[test]
    fn progress_and_status_events_flow_in_order() {
        let fx = Fixture::new();
        fx.load_model();
        let mut rx = fx.bus.subscribe();

        let worker = fx.worker(nop_fetcher());
        worker.start();
        let id = fx.store.add(
            JobType::Txt2img,
            json!({"prompt": "events", "width": 8, "height": 8, "steps": 3}),
        );
        fx.wait_for(&id, JobStatus::Completed);
        worker.stop();

        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: Value = serde_json::from_str(&frame).unwrap();
            if v["data"]["job_id"] == id.as_str() {
                kinds.push(v["event"].as_str().unwrap().to_string());
            }
        }
        let first_processing = kinds
            .iter()
            .position(|k| k == "job_status_changed")
            .expect("processing event");
        let last_terminal = kinds
            .iter()
            .rposition(|k| k == "job_status_changed")
            .unwrap();
        if let Some(first_progress) = kinds.iter().position(|k| k == "job_progress") {
            assert!(first_processing < first_progress);
            assert!(last_terminal > first_progress);
        }
        assert_eq!(kinds[0], "job_added");
    }

    #[test]
    fn stop_without_jobs_terminates_the_thread() {
        let fx = Fixture::new();
        let worker = fx.worker(nop_fetcher());
        worker.start();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop();
        assert!(worker.thread.lock().unwrap().is_none());
    }
}
