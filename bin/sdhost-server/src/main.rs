//! sdhost-server – entry point.
//!
//! Startup order:
//! 1. Parse command-line arguments (`--config <path>`).
//! 2. Initialise structured tracing.
//! 3. Load and validate the configuration file.
//! 4. Scan model directories and construct the core components.
//! 5. Wire the native log hook into the error-capture ring.
//! 6. Start the WebSocket event bus and the queue worker.
//! 7. Serve HTTP with two-phase graceful shutdown: the first signal stops
//!    accepting work and flags the bus, the second force-exits.

mod error;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use sdhost_core::assistant::{AssistantClient, ToolExecutor};
use sdhost_core::{
    ArchitectureCatalog, Config, ErrorCapture, EventBus, JobStore, ModelLifecycle, ModelRegistry,
    PreviewBuffer, SettingsStore, Worker,
};
use sdhost_engine::hooks::{self, LogLevel, PreviewSettings};
use sdhost_engine::software::SoftwareEngine;
use sdhost_engine::{DiffusionEngine, PreviewMode};
use sdhost_fetch::HttpFetcher;

use crate::state::AppState;

/// REST + WebSocket orchestration server for native diffusion inference.
#[derive(Debug, Parser)]
#[command(name = "sdhost-server", version, about)]
struct Args {
    /// Path to the configuration JSON file.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // ── Tracing ──────────────────────────────────────────────────────────
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "sdhost-server starting");

    // ── Configuration ────────────────────────────────────────────────────
    let config_path = std::fs::canonicalize(&args.config)?;
    let config = Config::load(&config_path)?;
    config.validate()?;

    // The configured thread count sizes the HTTP runtime; the inference
    // work itself lives on the dedicated worker thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(config_path, config))
}

async fn run(config_path: PathBuf, config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let output_dir = config.output_dir();

    // ── Core components ──────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(256));
    let capture = Arc::new(ErrorCapture::new());

    // The native backend reports log lines through a process-wide hook;
    // error-level lines additionally land in the capture ring for job
    // failure reporting.
    {
        let capture = Arc::clone(&capture);
        hooks::set_log_hook(Box::new(move |level, message| {
            match level {
                LogLevel::Error => {
                    capture.capture(message);
                    tracing::error!(target: "sdhost::native", "{message}");
                }
                LogLevel::Warn => tracing::warn!(target: "sdhost::native", "{message}"),
                LogLevel::Info => tracing::info!(target: "sdhost::native", "{message}"),
                LogLevel::Debug => tracing::debug!(target: "sdhost::native", "{message}"),
            };
        }));
    }

    let engine: Arc<dyn DiffusionEngine> = Arc::new(SoftwareEngine::new());
    info!(backend = engine.name(), "inference backend initialised");

    let registry = Arc::new(ModelRegistry::new(config.paths.clone()));
    registry.scan();
    for kind in [
        sdhost_core::ModelKind::Checkpoint,
        sdhost_core::ModelKind::Diffusion,
        sdhost_core::ModelKind::Vae,
        sdhost_core::ModelKind::Lora,
        sdhost_core::ModelKind::Clip,
        sdhost_core::ModelKind::T5,
        sdhost_core::ModelKind::Controlnet,
        sdhost_core::ModelKind::Llm,
        sdhost_core::ModelKind::Esrgan,
        sdhost_core::ModelKind::Taesd,
    ] {
        let count = registry.count(kind);
        if count > 0 {
            info!(kind = kind.as_ref(), count, "models discovered");
        }
    }

    let lifecycle = Arc::new(ModelLifecycle::new(
        Arc::clone(&registry),
        Arc::clone(&engine),
        Arc::clone(&bus),
    ));

    let store = Arc::new(JobStore::new(
        Arc::clone(&lifecycle),
        Arc::clone(&bus),
        output_dir.join("queue_state.json"),
        config.recycle_bin.clone(),
    ));

    let previews = Arc::new(PreviewBuffer::new());
    let settings = Arc::new(SettingsStore::new(&output_dir));
    // Architecture presets live beside the config file and hot-reload on
    // edit.
    let data_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let catalog = Arc::new(ArchitectureCatalog::new(&data_dir));
    catalog.start_watcher();
    lifecycle.set_catalog(Arc::clone(&catalog));

    let fetcher = Arc::new(HttpFetcher::new());
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::clone(&lifecycle),
        Arc::clone(&registry),
        Arc::clone(&previews),
        Arc::clone(&bus),
        Arc::clone(&capture),
        Arc::clone(&engine),
        fetcher.clone(),
        output_dir.clone(),
        tokio::runtime::Handle::current(),
    );

    // Preview settings seed from the config file; they stay adjustable at
    // runtime via /preview/settings.
    if config.preview.enabled {
        let mode = config
            .preview
            .mode
            .parse::<PreviewMode>()
            .unwrap_or(PreviewMode::Tae);
        worker.set_preview_settings(PreviewSettings {
            mode,
            interval: config.preview.interval.max(1),
            max_size: config.preview.max_size,
            quality: config.preview.quality.clamp(1, 100),
        });
        info!(mode = %config.preview.mode, "live previews enabled");
    } else {
        worker.set_preview_settings(PreviewSettings {
            mode: PreviewMode::None,
            ..PreviewSettings::default()
        });
        info!("live previews disabled");
    }

    let tools = Arc::new(ToolExecutor::new(
        Arc::clone(&lifecycle),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&catalog),
    ));
    let assistant = Arc::new(AssistantClient::new(
        config.assistant.clone(),
        &output_dir,
        Some(config_path.clone()),
        Arc::clone(&tools),
    ));
    if assistant.is_enabled() {
        info!(endpoint = %config.assistant.endpoint, model = %config.assistant.model, "assistant enabled");
    }

    let webui_dir = if config.paths.webui.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.paths.webui))
    };

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        engine,
        bus: Arc::clone(&bus),
        registry,
        lifecycle: Arc::clone(&lifecycle),
        store,
        worker: Arc::clone(&worker),
        previews,
        settings,
        catalog,
        capture,
        tools,
        assistant,
        fetcher,
        output_dir,
        webui_dir,
    });

    // New WebSocket clients get this snapshot on connect.
    {
        let lifecycle = Arc::clone(&state.lifecycle);
        let store = Arc::clone(&state.store);
        bus.set_status_provider(Arc::new(move || {
            let mut status = lifecycle.loaded_models_info();
            status["queue_stats"] = store.stats();
            status
        }));
    }

    // ── WebSocket event stream ───────────────────────────────────────────
    let mut ws_task = None;
    if config.server.ws_port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.ws_port).parse()?;
        let ws_state = Arc::clone(&state);
        ws_task = Some(tokio::spawn(async move {
            if let Err(e) = ws::serve(ws_state, addr).await {
                warn!(error = %e, "WebSocket server exited");
            }
        }));
    }

    // ── Queue worker ─────────────────────────────────────────────────────
    worker.start();

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    if config.server.ws_port > 0 {
        info!(port = config.server.ws_port, "WebSocket events available");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&bus)))
        .await?;

    // ── Shutdown: bus first (no new broadcasts reach clients), then the
    //    worker, then the resident models. ───────────────────────────────
    info!("stopping WebSocket server");
    bus.request_stop();
    if let Some(task) = ws_task {
        if tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .is_err()
        {
            warn!("WebSocket server did not stop in time; detaching");
        }
    }

    info!("stopping queue worker");
    worker.stop();

    info!("unloading models");
    lifecycle.unload();
    lifecycle.unload_upscaler();

    info!("sdhost-server stopped");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM. The first signal begins graceful shutdown
/// (this future resolves, the listener closes, the bus is flagged); a
/// second signal force-exits the process immediately.
async fn shutdown_signal(bus: Arc<EventBus>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; press Ctrl+C again to force quit");
    bus.request_stop();

    // Second signal: force-exit without waiting for in-flight jobs.
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("force quit");
        std::process::exit(130);
    });
}
