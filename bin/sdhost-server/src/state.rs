//! Shared application state injected into every Axum handler.

use std::path::PathBuf;
use std::sync::Arc;

use sdhost_core::assistant::{AssistantClient, ToolExecutor};
use sdhost_engine::DiffusionEngine;
use sdhost_core::{
    ArchitectureCatalog, Config, ErrorCapture, EventBus, JobStore, ModelLifecycle, ModelRegistry,
    PreviewBuffer, SettingsStore, Worker,
};
use sdhost_fetch::HttpFetcher;

/// State shared across all HTTP handlers and the WebSocket listener.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<dyn DiffusionEngine>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ModelRegistry>,
    pub lifecycle: Arc<ModelLifecycle>,
    pub store: Arc<JobStore>,
    pub worker: Arc<Worker>,
    pub previews: Arc<PreviewBuffer>,
    pub settings: Arc<SettingsStore>,
    pub catalog: Arc<ArchitectureCatalog>,
    pub capture: Arc<ErrorCapture>,
    pub tools: Arc<ToolExecutor>,
    pub assistant: Arc<AssistantClient>,
    pub fetcher: Arc<HttpFetcher>,
    pub output_dir: PathBuf,
    pub webui_dir: Option<PathBuf>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("output_dir", &self.output_dir)
            .finish()
    }
}
