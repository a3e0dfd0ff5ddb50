//! Model registry, lifecycle and download endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use sdhost_core::lifecycle::LoadParams;
use sdhost_core::registry::{ModelFilter, ModelKind};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/refresh", post(refresh_models))
        .route("/models/load", post(load_model))
        .route("/models/unload", post(unload_model))
        .route("/models/hash/{kind}/{*name}", get(model_hash))
        .route("/models/paths", get(model_paths))
        .route("/models/download", post(download_model))
        .route("/models/civitai/{id}", get(civitai_info))
        .route("/models/huggingface", get(huggingface_info))
        .route("/upscaler/load", post(load_upscaler))
        .route("/upscaler/unload", post(unload_upscaler))
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    extension: Option<String>,
    search: Option<String>,
    /// Alias for `search` kept for older UI builds.
    name: Option<String>,
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Value>, ServerError> {
    let mut filter = ModelFilter {
        extension: query.extension.filter(|e| !e.is_empty()),
        search: query.search.or(query.name).filter(|s| !s.is_empty()),
        ..ModelFilter::default()
    };
    if let Some(kind) = query.kind.filter(|k| !k.is_empty() && k != "all") {
        filter.kind = Some(parse_kind(&kind)?);
    }

    let loaded = state.lifecycle.loaded_model();
    Ok(Json(state.registry.listing(
        &filter,
        loaded.as_ref().map(|(n, k)| (n.as_str(), *k)),
    )))
}

async fn refresh_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.registry.scan();
    Json(json!({ "success": true, "message": "Model registry rescanned" }))
}

async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(params): Json<LoadParams>,
) -> Result<Json<Value>, ServerError> {
    if params.model_name.is_empty() {
        return Err(ServerError::BadRequest("model_name is required".into()));
    }
    let params = params.with_defaults(&state.config.sd_defaults);
    info!(model = %params.model_name, "load model requested");

    // Heavy: blocks until the backend finishes (or fails) loading.
    let lifecycle = Arc::clone(&state.lifecycle);
    tokio::task::spawn_blocking(move || lifecycle.load(params))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    let info = state.lifecycle.loaded_models_info();
    Ok(Json(json!({
        "success": true,
        "message": "Model loaded successfully",
        "model_name": info["model_name"],
        "model_type": info["model_type"],
        "model_architecture": info["model_architecture"],
        "loaded_components": info["loaded_components"],
    })))
}

async fn unload_model(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.lifecycle.unload();
    Json(json!({ "success": true, "message": "Model unloaded" }))
}

async fn model_hash(
    State(state): State<Arc<AppState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Value>, ServerError> {
    let kind = parse_kind(&kind)?;
    let registry = Arc::clone(&state.registry);
    let hash_name = name.clone();
    // Hashing a multi-gigabyte file takes a while; keep it off the runtime.
    let hash = tokio::task::spawn_blocking(move || registry.hash(kind, &hash_name))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;
    Ok(Json(json!({ "name": name, "type": kind.as_ref(), "hash": hash })))
}

async fn model_paths(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.registry.paths_config())
}

/// Enqueue a model download. Responds 202 with both the download job id and
/// the paired hash job id.
async fn download_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let model_type = body["model_type"].as_str().unwrap_or("");
    if model_type.is_empty() {
        return Err(ServerError::BadRequest("model_type is required".into()));
    }
    let kind = parse_kind(model_type)?;
    if state.registry.base_dir(kind).is_none() {
        return Err(ServerError::BadRequest(format!(
            "no directory configured for model type {model_type}"
        )));
    }

    // Source-specific required fields fail fast instead of in the worker.
    match body["source"].as_str().unwrap_or("url") {
        "civitai" => {
            if body["model_id"].as_str().unwrap_or("").is_empty() {
                return Err(ServerError::BadRequest("CivitAI model_id is required".into()));
            }
        }
        "huggingface" | "hf" => {
            if body["repo_id"].as_str().unwrap_or("").is_empty()
                || body["filename"].as_str().unwrap_or("").is_empty()
            {
                return Err(ServerError::BadRequest(
                    "HuggingFace repo_id and filename are required".into(),
                ));
            }
        }
        _ => {
            if body["url"].as_str().unwrap_or("").is_empty() {
                return Err(ServerError::BadRequest("download URL is required".into()));
            }
        }
    }

    let (download_job_id, hash_job_id) = state.store.add_download(body);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "download_job_id": download_job_id,
            "hash_job_id": hash_job_id,
            "status": "pending",
        })),
    ))
}

async fn civitai_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    Ok(Json(state.fetcher.civitai_info(&id).await?))
}

#[derive(Debug, Deserialize)]
struct HuggingfaceQuery {
    repo_id: String,
    filename: String,
    #[serde(default = "default_revision")]
    revision: String,
}

fn default_revision() -> String {
    "main".into()
}

async fn huggingface_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HuggingfaceQuery>,
) -> Result<Json<Value>, ServerError> {
    if query.repo_id.is_empty() || query.filename.is_empty() {
        return Err(ServerError::BadRequest(
            "repo_id and filename are required".into(),
        ));
    }
    Ok(Json(
        state
            .fetcher
            .huggingface_info(&query.repo_id, &query.filename, &query.revision)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct LoadUpscalerBody {
    model_name: String,
    #[serde(default = "default_threads")]
    n_threads: i32,
    #[serde(default = "default_tile_size")]
    tile_size: i32,
}

fn default_threads() -> i32 {
    -1
}

fn default_tile_size() -> i32 {
    128
}

async fn load_upscaler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoadUpscalerBody>,
) -> Result<Json<Value>, ServerError> {
    if body.model_name.is_empty() {
        return Err(ServerError::BadRequest("model_name is required".into()));
    }
    let lifecycle = Arc::clone(&state.lifecycle);
    let name = body.model_name.clone();
    tokio::task::spawn_blocking(move || {
        lifecycle.load_upscaler(&name, body.n_threads, body.tile_size)
    })
    .await
    .map_err(|e| ServerError::Internal(e.to_string()))??;

    Ok(Json(json!({
        "success": true,
        "message": "Upscaler loaded successfully",
        "model_name": body.model_name,
        "upscale_factor": state.lifecycle.upscale_factor(),
    })))
}

async fn unload_upscaler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.lifecycle.unload_upscaler();
    Json(json!({ "success": true, "message": "Upscaler unloaded" }))
}

fn parse_kind(kind: &str) -> Result<ModelKind, ServerError> {
    kind.parse()
        .map_err(|_| ServerError::BadRequest(format!("unknown model type: {kind}")))
}
