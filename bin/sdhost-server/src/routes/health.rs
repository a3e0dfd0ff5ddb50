//! Health snapshot and the closed option lists.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/options", get(get_options))
}

/// Status snapshot: loaded/loading flags with progress, resident model
/// names and architecture, upscaler info and the WebSocket port. Never
/// blocks on an in-flight load or generation.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let info = state.lifecycle.loaded_models_info();
    let ws_port = state.config.server.ws_port;
    Json(json!({
        "status": "ok",
        "model_loaded": info["model_loaded"],
        "model_loading": info["model_loading"],
        "loading_model_name": info["loading_model_name"],
        "loading_step": info["loading_step"],
        "loading_total_steps": info["loading_total_steps"],
        "last_error": info["last_error"],
        "model_name": info["model_name"],
        "model_type": info["model_type"],
        "model_architecture": info["model_architecture"],
        "loaded_components": info["loaded_components"],
        "upscaler_loaded": info["upscaler_loaded"],
        "upscaler_name": info["upscaler_name"],
        "ws_port": if ws_port > 0 { json!(ws_port) } else { Value::Null },
    }))
}

/// Samplers, schedulers and quantization types of the linked backend; the
/// engine enumerates what it actually supports, nothing is hard-coded
/// here.
async fn get_options(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "samplers": state.engine.samplers(),
        "schedulers": state.engine.schedulers(),
        "quantization_types": state.engine.quantization_types(),
        "preview_modes": ["none", "proj", "tae", "vae"],
        "rng_types": ["std_default", "cuda", "cpu"],
    }))
}
