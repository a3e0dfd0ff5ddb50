//! User settings endpoints: generation preferences per mode and UI
//! preferences. Preferences overlay architecture defaults; reset wipes the
//! overlay.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use sdhost_core::settings::UiPreferences;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/settings/generation", get(get_generation).put(update_generation))
        .route(
            "/settings/generation/{mode}",
            get(get_generation_mode).put(update_generation_mode),
        )
        .route("/settings/preferences", get(get_preferences).put(update_preferences))
        .route("/settings/reset", post(reset))
}

async fn get_generation(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "generation": state.settings.all_generation_preferences() }))
}

async fn update_generation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    for mode in ["txt2img", "img2img", "txt2vid"] {
        if let Some(preferences) = body.get(mode) {
            state.settings.set_generation_preferences(mode, preferences.clone());
        }
    }
    Ok(Json(json!({ "success": true })))
}

/// Per-mode view: the architecture defaults of the loaded model, the user
/// overrides, and the effective merge (user wins).
async fn get_generation_mode(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let user_preferences = state
        .settings
        .generation_preferences(&mode)
        .ok_or_else(|| ServerError::BadRequest(format!("unknown generation mode: {mode}")))?;

    let architecture_defaults = state
        .lifecycle
        .architecture()
        .and_then(|arch| state.catalog.get(&arch))
        .map(|preset| preset.generation_defaults)
        .unwrap_or_else(|| json!({}));

    let mut effective = architecture_defaults.clone();
    if let (Some(target), Some(overrides)) =
        (effective.as_object_mut(), user_preferences.as_object())
    {
        for (key, value) in overrides {
            target.insert(key.clone(), value.clone());
        }
    }

    Ok(Json(json!({
        "mode": mode,
        "architecture_defaults": architecture_defaults,
        "user_preferences": user_preferences,
        "effective": effective,
    })))
}

async fn update_generation_mode(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    if !state.settings.set_generation_preferences(&mode, body) {
        return Err(ServerError::BadRequest(format!(
            "unknown generation mode: {mode}"
        )));
    }
    Ok(Json(json!({ "success": true, "mode": mode })))
}

async fn get_preferences(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "ui": state.settings.ui_preferences() }))
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Json(preferences): Json<UiPreferences>,
) -> Json<Value> {
    state.settings.set_ui_preferences(preferences);
    Json(json!({ "success": true }))
}

async fn reset(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.settings.reset();
    Json(json!({ "success": true, "message": "Settings reset to defaults" }))
}
