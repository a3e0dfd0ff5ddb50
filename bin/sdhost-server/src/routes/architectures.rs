//! Architecture preset listing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/architectures", get(get_architectures))
}

/// All presets plus the architecture of the currently loaded model.
async fn get_architectures(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "architectures": state.catalog.to_json(),
        "current": state.lifecycle.architecture(),
    }))
}
