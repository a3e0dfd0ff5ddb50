//! Axum router construction.
//!
//! One module per surface, merged here; CORS is wide open (the UI is a
//! local SPA) and every request is traced.

mod architectures;
mod assistant;
mod files;
mod generate;
mod health;
mod models;
mod queue;
mod settings;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .merge(health::router())
        .merge(models::router())
        .merge(generate::router())
        .merge(queue::router())
        .merge(settings::router())
        .merge(assistant::router())
        .merge(architectures::router())
        .merge(files::router(&state))
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn fallback_404() -> ServerError {
    ServerError::NotFound("Endpoint not found".into())
}
