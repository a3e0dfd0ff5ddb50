//! Assistant endpoints: chat (plain and SSE streaming), history, status,
//! settings and model capability probes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/assistant/chat", post(chat))
        .route("/assistant/chat/stream", post(chat_stream))
        .route("/assistant/history", get(history).delete(clear_history))
        .route("/assistant/status", get(status))
        .route("/assistant/settings", get(get_settings).put(update_settings))
        .route("/assistant/model-info", get(model_info))
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    context: Value,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Value>, ServerError> {
    if body.message.trim().is_empty() {
        return Err(ServerError::BadRequest("message is required".into()));
    }
    let response = state.assistant.chat(&body.message, &body.context).await;
    Ok(Json(response.to_json()))
}

/// Streaming variant: Server-Sent Events of kinds `content`, `thinking`,
/// `tool_call`, `done`, `error`.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    if body.message.trim().is_empty() {
        return Err(ServerError::BadRequest("message is required".into()));
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<(String, Value)>(64);
    let assistant = Arc::clone(&state.assistant);
    tokio::spawn(async move {
        assistant.chat_stream(&body.message, &body.context, tx).await;
    });

    let stream = futures::StreamExt::map(ReceiverStream::new(rx), |(event, data)| {
        Ok(Event::default().event(event).data(data.to_string()))
    });
    Ok(Sse::new(stream))
}

async fn history(State(state): State<Arc<AppState>>) -> Json<Value> {
    let items = state.assistant.history();
    Json(json!({
        "items": items,
        "count": items.len(),
        "version": 1,
    }))
}

async fn clear_history(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.assistant.clear_history();
    Json(json!({ "success": true, "message": "History cleared" }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut status = state.assistant.status();
    status["connected"] = json!(state.assistant.is_enabled() && state.assistant.test_connection().await);
    Json(status)
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.assistant.settings())
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    if !state.assistant.update_settings(&body) {
        return Err(ServerError::Internal(
            "failed to persist assistant settings".into(),
        ));
    }
    Ok(Json(json!({ "success": true, "settings": state.assistant.settings() })))
}

#[derive(Debug, Deserialize)]
struct ModelInfoQuery {
    model: Option<String>,
}

async fn model_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModelInfoQuery>,
) -> Json<Value> {
    Json(state.assistant.model_info(query.model.as_deref()).await)
}
