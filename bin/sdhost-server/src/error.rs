//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to the uniform `{"error": "<message>"}` JSON body with the right status
//! code. Success bodies never contain an `error` key.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use sdhost_core::lifecycle::LifecycleError;
use sdhost_core::queue::StoreError;
use sdhost_core::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller sent an invalid or malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// The caller referenced a resource that does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request is valid but conflicts with current state (cancel on a
    /// non-pending job, delete on a processing job, ...).
    #[error("{0}")]
    Conflict(String),

    /// A remote collaborator (model repository, LLM endpoint) failed.
    #[error("{0}")]
    Upstream(String),

    /// An unclassified internal server error.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::Conflict(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Upstream(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            ServerError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ServerError::NotFound(e.to_string()),
            _ => ServerError::Conflict(e.to_string()),
        }
    }
}

impl From<LifecycleError> for ServerError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Validation(_) | LifecycleError::NoModelLoaded
            | LifecycleError::NoUpscalerLoaded => ServerError::BadRequest(e.to_string()),
            LifecycleError::Engine(_) => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { .. } => ServerError::NotFound(e.to_string()),
            RegistryError::Io { .. } => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<sdhost_fetch::FetchError> for ServerError {
    fn from(e: sdhost_fetch::FetchError) -> Self {
        match e {
            sdhost_fetch::FetchError::InvalidRequest(m) => ServerError::BadRequest(m),
            sdhost_fetch::FetchError::Upstream(m) => ServerError::Upstream(m),
            sdhost_fetch::FetchError::Io(e) => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(format!("{e:#}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_errors_map_to_conflict_or_not_found() {
        let not_found: ServerError = StoreError::NotFound("x".into()).into();
        assert!(matches!(not_found, ServerError::NotFound(_)));

        let conflict: ServerError = StoreError::Processing { id: "x".into() }.into();
        assert!(matches!(conflict, ServerError::Conflict(_)));
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err: ServerError = LifecycleError::Validation("missing".into()).into();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }
}
