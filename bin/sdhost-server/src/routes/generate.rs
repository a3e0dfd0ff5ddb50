//! Generation endpoints: everything here just validates and enqueues; the
//! worker does the real work.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use sdhost_core::queue::JobType;
use sdhost_core::registry::ModelKind;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/txt2img", post(txt2img))
        .route("/img2img", post(img2img))
        .route("/txt2vid", post(txt2vid))
        .route("/upscale", post(upscale))
        .route("/convert", post(convert))
}

/// 202 envelope: `{job_id, status: "pending", position}`.
fn accepted(state: &AppState, job_id: String) -> (StatusCode, Json<Value>) {
    let position = state.store.stats()["pending_count"].clone();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": "pending", "position": position })),
    )
}

fn require_model(state: &AppState) -> Result<(), ServerError> {
    if !state.lifecycle.is_loaded() {
        return Err(ServerError::BadRequest("No model loaded".into()));
    }
    Ok(())
}

async fn txt2img(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    require_model(&state)?;
    Ok(accepted(&state, state.store.add(JobType::Txt2img, body)))
}

async fn img2img(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    require_model(&state)?;
    if body["init_image_base64"].as_str().unwrap_or("").is_empty() {
        return Err(ServerError::BadRequest("init_image_base64 is required".into()));
    }
    Ok(accepted(&state, state.store.add(JobType::Img2img, body)))
}

async fn txt2vid(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    require_model(&state)?;
    Ok(accepted(&state, state.store.add(JobType::Txt2vid, body)))
}

async fn upscale(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    if !state.lifecycle.is_upscaler_loaded() {
        return Err(ServerError::BadRequest(
            "No upscaler loaded. Load an ESRGAN model first using /upscaler/load".into(),
        ));
    }
    let has_image = !body["image_base64"].as_str().unwrap_or("").is_empty()
        || !body["image_path"].as_str().unwrap_or("").is_empty();
    if !has_image {
        return Err(ServerError::BadRequest(
            "either image_base64 or image_path is required".into(),
        ));
    }
    Ok(accepted(&state, state.store.add(JobType::Upscale, body)))
}

/// Validate a conversion request and enqueue it. `input_path` may be given
/// directly or resolved from a registry `model_name`; `output_path`
/// defaults to the input with the quantization type as its suffix.
async fn convert(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let output_type = body["output_type"].as_str().unwrap_or("").to_string();
    if output_type.is_empty() {
        return Err(ServerError::BadRequest(
            "output_type (quantization type) is required".into(),
        ));
    }
    if !state.engine.quantization_types().contains(&output_type.as_str()) {
        return Err(ServerError::BadRequest(format!(
            "unsupported quantization type: {output_type}"
        )));
    }

    // Resolve the input file.
    let input_path = match body["input_path"].as_str().filter(|s| !s.is_empty()) {
        Some(path) => path.to_string(),
        None => {
            let model_name = body["model_name"].as_str().unwrap_or("");
            if model_name.is_empty() {
                return Err(ServerError::BadRequest(
                    "either input_path or model_name is required".into(),
                ));
            }
            let kind: ModelKind = body["model_type"]
                .as_str()
                .unwrap_or("checkpoint")
                .parse()
                .map_err(|_| {
                    ServerError::BadRequest(format!(
                        "unknown model type: {}",
                        body["model_type"]
                    ))
                })?;
            let entry = state.registry.get(kind, model_name).ok_or_else(|| {
                ServerError::NotFound(format!("model not found: '{model_name}'"))
            })?;
            entry.full_path.to_string_lossy().into_owned()
        }
    };
    if !FsPath::new(&input_path).is_file() {
        return Err(ServerError::BadRequest(format!(
            "input file does not exist: {input_path}"
        )));
    }
    body["input_path"] = json!(input_path);

    if body["output_path"].as_str().unwrap_or("").is_empty() {
        body["output_path"] = json!(default_output_path(&input_path, &output_type));
    }

    Ok(accepted(&state, state.store.add(JobType::Convert, body)))
}

/// `dir/model.safetensors` + `q8_0` -> `dir/model.q8_0.gguf`; an existing
/// quantization suffix in the stem is replaced.
fn default_output_path(input_path: &str, output_type: &str) -> String {
    let path = FsPath::new(input_path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".into());
    let stem = match stem.rsplit_once('.') {
        Some((base, suffix))
            if sdhost_engine::QUANTIZATION_TYPES.contains(&suffix.to_ascii_lowercase().as_str()) =>
        {
            base.to_string()
        }
        _ => stem,
    };
    path.with_file_name(format!("{stem}.{output_type}.gguf"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_path_gains_quant_suffix() {
        assert_eq!(
            default_output_path("/m/sd15.safetensors", "q8_0"),
            "/m/sd15.q8_0.gguf"
        );
    }

    #[test]
    fn existing_quant_suffix_is_replaced() {
        assert_eq!(
            default_output_path("/m/sd15.q4_0.gguf", "q8_0"),
            "/m/sd15.q8_0.gguf"
        );
    }
}
