//! Queue listing, job inspection, cancellation, the recycle bin, live
//! previews and preview settings.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use sdhost_core::queue::{JobFilter, JobStatus, JobType};
use sdhost_engine::PreviewMode;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/queue", get(get_queue))
        .route("/queue/jobs", delete(bulk_delete))
        .route("/queue/clear-completed", post(clear_completed))
        .route("/queue/recycle-bin", get(recycle_bin).delete(clear_recycle_bin))
        .route("/queue/{id}", get(get_job).delete(cancel_or_delete))
        .route("/queue/{id}/restore", post(restore_job))
        .route("/queue/{id}/purge", delete(purge_job))
        .route("/jobs/{id}/preview", get(job_preview))
        .route("/preview/settings", get(preview_settings).put(update_preview_settings))
}

#[derive(Debug, Default, Deserialize)]
struct QueueQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    job_type: Option<String>,
    search: Option<String>,
    architecture: Option<String>,
    model: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    page: Option<usize>,
    before: Option<i64>,
    after: Option<i64>,
    group_by: Option<String>,
}

fn build_filter(query: &QueueQuery) -> Result<(JobFilter, Value), ServerError> {
    let mut filter = JobFilter {
        search: query.search.clone().filter(|s| !s.is_empty()),
        architecture: query.architecture.clone().filter(|s| !s.is_empty()),
        model: query.model.clone().filter(|s| !s.is_empty()),
        before_timestamp: query.before,
        after_timestamp: query.after,
        limit: query.limit.unwrap_or(20),
        offset: query.offset.unwrap_or(0),
        ..JobFilter::default()
    };
    if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty() && *s != "all") {
        filter.status = Some(
            status
                .parse::<JobStatus>()
                .map_err(|_| ServerError::BadRequest(format!("unknown status: {status}")))?,
        );
    }
    if let Some(job_type) = query
        .job_type
        .as_deref()
        .filter(|t| !t.is_empty() && *t != "all")
    {
        filter.job_type = Some(
            job_type
                .parse::<JobType>()
                .map_err(|_| ServerError::BadRequest(format!("unknown job type: {job_type}")))?,
        );
    }

    let mut applied = serde_json::Map::new();
    if let Some(status) = filter.status {
        applied.insert("status".into(), json!(status.as_ref()));
    }
    if let Some(job_type) = filter.job_type {
        applied.insert("type".into(), json!(job_type.as_ref()));
    }
    if let Some(search) = &filter.search {
        applied.insert("search".into(), json!(search));
    }
    if let Some(architecture) = &filter.architecture {
        applied.insert("architecture".into(), json!(architecture));
    }
    if let Some(model) = &filter.model {
        applied.insert("model".into(), json!(model));
    }
    Ok((filter, Value::Object(applied)))
}

/// Filtered, paginated queue listing. `group_by=date` switches to the
/// date-grouped envelope. Both carry the queue status summary.
async fn get_queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Value>, ServerError> {
    let (filter, applied_filters) = build_filter(&query)?;
    let mut response = state.store.stats();

    if query.group_by.as_deref() == Some("date") {
        let grouped = state.store.grouped_by_date(
            &filter,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(20),
        );
        response["groups"] = json!(
            grouped
                .groups
                .iter()
                .map(|g| json!({
                    "date": g.date,
                    "label": g.label,
                    "timestamp": g.timestamp,
                    "count": g.count,
                    "items": g.items.iter().map(|j| j.to_json()).collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>()
        );
        response["total_count"] = json!(grouped.total_count);
        response["page"] = json!(grouped.page);
        response["total_pages"] = json!(grouped.total_pages);
        response["limit"] = json!(grouped.limit);
        response["has_more"] = json!(grouped.has_more);
        response["has_prev"] = json!(grouped.has_prev);
        response["group_by"] = json!("date");
    } else {
        let page = state.store.page(&filter);
        response["items"] = json!(page.items.iter().map(|j| j.to_json()).collect::<Vec<_>>());
        response["total_count"] = json!(page.total_count);
        response["filtered_count"] = json!(page.filtered_count);
        response["offset"] = json!(page.offset);
        response["limit"] = json!(page.limit);
        response["has_more"] = json!(page.has_more);

        let total_pages = page.total_count.div_ceil(page.limit).max(1);
        let current_page = page.offset / page.limit + 1;
        response["page"] = json!(current_page);
        response["total_pages"] = json!(total_pages);
        response["has_prev"] = json!(current_page > 1);
        if let Some(ts) = page.newest_timestamp {
            response["newest_timestamp"] = json!(ts);
        }
        if let Some(ts) = page.oldest_timestamp {
            response["oldest_timestamp"] = json!(ts);
        }
    }

    if applied_filters.as_object().is_some_and(|m| !m.is_empty()) {
        response["applied_filters"] = applied_filters;
    }
    Ok(Json(response))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let job = state
        .store
        .get(&id)
        .ok_or_else(|| ServerError::NotFound(format!("job not found: {id}")))?;
    Ok(Json(job.to_json()))
}

/// DELETE on a job cancels it while pending and soft-deletes it once
/// terminal. Processing jobs cannot be interrupted.
async fn cancel_or_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let job = state
        .store
        .get(&id)
        .ok_or_else(|| ServerError::NotFound(format!("job not found: {id}")))?;

    if job.status == JobStatus::Pending {
        state.store.cancel(&id)?;
        return Ok(Json(json!({ "success": true, "message": "Job cancelled" })));
    }
    state.store.delete(&id)?;
    Ok(Json(json!({ "success": true, "message": "Job deleted" })))
}

#[derive(Debug, Deserialize)]
struct BulkDeleteBody {
    job_ids: Vec<String>,
}

async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkDeleteBody>,
) -> Result<Json<Value>, ServerError> {
    if body.job_ids.is_empty() {
        return Err(ServerError::BadRequest("job_ids must not be empty".into()));
    }
    let mut deleted = 0usize;
    let mut errors = Vec::new();
    for id in &body.job_ids {
        let result = match state.store.get(id).map(|j| j.status) {
            Some(JobStatus::Pending) => state.store.cancel(id),
            Some(_) => state.store.delete(id),
            None => Err(sdhost_core::queue::StoreError::NotFound(id.clone())),
        };
        match result {
            Ok(()) => deleted += 1,
            Err(e) => errors.push(json!({ "job_id": id, "error": e.to_string() })),
        }
    }
    Ok(Json(json!({
        "success": errors.is_empty(),
        "deleted_count": deleted,
        "errors": errors,
    })))
}

async fn clear_completed(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = state.store.clear_completed();
    Json(json!({ "success": true, "cleared_count": cleared }))
}

async fn recycle_bin(State(state): State<Arc<AppState>>) -> Json<Value> {
    let items: Vec<Value> = state.store.deleted_jobs().iter().map(|j| j.to_json()).collect();
    Json(json!({ "items": items, "count": items.len() }))
}

async fn clear_recycle_bin(State(state): State<Arc<AppState>>) -> Json<Value> {
    let purged = state.store.clear_recycle_bin();
    Json(json!({ "success": true, "purged_count": purged }))
}

async fn restore_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let status = state.store.restore(&id)?;
    Ok(Json(json!({ "success": true, "status": status.as_ref() })))
}

async fn purge_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    state.store.purge(&id)?;
    Ok(Json(json!({ "success": true, "message": "Job purged" })))
}

/// Latest in-memory preview JPEG for a processing job. Reads the buffer
/// directly; never touches the worker.
async fn job_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(HeaderMap, Vec<u8>), ServerError> {
    let frame = state
        .previews
        .get(&id)
        .ok_or_else(|| ServerError::NotFound("No preview available".into()))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert("X-Preview-Width", HeaderValue::from(frame.width));
    headers.insert("X-Preview-Height", HeaderValue::from(frame.height));
    headers.insert("X-Preview-Step", HeaderValue::from(frame.step));
    Ok((headers, frame.jpeg))
}

async fn preview_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.worker.preview_settings();
    Json(json!({
        "enabled": settings.mode != PreviewMode::None,
        "mode": settings.mode,
        "interval": settings.interval,
        "max_size": settings.max_size,
        "quality": settings.quality,
    }))
}

async fn update_preview_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let mut settings = state.worker.preview_settings();
    if let Some(mode) = body["mode"].as_str() {
        settings.mode = mode
            .parse::<PreviewMode>()
            .map_err(|_| ServerError::BadRequest(format!("unknown preview mode: {mode}")))?;
    }
    if let Some(enabled) = body["enabled"].as_bool() {
        if !enabled {
            settings.mode = PreviewMode::None;
        } else if settings.mode == PreviewMode::None {
            settings.mode = PreviewMode::Tae;
        }
    }
    if let Some(interval) = body["interval"].as_i64() {
        settings.interval = (interval.max(1)) as i32;
    }
    if let Some(max_size) = body["max_size"].as_u64() {
        settings.max_size = max_size.clamp(16, 2048) as u32;
    }
    if let Some(quality) = body["quality"].as_u64() {
        settings.quality = quality.clamp(1, 100) as u8;
    }
    state.worker.set_preview_settings(settings);

    Ok(Json(json!({
        "success": true,
        "enabled": settings.mode != PreviewMode::None,
        "mode": settings.mode,
        "interval": settings.interval,
        "max_size": settings.max_size,
        "quality": settings.quality,
    })))
}
