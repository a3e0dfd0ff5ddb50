//! The job store: a persistent map of jobs plus the pending FIFO and the
//! recycle bin.
//!
//! Invariants:
//! - every id in the pending queue refers to a job whose status is Pending
//!   (a cancelled-while-queued job is skipped at dequeue time);
//! - a `model_download` job has a uniquely paired `model_hash` job that is
//!   kept out of the FIFO until the download completes;
//! - tombstones (`Deleted`) keep their previous status for restore and are
//!   purged after the configured retention.
//!
//! Locking: the job map and FIFO share one mutex; the worker's live
//! progress lives under a separate mutex so polling readers never contend
//! with dequeue. Neither lock is held while another component is called;
//! the event bus is handed frames, not control.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use super::filter::{
    DateGroup, GroupedJobs, JobFilter, JobPage, format_date, format_date_label, start_of_local_day,
};
use super::job::{Job, JobStatus, JobType, Progress};
use crate::config::RecycleBinConfig;
use crate::events::{EventBus, EventKind};
use crate::lifecycle::ModelLifecycle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is {status} (only pending jobs can be cancelled)")]
    NotCancellable { id: String, status: JobStatus },

    #[error("job {id} is currently processing")]
    Processing { id: String },

    #[error("job {id} is already in recycle bin")]
    AlreadyDeleted { id: String },

    #[error("job {id} is not in recycle bin (status: {status})")]
    NotDeleted { id: String, status: JobStatus },
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    pending: VecDeque<String>,
}

#[derive(Debug, Default)]
struct Current {
    job_id: Option<String>,
    progress: Progress,
}

/// The data the worker copies out of a job before releasing the store lock.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub id: String,
    pub job_type: JobType,
    pub params: Value,
}

pub struct JobStore {
    inner: Mutex<Inner>,
    cv: Condvar,
    current: Mutex<Current>,
    lifecycle: Arc<ModelLifecycle>,
    bus: Arc<EventBus>,
    state_file: PathBuf,
    recycle: RecycleBinConfig,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("JobStore")
            .field("jobs", &inner.jobs.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl JobStore {
    /// Load persisted state, requeue pending jobs in their original order,
    /// reset crashed Processing jobs to Pending and purge expired
    /// tombstones.
    pub fn new(
        lifecycle: Arc<ModelLifecycle>,
        bus: Arc<EventBus>,
        state_file: PathBuf,
        recycle: RecycleBinConfig,
    ) -> Self {
        let store = Self {
            inner: Mutex::new(Inner::default()),
            cv: Condvar::new(),
            current: Mutex::new(Current::default()),
            lifecycle,
            bus,
            state_file,
            recycle,
        };
        store.load_state();
        if store.bin_enabled() {
            let purged = store.purge_expired();
            if purged > 0 {
                info!(purged, "purged expired recycle-bin entries on startup");
            }
        }
        store
    }

    fn bin_enabled(&self) -> bool {
        // Retention 0 behaves exactly like a disabled bin.
        self.recycle.enabled && self.recycle.retention_minutes > 0
    }

    // ── Enqueue ──────────────────────────────────────────────────────────

    /// Add a job and wake the worker. The current loaded-model snapshot is
    /// copied into the job at this moment.
    pub fn add(&self, job_type: JobType, params: Value) -> String {
        let model_settings = self.lifecycle.loaded_models_info();
        let job = Job::new(job_type, params, model_settings);
        let id = job.job_id.clone();

        let position = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.insert(id.clone(), job);
            inner.pending.push_back(id.clone());
            inner.pending.len()
        };
        self.save();
        self.cv.notify_one();

        self.bus.broadcast(
            EventKind::JobAdded,
            json!({ "job_id": id, "type": job_type.as_ref(), "queue_position": position }),
        );
        info!(job_id = %id, r#type = job_type.as_ref(), queue_position = position, "job added");
        id
    }

    /// Add a download job plus its companion hash job. The hash job is
    /// linked but *not* queued; the worker enqueues it once the download
    /// finishes, or fails it if the download fails.
    pub fn add_download(&self, params: Value) -> (String, String) {
        let download_id = self.add(JobType::ModelDownload, params.clone());

        let hash_params = json!({
            "file_path": "",
            "model_type": params.get("model_type").cloned().unwrap_or(Value::Null),
            "download_job_id": download_id,
        });
        let mut hash_job = Job::new(
            JobType::ModelHash,
            hash_params,
            self.lifecycle.loaded_models_info(),
        );
        hash_job.linked_job_id = Some(download_id.clone());
        let hash_id = hash_job.job_id.clone();

        let position = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.insert(hash_id.clone(), hash_job);
            if let Some(download) = inner.jobs.get_mut(&download_id) {
                download.linked_job_id = Some(hash_id.clone());
            }
            inner.pending.len() + 1
        };
        self.save();

        self.bus.broadcast(
            EventKind::JobAdded,
            json!({ "job_id": hash_id, "type": JobType::ModelHash.as_ref(), "queue_position": position }),
        );
        (download_id, hash_id)
    }

    /// Fail a still-pending linked job (hash job whose download failed).
    pub fn fail_linked(&self, job_id: &str, error_message: &str) {
        let failed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.jobs.get_mut(job_id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(error_message.to_string());
                    job.completed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if failed {
            self.bus.broadcast(
                EventKind::JobStatusChanged,
                json!({ "job_id": job_id, "status": "failed", "error_message": error_message }),
            );
        }
    }

    // ── Dequeue (worker side) ────────────────────────────────────────────

    /// Block until a pending job is available or `running` turns false.
    /// Skips ids whose job is no longer Pending; that is how cancellation
    /// of a queued job takes effect.
    pub(crate) fn next_job(&self, running: &AtomicBool) -> Option<Dispatched> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            while let Some(id) = inner.pending.pop_front() {
                let Some(job) = inner.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    continue;
                }
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
                let dispatched = Dispatched {
                    id: id.clone(),
                    job_type: job.job_type,
                    params: job.params.clone(),
                };
                let remaining = inner.pending.len();

                self.bus.broadcast(
                    EventKind::JobStatusChanged,
                    json!({ "job_id": id, "status": "processing", "previous_status": "pending" }),
                );
                info!(
                    job_id = %id,
                    r#type = dispatched.job_type.as_ref(),
                    remaining_in_queue = remaining,
                    "job status: pending -> processing"
                );
                return Some(dispatched);
            }
            inner = self
                .cv
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wake the worker (used by stop and by late enqueues).
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    // ── Live progress (worker side) ──────────────────────────────────────

    pub(crate) fn begin_current(&self, job_id: &str) {
        let mut cur = self.current.lock().unwrap_or_else(|e| e.into_inner());
        cur.job_id = Some(job_id.to_string());
        cur.progress = Progress::default();
    }

    /// Record raw progress; returns the current job id for broadcasting.
    pub(crate) fn record_progress(&self, step: i32, total_steps: i32) -> Option<String> {
        let mut cur = self.current.lock().unwrap_or_else(|e| e.into_inner());
        cur.progress = Progress { step, total_steps };
        cur.job_id.clone()
    }

    pub fn current_job_id(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .job_id
            .clone()
    }

    pub fn current_progress(&self) -> Progress {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .progress
    }

    pub(crate) fn clear_current(&self) {
        let mut cur = self.current.lock().unwrap_or_else(|e| e.into_inner());
        cur.job_id = None;
    }

    /// Write fully materialized params back into the job before running.
    pub(crate) fn update_params(&self, job_id: &str, params: Value) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.params = params;
        }
    }

    /// Fill in the hash job's target file and put it on the FIFO.
    pub(crate) fn enqueue_linked_hash(
        &self,
        hash_id: &str,
        file_path: &str,
        file_name: &str,
        metadata: Value,
    ) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(job) = inner.jobs.get_mut(hash_id) {
                job.params["file_path"] = json!(file_path);
                job.params["file_name"] = json!(file_name);
                job.params["metadata"] = metadata;
                inner.pending.push_back(hash_id.to_string());
            }
        }
        self.cv.notify_one();
    }

    /// Write the final status of a processed job. The worker persists and
    /// clears the preview buffer afterwards.
    pub(crate) fn finalize(&self, job_id: &str, outcome: Result<Vec<String>, String>) {
        let final_progress = self.current_progress();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = inner.jobs.get_mut(job_id) else {
            warn!(job_id, "finalize: job vanished from store");
            return;
        };
        job.progress = final_progress;
        job.completed_at = Some(Utc::now());
        match outcome {
            Ok(outputs) => {
                job.status = JobStatus::Completed;
                job.outputs = outputs.clone();
                self.bus.broadcast(
                    EventKind::JobStatusChanged,
                    json!({
                        "job_id": job_id,
                        "status": "completed",
                        "previous_status": "processing",
                        "outputs": outputs,
                    }),
                );
                info!(job_id, outputs = outputs.len(), "job status: processing -> completed");
            }
            Err(error_message) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.clone());
                self.bus.broadcast(
                    EventKind::JobStatusChanged,
                    json!({
                        "job_id": job_id,
                        "status": "failed",
                        "previous_status": "processing",
                        "error": error_message,
                    }),
                );
                warn!(job_id, error = %error_message, "job status: processing -> failed");
            }
        }
    }

    pub(crate) fn model_settings_of(&self, job_id: &str) -> Value {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .get(job_id)
            .map(|j| j.model_settings.clone())
            .unwrap_or(Value::Null)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get(&self, job_id: &str) -> Option<Job> {
        let job = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.get(job_id).cloned()?
        };
        Some(self.fold_progress(job))
    }

    fn fold_progress(&self, mut job: Job) -> Job {
        if job.status == JobStatus::Processing {
            let cur = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if cur.job_id.as_deref() == Some(job.job_id.as_str()) {
                job.progress = cur.progress;
            }
        }
        job
    }

    fn matching(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs: Vec<Job> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .jobs
                .values()
                .filter(|j| filter.matches(j))
                .cloned()
                .collect()
        };
        jobs.into_iter().map(|j| self.fold_progress(j)).collect()
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.matching(filter)
    }

    /// Offset-paginated page, `created_at` descending.
    pub fn page(&self, filter: &JobFilter) -> JobPage {
        let mut items = self.matching(filter);
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total_count = items.len();
        let limit = filter.effective_limit();
        let start = filter.offset.min(items.len());
        let end = (start + limit).min(items.len());
        let page: Vec<Job> = items[start..end].to_vec();

        JobPage {
            newest_timestamp: page.first().map(|j| j.created_at.timestamp()),
            oldest_timestamp: page.last().map(|j| j.created_at.timestamp()),
            filtered_count: page.len(),
            has_more: end < total_count,
            items: page,
            total_count,
            offset: filter.offset,
            limit,
        }
    }

    /// Date-grouped pagination: groups are local calendar days, newest
    /// first; `limit` counts jobs, not groups, and a day may straddle pages.
    pub fn grouped_by_date(&self, filter: &JobFilter, page: usize, limit: usize) -> GroupedJobs {
        let mut items = self.matching(filter);
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total_count = items.len();
        let page_no = page.max(1);
        let limit = if limit == 0 { 20 } else { limit };

        // Group while preserving the global newest-first order.
        let mut day_order: Vec<i64> = Vec::new();
        let mut by_day: HashMap<i64, Vec<Job>> = HashMap::new();
        for job in items {
            let day = start_of_local_day(job.created_at);
            if !by_day.contains_key(&day) {
                day_order.push(day);
            }
            by_day.entry(day).or_default().push(job);
        }

        let total_pages = total_count.div_ceil(limit).max(1);
        let skip = (page_no - 1) * limit;

        let mut groups = Vec::new();
        let mut skipped = 0usize;
        let mut taken = 0usize;
        for day in day_order {
            if taken >= limit {
                break;
            }
            let day_jobs = by_day.remove(&day).unwrap_or_default();
            if skipped + day_jobs.len() <= skip {
                skipped += day_jobs.len();
                continue;
            }
            let group_skip = skip.saturating_sub(skipped);
            let take_now = (day_jobs.len() - group_skip).min(limit - taken);
            let count = day_jobs.len();
            let slice: Vec<Job> = day_jobs
                .into_iter()
                .skip(group_skip)
                .take(take_now)
                .collect();
            skipped += group_skip;
            taken += slice.len();
            if !slice.is_empty() {
                groups.push(DateGroup {
                    date: format_date(day),
                    label: format_date_label(day),
                    timestamp: day,
                    count,
                    items: slice,
                });
            }
        }

        GroupedJobs {
            groups,
            total_count,
            page: page_no,
            total_pages,
            limit,
            has_more: page_no < total_pages,
            has_prev: page_no > 1,
        }
    }

    /// `{pending_count, processing_count, completed_count, failed_count,
    /// total_count}`.
    pub fn stats(&self) -> Value {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = 0;
        let mut processing = 0;
        let mut completed = 0;
        let mut failed = 0;
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Processing => processing += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
                _ => {}
            }
        }
        json!({
            "pending_count": pending,
            "processing_count": processing,
            "completed_count": completed,
            "failed_count": failed,
            "total_count": inner.jobs.len(),
        })
    }

    /// Tombstones, most recently deleted first.
    pub fn deleted_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Deleted)
                .cloned()
                .collect()
        };
        jobs.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        jobs
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Cancel a pending job. Anything past Pending is not cancellable: the
    /// worker does not interrupt in-flight jobs.
    pub fn cancel(&self, job_id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let job = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
            if job.status != JobStatus::Pending {
                return Err(StoreError::NotCancellable {
                    id: job_id.to_string(),
                    status: job.status,
                });
            }
            job.status = JobStatus::Cancelled;
        }
        self.save();
        self.bus
            .broadcast(EventKind::JobCancelled, json!({ "job_id": job_id }));
        info!(job_id, "job cancelled");
        Ok(())
    }

    /// Soft-delete into the recycle bin, or remove outright when the bin is
    /// disabled. Refuses Processing jobs and existing tombstones.
    pub fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let soft = self.bin_enabled();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let job = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
            match job.status {
                JobStatus::Processing => {
                    return Err(StoreError::Processing {
                        id: job_id.to_string(),
                    });
                }
                JobStatus::Deleted => {
                    return Err(StoreError::AlreadyDeleted {
                        id: job_id.to_string(),
                    });
                }
                _ => {}
            }
            if soft {
                job.previous_status = Some(job.status);
                job.status = JobStatus::Deleted;
                job.deleted_at = Some(Utc::now());
            } else {
                inner.jobs.remove(job_id);
            }
        }
        self.save();
        self.bus.broadcast(
            EventKind::JobDeleted,
            json!({ "job_id": job_id, "soft_delete": soft }),
        );
        info!(job_id, soft_delete = soft, "job deleted");
        Ok(())
    }

    /// Restore a tombstone to its previous status.
    pub fn restore(&self, job_id: &str) -> Result<JobStatus, StoreError> {
        let restored = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let job = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
            if job.status != JobStatus::Deleted {
                return Err(StoreError::NotDeleted {
                    id: job_id.to_string(),
                    status: job.status,
                });
            }
            job.status = job.previous_status.unwrap_or(JobStatus::Completed);
            job.deleted_at = None;
            job.previous_status = None;
            job.status
        };
        self.save();
        self.bus.broadcast(
            EventKind::JobRestored,
            json!({ "job_id": job_id, "status": restored.as_ref() }),
        );
        info!(job_id, status = restored.as_ref(), "job restored from recycle bin");
        Ok(restored)
    }

    /// Unconditional removal (except Processing), bypassing the bin.
    pub fn purge(&self, job_id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let job = inner
                .jobs
                .get(job_id)
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
            if job.status == JobStatus::Processing {
                return Err(StoreError::Processing {
                    id: job_id.to_string(),
                });
            }
            inner.jobs.remove(job_id);
        }
        self.save();
        self.bus.broadcast(
            EventKind::JobDeleted,
            json!({ "job_id": job_id, "soft_delete": false }),
        );
        info!(job_id, "job purged");
        Ok(())
    }

    /// Move all terminal jobs to the bin (or remove them when disabled).
    pub fn clear_completed(&self) -> usize {
        let soft = self.bin_enabled();
        let cleared = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            let ids: Vec<String> = inner
                .jobs
                .values()
                .filter(|j| j.status.is_terminal())
                .map(|j| j.job_id.clone())
                .collect();
            for id in &ids {
                if soft {
                    let job = inner.jobs.get_mut(id).expect("id collected above");
                    job.previous_status = Some(job.status);
                    job.status = JobStatus::Deleted;
                    job.deleted_at = Some(now);
                } else {
                    inner.jobs.remove(id);
                }
            }
            ids.len()
        };
        if cleared > 0 {
            self.save();
        }
        info!(cleared, soft_delete = soft, "cleared finished jobs");
        cleared
    }

    /// Drop tombstones older than the retention window.
    pub fn purge_expired(&self) -> usize {
        let retention = chrono::Duration::minutes(self.recycle.retention_minutes as i64);
        let purged = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            let expired: Vec<String> = inner
                .jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Deleted
                        && j.deleted_at.is_some_and(|d| now - d > retention)
                })
                .map(|j| j.job_id.clone())
                .collect();
            for id in &expired {
                inner.jobs.remove(id);
            }
            expired.len()
        };
        if purged > 0 {
            self.save();
        }
        purged
    }

    /// Empty the recycle bin immediately.
    pub fn clear_recycle_bin(&self) -> usize {
        let purged = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Deleted)
                .map(|j| j.job_id.clone())
                .collect();
            for id in &ids {
                inner.jobs.remove(id);
            }
            ids.len()
        };
        if purged > 0 {
            self.save();
        }
        info!(purged, "recycle bin cleared");
        purged
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write the full job map atomically (`.tmp` + rename), oldest first so
    /// reload rebuilds the FIFO in creation order.
    pub fn save(&self) {
        let items: Vec<Value> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut jobs: Vec<&Job> = inner.jobs.values().collect();
            jobs.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            jobs.iter().map(|j| j.to_json()).collect()
        };
        let state = json!({ "items": items });
        let text = match serde_json::to_string_pretty(&state) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot serialize queue state");
                return;
            }
        };
        let tmp = self.state_file.with_extension("json.tmp");
        let result =
            std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, &self.state_file));
        if let Err(e) = result {
            warn!(file = %self.state_file.display(), error = %e, "failed to persist queue state");
        }
    }

    fn load_state(&self) {
        let text = match std::fs::read_to_string(&self.state_file) {
            Ok(t) => t,
            Err(_) => return,
        };
        let state: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "queue state unreadable; starting empty");
                return;
            }
        };
        let Some(items) = state.get("items").and_then(|i| i.as_array()) else {
            return;
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for item in items {
            let mut job: Job = match serde_json::from_value(item.clone()) {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable job record");
                    continue;
                }
            };
            // Jobs interrupted mid-processing go back to the queue.
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
            }
            if job.status == JobStatus::Pending
                // A hash job waiting on its download is linked but unqueued.
                && !(job.job_type == JobType::ModelHash
                    && job.params["file_path"].as_str().unwrap_or("").is_empty()
                    && job.linked_job_id.is_some())
            {
                inner.pending.push_back(job.job_id.clone());
            }
            inner.jobs.insert(job.job_id.clone(), job);
        }
        info!(jobs = inner.jobs.len(), pending = inner.pending.len(), "queue state loaded");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PathsConfig;
    use crate::registry::ModelRegistry;
    use sdhost_engine::software::SoftwareEngine;

    struct Fixture {
        _dir: tempfile::TempDir,
        lifecycle: Arc<ModelLifecycle>,
        bus: Arc<EventBus>,
        state_file: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let registry = Arc::new(ModelRegistry::new(PathsConfig::default()));
            let bus = Arc::new(EventBus::new(64));
            let lifecycle = Arc::new(ModelLifecycle::new(
                registry,
                Arc::new(SoftwareEngine::new()),
                Arc::clone(&bus),
            ));
            let state_file = dir.path().join("queue_state.json");
            Self {
                _dir: dir,
                lifecycle,
                bus,
                state_file,
            }
        }

        fn store(&self, recycle: RecycleBinConfig) -> JobStore {
            JobStore::new(
                Arc::clone(&self.lifecycle),
                Arc::clone(&self.bus),
                self.state_file.clone(),
                recycle,
            )
        }
    }

    fn bin(enabled: bool, retention_minutes: u64) -> RecycleBinConfig {
        RecycleBinConfig {
            enabled,
            retention_minutes,
        }
    }

    #[test]
    fn fifo_dispatch_order() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let a = store.add(JobType::Txt2img, json!({"prompt": "a"}));
        let b = store.add(JobType::Txt2img, json!({"prompt": "b"}));

        let running = AtomicBool::new(true);
        assert_eq!(store.next_job(&running).unwrap().id, a);
        assert_eq!(store.next_job(&running).unwrap().id, b);
    }

    #[test]
    fn cancelled_pending_job_is_skipped_at_dequeue() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let a = store.add(JobType::Txt2img, json!({"prompt": "a"}));
        let b = store.add(JobType::Txt2img, json!({"prompt": "b"}));
        store.cancel(&a).unwrap();

        let running = AtomicBool::new(true);
        let next = store.next_job(&running).unwrap();
        assert_eq!(next.id, b);
        assert_eq!(store.get(&a).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn only_pending_jobs_are_cancellable() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let id = store.add(JobType::Txt2img, json!({}));
        let running = AtomicBool::new(true);
        store.next_job(&running).unwrap();

        assert!(matches!(
            store.cancel(&id),
            Err(StoreError::NotCancellable { .. })
        ));
        assert!(matches!(store.cancel("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn recycle_bin_lifecycle() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let id = store.add(JobType::Txt2img, json!({}));
        let running = AtomicBool::new(true);
        store.next_job(&running).unwrap();
        store.finalize(&id, Ok(vec!["out.png".into()]));

        store.delete(&id).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Deleted);
        assert_eq!(job.previous_status, Some(JobStatus::Completed));
        assert!(job.deleted_at.is_some());

        // Hidden from the default view, visible in the bin view.
        assert!(store.list(&JobFilter::default()).is_empty());
        assert_eq!(store.deleted_jobs().len(), 1);

        assert!(matches!(
            store.delete(&id),
            Err(StoreError::AlreadyDeleted { .. })
        ));

        let restored = store.restore(&id).unwrap();
        assert_eq!(restored, JobStatus::Completed);
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.deleted_at.is_none());
        assert!(job.previous_status.is_none());
    }

    #[test]
    fn retention_zero_behaves_like_disabled() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 0));
        let id = store.add(JobType::Txt2img, json!({}));
        store.cancel(&id).unwrap();
        store.delete(&id).unwrap();
        assert!(store.get(&id).is_none(), "hard delete expected");
    }

    #[test]
    fn purge_refuses_processing() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let id = store.add(JobType::Txt2img, json!({}));
        let running = AtomicBool::new(true);
        store.next_job(&running).unwrap();
        assert!(matches!(
            store.purge(&id),
            Err(StoreError::Processing { .. })
        ));
    }

    #[test]
    fn download_creates_unqueued_linked_hash_job() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let (download_id, hash_id) =
            store.add_download(json!({"source": "url", "url": "https://x/m.safetensors", "model_type": "checkpoint"}));

        let download = store.get(&download_id).unwrap();
        let hash = store.get(&hash_id).unwrap();
        assert_eq!(download.linked_job_id.as_deref(), Some(hash_id.as_str()));
        assert_eq!(hash.linked_job_id.as_deref(), Some(download_id.as_str()));
        assert_eq!(hash.status, JobStatus::Pending);

        // Only the download job is dispatchable; the queue then blocks, so
        // flip `running` off to observe that the hash job was not queued.
        let running = AtomicBool::new(true);
        assert_eq!(store.next_job(&running).unwrap().id, download_id);
        running.store(false, Ordering::SeqCst);
        store.notify();
        assert!(store.next_job(&running).is_none());

        // After the download completes the hash job becomes dispatchable.
        store.enqueue_linked_hash(&hash_id, "/models/m.safetensors", "m.safetensors", json!({}));
        running.store(true, Ordering::SeqCst);
        assert_eq!(store.next_job(&running).unwrap().id, hash_id);
    }

    #[test]
    fn fail_linked_only_touches_pending_jobs() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let (_download_id, hash_id) = store.add_download(json!({"model_type": "vae"}));
        store.fail_linked(&hash_id, "Download failed: 404");

        let hash = store.get(&hash_id).unwrap();
        assert_eq!(hash.status, JobStatus::Failed);
        assert!(hash.error_message.as_deref().unwrap().contains("404"));
        assert!(hash.completed_at.is_some());

        // Re-failing a terminal job is a no-op.
        store.fail_linked(&hash_id, "other");
        assert!(store.get(&hash_id).unwrap().error_message.unwrap().contains("404"));
    }

    #[test]
    fn save_and_reload_requeues_in_order() {
        let fx = Fixture::new();
        let ids = {
            let store = fx.store(bin(true, 60));
            let a = store.add(JobType::Txt2img, json!({"prompt": "a"}));
            let b = store.add(JobType::Txt2img, json!({"prompt": "b"}));
            let c = store.add(JobType::Txt2img, json!({"prompt": "c"}));
            // Simulate a crash mid-processing of `a`.
            let running = AtomicBool::new(true);
            store.next_job(&running).unwrap();
            store.save();
            (a, b, c)
        };

        let reloaded = fx.store(bin(true, 60));
        assert_eq!(reloaded.get(&ids.0).unwrap().status, JobStatus::Pending);

        let running = AtomicBool::new(true);
        assert_eq!(reloaded.next_job(&running).unwrap().id, ids.0);
        assert_eq!(reloaded.next_job(&running).unwrap().id, ids.1);
        assert_eq!(reloaded.next_job(&running).unwrap().id, ids.2);
    }

    #[test]
    fn pagination_is_newest_first() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.add(JobType::Txt2img, json!({"prompt": format!("p{i}")})));
            // created_at has sub-second precision; no spacing needed.
        }
        let page = store.page(&JobFilter {
            limit: 2,
            ..JobFilter::default()
        });
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert!(page.items[0].created_at >= page.items[1].created_at);

        let rest = store.page(&JobFilter {
            limit: 10,
            offset: 4,
            ..JobFilter::default()
        });
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more);
    }

    #[test]
    fn date_grouping_counts_jobs() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        for i in 0..3 {
            store.add(JobType::Txt2img, json!({"prompt": format!("{i}")}));
        }
        let grouped = store.grouped_by_date(&JobFilter::default(), 1, 2);
        assert_eq!(grouped.total_count, 3);
        assert_eq!(grouped.total_pages, 2);
        assert!(grouped.has_more);
        assert!(!grouped.has_prev);
        assert_eq!(grouped.groups.len(), 1);
        assert_eq!(grouped.groups[0].label, "Today");
        assert_eq!(grouped.groups[0].count, 3);
        assert_eq!(grouped.groups[0].items.len(), 2);

        let second = store.grouped_by_date(&JobFilter::default(), 2, 2);
        assert_eq!(second.groups[0].items.len(), 1);
        assert!(second.has_prev);
    }

    #[test]
    fn stats_summary() {
        let fx = Fixture::new();
        let store = fx.store(bin(true, 60));
        store.add(JobType::Txt2img, json!({}));
        let id = store.add(JobType::Upscale, json!({}));
        store.cancel(&id).unwrap();

        let stats = store.stats();
        assert_eq!(stats["pending_count"], 1);
        assert_eq!(stats["total_count"], 2);
    }
}
