//! The job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobType {
    Txt2img,
    Img2img,
    Txt2vid,
    Upscale,
    Convert,
    ModelDownload,
    ModelHash,
}

/// Lifecycle: `Pending → Processing → Completed | Failed`, `Pending →
/// Cancelled`, any terminal state `→ Deleted` (recycle bin) and back via
/// restore. `Deleted` is a tombstone with retention, not a real state of
/// work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl JobStatus {
    /// Completed, failed or cancelled: eligible for the recycle bin.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Raw step counters as reported by the backend callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub step: i32,
    pub total_steps: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Kind-specific parameters; materialized with defaults once the worker
    /// picks the job up.
    pub params: Value,
    /// Copy of the loaded-model snapshot taken at enqueue time. This is
    /// what lets the UI reload a finished job's exact configuration.
    pub model_settings: Value,
    pub progress: Progress,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Paths relative to the output directory (or opaque values such as the
    /// digest of a hash job).
    pub outputs: Vec<String>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Companion job id: a download points at its hash job and vice versa.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_job_id: Option<String>,

    // Recycle-bin fields, present only on tombstones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<JobStatus>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            job_type: JobType::Txt2img,
            status: JobStatus::Pending,
            params: Value::Null,
            model_settings: Value::Null,
            progress: Progress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outputs: Vec::new(),
            error_message: None,
            linked_job_id: None,
            deleted_at: None,
            previous_status: None,
        }
    }
}

impl Job {
    pub fn new(job_type: JobType, params: Value, model_settings: Value) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type,
            params,
            model_settings,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_are_snake_case() {
        assert_eq!(JobStatus::Processing.as_ref(), "processing");
        assert_eq!(JobType::ModelDownload.as_ref(), "model_download");
        assert_eq!("model_hash".parse::<JobType>().unwrap(), JobType::ModelHash);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Deleted.is_terminal());
    }

    #[test]
    fn serialization_round_trip() {
        let mut job = Job::new(JobType::Txt2img, json!({"prompt": "hi"}), json!({}));
        job.error_message = Some("boom".into());
        job.previous_status = Some(JobStatus::Completed);
        job.deleted_at = Some(Utc::now());

        let v = job.to_json();
        assert_eq!(v["type"], "txt2img");
        assert_eq!(v["error"], "boom");
        assert_eq!(v["previous_status"], "completed");

        let back: Job = serde_json::from_value(v).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.previous_status, Some(JobStatus::Completed));
    }

    #[test]
    fn absent_optionals_are_omitted() {
        let job = Job::new(JobType::Upscale, json!({}), json!({}));
        let v = job.to_json();
        assert!(v.get("error").is_none());
        assert!(v.get("deleted_at").is_none());
        assert!(v.get("started_at").is_none());
    }
}
