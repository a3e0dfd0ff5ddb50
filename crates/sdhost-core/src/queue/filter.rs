//! Queue listing filters, pagination and date grouping.

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};
use serde::Serialize;

use super::job::{Job, JobStatus, JobType};

/// Conjunctive filter over the job map. When `status` is unset, recycle-bin
/// tombstones are excluded automatically; the bin is its own view.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Case-insensitive substring over prompt, negative prompt and job id.
    pub search: Option<String>,
    /// Case-insensitive substring over `model_settings.model_architecture`.
    pub architecture: Option<String>,
    /// Case-insensitive substring over `model_settings.model_name`.
    pub model: Option<String>,
    /// Strict bounds on `created_at`, seconds since epoch.
    pub before_timestamp: Option<i64>,
    pub after_timestamp: Option<i64>,

    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if job.status == JobStatus::Deleted && self.status != Some(JobStatus::Deleted) {
            return false;
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if job.job_type != job_type {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let prompt = job.params["prompt"].as_str().unwrap_or("").to_lowercase();
            let negative = job.params["negative_prompt"]
                .as_str()
                .unwrap_or("")
                .to_lowercase();
            if !prompt.contains(&needle)
                && !negative.contains(&needle)
                && !job.job_id.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if let Some(architecture) = &self.architecture {
            let arch = job.model_settings["model_architecture"]
                .as_str()
                .unwrap_or("")
                .to_lowercase();
            if !arch.contains(&architecture.to_lowercase()) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            let name = job.model_settings["model_name"]
                .as_str()
                .unwrap_or("")
                .to_lowercase();
            if !name.contains(&model.to_lowercase()) {
                return false;
            }
        }
        let created = job.created_at.timestamp();
        if let Some(before) = self.before_timestamp {
            if created >= before {
                return false;
            }
        }
        if let Some(after) = self.after_timestamp {
            if created <= after {
                return false;
            }
        }
        true
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 { 20 } else { self.limit }
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total_count: usize,
    pub filtered_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_timestamp: Option<i64>,
}

/// Jobs of one local calendar day.
#[derive(Debug, Clone, Serialize)]
pub struct DateGroup {
    /// `YYYY-MM-DD`.
    pub date: String,
    /// "Today", "Yesterday", or e.g. "Dec 21, 2025".
    pub label: String,
    /// Start of the local day, seconds since epoch.
    pub timestamp: i64,
    pub items: Vec<Job>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupedJobs {
    pub groups: Vec<DateGroup>,
    pub total_count: usize,
    /// 1-based.
    pub page: usize,
    pub total_pages: usize,
    pub limit: usize,
    pub has_more: bool,
    pub has_prev: bool,
}

/// Start of the local calendar day containing `at`, seconds since epoch.
pub(super) fn start_of_local_day(at: DateTime<Utc>) -> i64 {
    let local = at.with_timezone(&Local);
    Local
        .with_ymd_and_hms(local.year(), local.month(), local.day(), 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or_else(|| at.timestamp())
}

pub(super) fn format_date(day_start: i64) -> String {
    Local
        .timestamp_opt(day_start, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub(super) fn format_date_label(day_start: i64) -> String {
    let today = start_of_local_day(Utc::now());
    if day_start == today {
        return "Today".to_string();
    }
    if day_start == today - 86_400 {
        return "Yesterday".to_string();
    }
    Local
        .timestamp_opt(day_start, 0)
        .single()
        .map(|d| d.format("%b %d, %Y").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn job(prompt: &str, status: JobStatus) -> Job {
        let mut j = Job::new(JobType::Txt2img, json!({"prompt": prompt}), json!({}));
        j.status = status;
        j
    }

    #[test]
    fn deleted_jobs_hidden_unless_requested() {
        let filter = JobFilter::default();
        assert!(!filter.matches(&job("x", JobStatus::Deleted)));
        assert!(filter.matches(&job("x", JobStatus::Completed)));

        let bin = JobFilter {
            status: Some(JobStatus::Deleted),
            ..JobFilter::default()
        };
        assert!(bin.matches(&job("x", JobStatus::Deleted)));
        assert!(!bin.matches(&job("x", JobStatus::Completed)));
    }

    #[test]
    fn search_covers_prompt_negative_and_id() {
        let mut j = job("A Castle", JobStatus::Pending);
        j.params["negative_prompt"] = json!("blurry");
        let by_prompt = JobFilter {
            search: Some("castle".into()),
            ..JobFilter::default()
        };
        assert!(by_prompt.matches(&j));

        let by_negative = JobFilter {
            search: Some("BLURRY".into()),
            ..JobFilter::default()
        };
        assert!(by_negative.matches(&j));

        let by_id = JobFilter {
            search: Some(j.job_id[..8].to_string()),
            ..JobFilter::default()
        };
        assert!(by_id.matches(&j));
    }

    #[test]
    fn architecture_and_model_are_substring_matches() {
        let mut j = job("x", JobStatus::Completed);
        j.model_settings = json!({"model_architecture": "Z-Image", "model_name": "z_image_turbo.safetensors"});
        let f = JobFilter {
            architecture: Some("z-im".into()),
            model: Some("TURBO".into()),
            ..JobFilter::default()
        };
        assert!(f.matches(&j));

        let wrong = JobFilter {
            architecture: Some("flux".into()),
            ..JobFilter::default()
        };
        assert!(!wrong.matches(&j));
    }

    #[test]
    fn timestamp_bounds_are_strict() {
        let j = job("x", JobStatus::Completed);
        let created = j.created_at.timestamp();
        let exclusive = JobFilter {
            before_timestamp: Some(created),
            ..JobFilter::default()
        };
        assert!(!exclusive.matches(&j));
        let inclusive = JobFilter {
            before_timestamp: Some(created + 1),
            after_timestamp: Some(created - 1),
            ..JobFilter::default()
        };
        assert!(inclusive.matches(&j));
    }

    #[test]
    fn today_label() {
        let now = Utc::now();
        let day = start_of_local_day(now);
        assert_eq!(format_date_label(day), "Today");
        assert_eq!(format_date_label(day - 86_400), "Yesterday");
        assert!(!format_date(day).is_empty());
    }
}
