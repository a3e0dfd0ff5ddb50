//! Backend query tools the assistant may call.
//!
//! These are read-only: they gather live state so the LLM answers from real
//! data instead of guessing. UI actions (navigate, set_setting, ...) are
//! not in this set and pass through to the frontend untouched.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::catalog::ArchitectureCatalog;
use crate::lifecycle::ModelLifecycle;
use crate::queue::{JobFilter, JobStore};
use crate::registry::{ModelFilter, ModelRegistry};

const BACKEND_TOOLS: &[&str] = &[
    "get_status",
    "get_models",
    "get_architectures",
    "get_job",
    "search_jobs",
    "list_jobs",
];

pub struct ToolExecutor {
    lifecycle: Arc<ModelLifecycle>,
    store: Arc<JobStore>,
    registry: Arc<ModelRegistry>,
    catalog: Arc<ArchitectureCatalog>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor").finish()
    }
}

impl ToolExecutor {
    pub fn new(
        lifecycle: Arc<ModelLifecycle>,
        store: Arc<JobStore>,
        registry: Arc<ModelRegistry>,
        catalog: Arc<ArchitectureCatalog>,
    ) -> Self {
        Self {
            lifecycle,
            store,
            registry,
            catalog,
        }
    }

    /// Should `name` be intercepted and executed server-side?
    pub fn is_backend_tool(&self, name: &str) -> bool {
        BACKEND_TOOLS.contains(&name)
    }

    /// Execute a backend tool. Failures come back as `{"error": ...}` so
    /// the LLM can react; this never panics the chat turn.
    pub fn execute(&self, name: &str, parameters: &Value) -> Value {
        info!(tool = name, "executing assistant tool");
        match name {
            "get_status" => self.get_status(),
            "get_models" => self.get_models(),
            "get_architectures" => self.get_architectures(),
            "get_job" => match parameters["job_id"].as_str().filter(|s| !s.is_empty()) {
                Some(job_id) => self.get_job(job_id),
                None => json!({"error": "get_job requires job_id parameter"}),
            },
            "search_jobs" => self.search_jobs(parameters),
            "list_jobs" => self.list_jobs(parameters),
            _ => {
                warn!(tool = name, "unknown backend tool");
                json!({"error": format!("Unknown backend tool: {name}")})
            }
        }
    }

    fn get_status(&self) -> Value {
        let model_info = self.lifecycle.loaded_models_info();

        let recent = self.store.page(&JobFilter {
            limit: 10,
            ..JobFilter::default()
        });
        let recent_jobs: Vec<Value> = recent
            .items
            .iter()
            .map(|job| {
                let mut entry = json!({
                    "job_id": job.job_id,
                    "type": job.job_type.as_ref(),
                    "status": job.status.as_ref(),
                    "prompt": job.params["prompt"].as_str().unwrap_or(""),
                });
                if !job.model_settings.is_null() {
                    entry["model_name"] = job.model_settings["model_name"].clone();
                    entry["model_architecture"] = job.model_settings["model_architecture"].clone();
                }
                entry
            })
            .collect();

        json!({
            "model_info": model_info,
            "upscaler_info": {
                "loaded": self.lifecycle.is_upscaler_loaded(),
                "name": self.lifecycle.upscaler_name(),
            },
            "queue_stats": self.store.stats(),
            "recent_jobs": recent_jobs,
        })
    }

    fn get_models(&self) -> Value {
        let loaded = self.lifecycle.loaded_model();
        self.registry.listing(
            &ModelFilter::default(),
            loaded.as_ref().map(|(n, k)| (n.as_str(), *k)),
        )
    }

    fn get_architectures(&self) -> Value {
        self.catalog.to_json()
    }

    fn get_job(&self, job_id: &str) -> Value {
        match self.store.get(job_id) {
            Some(job) => job.to_json(),
            None => json!({"error": format!("Job not found: {job_id}")}),
        }
    }

    fn search_jobs(&self, parameters: &Value) -> Value {
        let mut filter = JobFilter {
            limit: parameters["limit"].as_u64().unwrap_or(10) as usize,
            ..JobFilter::default()
        };
        if let Some(prompt) = parameters["prompt"].as_str() {
            filter.search = Some(prompt.to_string());
        }
        if let Some(status) = parameters["status"].as_str() {
            match status.parse() {
                Ok(s) => filter.status = Some(s),
                Err(_) => return json!({"error": format!("Unknown status: {status}")}),
            }
        }
        if let Some(job_type) = parameters["type"].as_str() {
            match job_type.parse() {
                Ok(t) => filter.job_type = Some(t),
                Err(_) => return json!({"error": format!("Unknown job type: {job_type}")}),
            }
        }
        if let Some(architecture) = parameters["architecture"].as_str() {
            filter.architecture = Some(architecture.to_string());
        }
        if let Some(model) = parameters["model"].as_str() {
            filter.model = Some(model.to_string());
        }

        let page = self.store.page(&filter);
        json!({
            "jobs": page.items.iter().map(|j| j.to_json()).collect::<Vec<_>>(),
            "total_count": page.total_count,
            "returned_count": page.filtered_count,
        })
    }

    /// Minimal listing for browsing: ids and status only, no payloads.
    fn list_jobs(&self, parameters: &Value) -> Value {
        let filter = JobFilter {
            limit: parameters["limit"].as_u64().unwrap_or(10) as usize,
            offset: parameters["offset"].as_u64().unwrap_or(0) as usize,
            ..JobFilter::default()
        };
        let page = self.store.page(&filter);
        json!({
            "jobs": page
                .items
                .iter()
                .map(|j| json!({
                    "job_id": j.job_id,
                    "type": j.job_type.as_ref(),
                    "status": j.status.as_ref(),
                }))
                .collect::<Vec<_>>(),
            "total_count": page.total_count,
            "offset": page.offset,
            "limit": page.limit,
            "has_more": page.has_more,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PathsConfig, RecycleBinConfig};
    use crate::events::EventBus;
    use crate::queue::JobType;
    use sdhost_engine::software::SoftwareEngine;

    fn executor() -> (tempfile::TempDir, ToolExecutor, Arc<JobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new(PathsConfig::default()));
        let bus = Arc::new(EventBus::new(64));
        let lifecycle = Arc::new(ModelLifecycle::new(
            Arc::clone(&registry),
            Arc::new(SoftwareEngine::new()),
            Arc::clone(&bus),
        ));
        let store = Arc::new(JobStore::new(
            Arc::clone(&lifecycle),
            bus,
            dir.path().join("queue_state.json"),
            RecycleBinConfig::default(),
        ));
        let catalog = Arc::new(ArchitectureCatalog::new(dir.path()));
        let executor = ToolExecutor::new(lifecycle, Arc::clone(&store), registry, catalog);
        (dir, executor, store)
    }

    #[test]
    fn backend_tool_set_is_closed() {
        let (_d, executor, _s) = executor();
        for tool in BACKEND_TOOLS {
            assert!(executor.is_backend_tool(tool));
        }
        assert!(!executor.is_backend_tool("navigate"));
        assert!(!executor.is_backend_tool("set_setting"));
        assert!(!executor.is_backend_tool("load_model"));
    }

    #[test]
    fn get_status_includes_recent_jobs() {
        let (_d, executor, store) = executor();
        store.add(JobType::Txt2img, serde_json::json!({"prompt": "recent"}));

        let status = executor.execute("get_status", &json!({}));
        assert_eq!(status["model_info"]["model_loaded"], false);
        assert_eq!(status["queue_stats"]["pending_count"], 1);
        assert_eq!(status["recent_jobs"][0]["prompt"], "recent");
        assert_eq!(status["upscaler_info"]["loaded"], false);
    }

    #[test]
    fn get_job_requires_an_id() {
        let (_d, executor, _s) = executor();
        let out = executor.execute("get_job", &json!({}));
        assert!(out["error"].as_str().unwrap().contains("job_id"));

        let out = executor.execute("get_job", &json!({"job_id": "unknown"}));
        assert!(out["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn search_jobs_maps_filters() {
        let (_d, executor, store) = executor();
        store.add(JobType::Txt2img, serde_json::json!({"prompt": "castle at dusk"}));
        store.add(JobType::Upscale, serde_json::json!({}));

        let out = executor.execute("search_jobs", &json!({"prompt": "castle"}));
        assert_eq!(out["total_count"], 1);
        assert_eq!(out["jobs"][0]["params"]["prompt"], "castle at dusk");

        let out = executor.execute("search_jobs", &json!({"status": "bogus"}));
        assert!(out["error"].as_str().unwrap().contains("Unknown status"));
    }

    #[test]
    fn list_jobs_is_minimal() {
        let (_d, executor, store) = executor();
        store.add(JobType::Txt2img, serde_json::json!({"prompt": "secret"}));
        let out = executor.execute("list_jobs", &json!({"limit": 5}));
        assert_eq!(out["jobs"].as_array().unwrap().len(), 1);
        assert!(out["jobs"][0].get("params").is_none(), "no heavy payload");
        assert_eq!(out["has_more"], false);
    }

    #[test]
    fn unknown_tool_is_an_error_value() {
        let (_d, executor, _s) = executor();
        let out = executor.execute("rm_rf", &json!({}));
        assert!(out["error"].as_str().unwrap().contains("Unknown backend tool"));
    }
}
