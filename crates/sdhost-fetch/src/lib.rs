//! Model download client.
//!
//! Fetches a model repository artifact to a file on disk with byte-level
//! progress. Three sources: a direct URL, CivitAI (model or version id),
//! and HuggingFace (repo + filename + optional revision). The worker
//! consumes the [`Fetcher`] trait; [`HttpFetcher`] is the production
//! implementation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;

pub use client::HttpFetcher;

/// Extensions accepted when the caller does not name the output file.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin", "gguf"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Upstream(e.to_string())
    }
}

/// Where the artifact comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DownloadSource {
    Url {
        url: String,
        /// Output file name; derived from the URL path when empty.
        #[serde(default)]
        filename: String,
    },
    Civitai {
        /// `"12345"`, `"12345:67890"` (model:version), or a bare version id.
        model_id: String,
    },
    #[serde(alias = "hf")]
    Huggingface {
        repo_id: String,
        filename: String,
        #[serde(default = "default_revision")]
        revision: String,
    },
}

fn default_revision() -> String {
    "main".into()
}

/// A fully resolved download request. The caller (the worker) decides the
/// destination directory from the model-type path configuration.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: DownloadSource,
    pub dest_dir: PathBuf,
    /// Optional subfolder under `dest_dir`.
    pub subfolder: String,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    /// Source-specific metadata carried into the paired hash job.
    pub metadata: serde_json::Value,
}

/// `(downloaded_bytes, total_bytes)`; total is 0 when unknown.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// The download seam consumed by the queue worker.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &ProgressFn,
    ) -> Result<DownloadResult, FetchError>;
}

/// True when `url` plausibly points at a model artifact.
pub fn validate_model_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|ext| path.to_ascii_lowercase().ends_with(&format!(".{ext}")))
}

pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?.trim();
    if name.is_empty() { None } else { Some(name.to_string()) }
}

pub(crate) fn dest_path(dest_dir: &Path, subfolder: &str, file_name: &str) -> PathBuf {
    if subfolder.is_empty() {
        dest_dir.join(file_name)
    } else {
        dest_dir.join(subfolder).join(file_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_validation_checks_extension() {
        assert!(validate_model_url("https://x.io/m/a.safetensors"));
        assert!(validate_model_url("https://x.io/m/a.GGUF?download=true"));
        assert!(!validate_model_url("https://x.io/m/readme.html"));
    }

    #[test]
    fn filename_extraction() {
        assert_eq!(
            filename_from_url("https://x.io/a/b/model.ckpt?sig=1").as_deref(),
            Some("model.ckpt")
        );
        assert_eq!(filename_from_url("https://x.io/a/"), None);
    }

    #[test]
    fn source_deserializes_with_tag() {
        let s: DownloadSource = serde_json::from_value(serde_json::json!({
            "source": "huggingface",
            "repo_id": "org/x",
            "filename": "m.safetensors"
        }))
        .unwrap();
        match s {
            DownloadSource::Huggingface { revision, .. } => assert_eq!(revision, "main"),
            _ => panic!("wrong variant"),
        }
    }
}
