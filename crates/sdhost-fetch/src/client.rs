//! reqwest-backed fetcher and repository metadata probes.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::{
    DownloadRequest, DownloadResult, DownloadSource, FetchError, Fetcher, ProgressFn, dest_path,
    filename_from_url, validate_model_url,
};

const CIVITAI_API: &str = "https://civitai.com/api/v1";
const HUGGINGFACE: &str = "https://huggingface.co";

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sdhost/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Resolve `(download_url, file_name, metadata)` for a source.
    async fn resolve(&self, source: &DownloadSource) -> Result<(String, String, Value), FetchError> {
        match source {
            DownloadSource::Url { url, filename } => {
                let name = if filename.is_empty() {
                    if !validate_model_url(url) {
                        return Err(FetchError::InvalidRequest(
                            "URL does not appear to point to a supported model file. \
                             Supported extensions: .safetensors, .ckpt, .pt, .pth, .bin, .gguf"
                                .into(),
                        ));
                    }
                    filename_from_url(url).ok_or_else(|| {
                        FetchError::InvalidRequest(format!("cannot derive a file name from {url}"))
                    })?
                } else {
                    filename.clone()
                };
                Ok((url.clone(), name, json!({ "source": "url", "url": url })))
            }

            DownloadSource::Civitai { model_id } => {
                let info = self.civitai_info(model_id).await?;
                let url = info["download_url"]
                    .as_str()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        FetchError::Upstream(format!(
                            "no download URL found for CivitAI model {model_id}"
                        ))
                    })?
                    .to_string();
                let name = info["filename"]
                    .as_str()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        FetchError::Upstream(format!("CivitAI model {model_id} has no file name"))
                    })?
                    .to_string();
                Ok((url, name, info))
            }

            DownloadSource::Huggingface {
                repo_id,
                filename,
                revision,
            } => {
                let ext = filename.rsplit('.').next().unwrap_or("");
                if !crate::SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                    return Err(FetchError::InvalidRequest(format!(
                        "unsupported file extension: .{ext}"
                    )));
                }
                let url = format!("{HUGGINGFACE}/{repo_id}/resolve/{revision}/{filename}");
                let metadata = json!({
                    "source": "huggingface",
                    "repo_id": repo_id,
                    "filename": filename,
                    "revision": revision,
                });
                Ok((url, filename.clone(), metadata))
            }
        }
    }

    /// CivitAI lookup: model id, `model:version`, or a bare version id.
    /// Prefers the `.safetensors` file of the selected version.
    pub async fn civitai_info(&self, model_id: &str) -> Result<Value, FetchError> {
        let (mid, vid) = match model_id.split_once(':') {
            Some((m, v)) => (parse_id(m)?, Some(parse_id(v)?)),
            None => (parse_id(model_id)?, None),
        };

        let mut model: Option<Value> = None;
        let mut version: Option<Value> = None;

        match self.get_json(&format!("{CIVITAI_API}/models/{mid}")).await {
            Ok(m) => {
                let versions = m["modelVersions"].as_array().cloned().unwrap_or_default();
                version = match vid {
                    Some(v) => versions
                        .iter()
                        .find(|e| e["id"].as_i64() == Some(v))
                        .cloned(),
                    None => versions.first().cloned(),
                };
                model = Some(m);
            }
            Err(e) if vid.is_none() => {
                // A bare id may be a version id.
                warn!(model_id = mid, error = %e, "model lookup failed; retrying as version id");
                version = Some(
                    self.get_json(&format!("{CIVITAI_API}/model-versions/{mid}"))
                        .await?,
                );
            }
            Err(e) => return Err(e),
        }

        let version = version
            .ok_or_else(|| FetchError::Upstream(format!("no version found for model {model_id}")))?;

        let files = version["files"].as_array().cloned().unwrap_or_default();
        let file = files
            .iter()
            .find(|f| {
                f["name"]
                    .as_str()
                    .is_some_and(|n| n.ends_with(".safetensors"))
            })
            .or_else(|| files.first())
            .cloned()
            .unwrap_or(Value::Null);

        let name = model
            .as_ref()
            .and_then(|m| m["name"].as_str())
            .or_else(|| version["model"]["name"].as_str())
            .unwrap_or("");
        let model_type = model
            .as_ref()
            .and_then(|m| m["type"].as_str())
            .or_else(|| version["model"]["type"].as_str())
            .unwrap_or("");

        Ok(json!({
            "source": "civitai",
            "model_id": version["modelId"].as_i64().unwrap_or(mid),
            "version_id": version["id"],
            "name": name,
            "version_name": version["name"],
            "base_model": version["baseModel"],
            "type": model_type,
            "download_url": file["downloadUrl"],
            "filename": file["name"],
            "size_kb": file["sizeKB"],
            "expected_sha256": file["hashes"]["SHA256"],
        }))
    }

    /// HuggingFace lookup: file size from the repo tree plus the resolve URL.
    pub async fn huggingface_info(
        &self,
        repo_id: &str,
        filename: &str,
        revision: &str,
    ) -> Result<Value, FetchError> {
        let tree = self
            .get_json(&format!("{HUGGINGFACE}/api/models/{repo_id}/tree/{revision}"))
            .await?;

        let size = tree
            .as_array()
            .into_iter()
            .flatten()
            .find(|item| item["path"].as_str() == Some(filename))
            .and_then(|item| item["size"].as_u64());

        Ok(json!({
            "source": "huggingface",
            "repo_id": repo_id,
            "filename": filename,
            "revision": revision,
            "file_size": size,
            "exists": size.is_some(),
            "download_url": format!("{HUGGINGFACE}/{repo_id}/resolve/{revision}/{filename}"),
        }))
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("GET {url} returned {status}")));
        }
        Ok(resp.json().await?)
    }

    /// Stream a URL to `<dest>/.part` then rename into place.
    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressFn,
    ) -> Result<u64, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Upstream(format!(
                "download of {url} failed: HTTP {status}"
            )));
        }
        let total = resp.content_length().unwrap_or(0);

        let part = dest.with_extension(match dest.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });
        let mut file = tokio::fs::File::create(&part).await?;
        let mut downloaded: u64 = 0;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, dest).await?;
        Ok(downloaded)
    }
}

fn parse_id(s: &str) -> Result<i64, FetchError> {
    s.trim()
        .parse()
        .map_err(|_| FetchError::InvalidRequest(format!("invalid CivitAI id: {s}")))
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &ProgressFn,
    ) -> Result<DownloadResult, FetchError> {
        let (url, file_name, metadata) = self.resolve(&request.source).await?;

        let dest = dest_path(&request.dest_dir, &request.subfolder, &file_name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url = %url, dest = %dest.display(), "starting model download");
        let file_size = self.stream_to_file(&url, &dest, progress).await?;
        info!(dest = %dest.display(), bytes = file_size, "download complete");

        Ok(DownloadResult {
            file_path: dest,
            file_name,
            file_size,
            metadata,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn civitai_id_parsing() {
        assert!(parse_id("123").is_ok());
        assert!(parse_id(" 99 ").is_ok());
        assert!(parse_id("12a").is_err());
    }

    #[tokio::test]
    async fn url_source_requires_model_extension_without_filename() {
        let f = HttpFetcher::new();
        let err = f
            .resolve(&DownloadSource::Url {
                url: "https://example.com/page.html".into(),
                filename: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn huggingface_rejects_bad_extension() {
        let f = HttpFetcher::new();
        let err = f
            .resolve(&DownloadSource::Huggingface {
                repo_id: "org/x".into(),
                filename: "notes.txt".into(),
                revision: "main".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn huggingface_resolves_to_resolve_url() {
        let f = HttpFetcher::new();
        let (url, name, meta) = f
            .resolve(&DownloadSource::Huggingface {
                repo_id: "org/x".into(),
                filename: "m.safetensors".into(),
                revision: "main".into(),
            })
            .await
            .unwrap();
        assert_eq!(url, "https://huggingface.co/org/x/resolve/main/m.safetensors");
        assert_eq!(name, "m.safetensors");
        assert_eq!(meta["source"], "huggingface");
    }
}
