//! Model discovery and indexing.
//!
//! Walks the configured root of every model kind, indexes files by their
//! path relative to that root (subdirectories preserved), and serves
//! lookups and filtered listings. SHA-256 digests are computed on demand
//! and cached in the entry; a rescan atomically replaces the whole index.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PathsConfig;

/// Extensions the scanner accepts.
pub const MODEL_EXTENSIONS: &[&str] = &["safetensors", "gguf", "ckpt", "pt", "pth"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model not found: '{name}' (type: {kind})")]
    NotFound { kind: ModelKind, name: String },

    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ModelKind {
    /// SD1.x / SD2.x / SDXL full checkpoints.
    Checkpoint,
    /// Standalone diffusion models (Flux, SD3, Qwen, Wan, Z-Image).
    Diffusion,
    Vae,
    Lora,
    Clip,
    T5,
    Embedding,
    Controlnet,
    Llm,
    Esrgan,
    Taesd,
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Checkpoint
    }
}

/// An indexed model file. Immutable once scanned apart from the lazily
/// filled digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Path relative to the kind's root; the stable key used everywhere.
    pub name: String,
    pub full_path: PathBuf,
    pub kind: ModelKind,
    pub extension: String,
    pub size_bytes: u64,
    pub hash: Option<String>,
}

impl ModelEntry {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.kind.as_ref(),
            "file_extension": self.extension,
            "size_bytes": self.size_bytes,
            "hash": self.hash,
        })
    }
}

/// Listing filter; all axes optional and conjunctive.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub kind: Option<ModelKind>,
    /// Exact extension match, leading dot optional.
    pub extension: Option<String>,
    /// Case-insensitive substring on the name.
    pub search: Option<String>,
}

impl ModelFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.extension.is_none() && self.search.is_none()
    }

    fn matches(&self, entry: &ModelEntry) -> bool {
        if let Some(ext) = &self.extension {
            if !entry.extension.eq_ignore_ascii_case(ext.trim_start_matches('.')) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !entry
                .name
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct ModelRegistry {
    paths: PathsConfig,
    inner: RwLock<HashMap<ModelKind, BTreeMap<String, ModelEntry>>>,
}

impl ModelRegistry {
    pub fn new(paths: PathsConfig) -> Self {
        Self {
            paths,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Root directory for a model kind; `None` when not configured.
    pub fn base_dir(&self, kind: ModelKind) -> Option<PathBuf> {
        let p = &self.paths;
        let dir = match kind {
            ModelKind::Checkpoint => &p.checkpoints,
            ModelKind::Diffusion => &p.diffusion_models,
            ModelKind::Vae => &p.vae,
            ModelKind::Lora => &p.lora,
            ModelKind::Clip => &p.clip,
            ModelKind::T5 => &p.t5,
            ModelKind::Embedding => &p.embeddings,
            ModelKind::Controlnet => &p.controlnet,
            ModelKind::Llm => &p.llm,
            ModelKind::Esrgan => &p.esrgan,
            ModelKind::Taesd => &p.taesd,
        };
        if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        }
    }

    pub fn lora_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.lora)
    }

    /// Directory configuration handed to the download manager.
    pub fn paths_config(&self) -> Value {
        let mut out = serde_json::Map::new();
        for kind in ModelKind::iter() {
            out.insert(
                kind.as_ref().to_string(),
                self.base_dir(kind)
                    .map(|p| json!(p.to_string_lossy()))
                    .unwrap_or(Value::Null),
            );
        }
        Value::Object(out)
    }

    /// Rebuild the index from disk. Absent roots are skipped; the previous
    /// index (including cached hashes for unchanged names) is replaced
    /// atomically.
    pub fn scan(&self) {
        let mut fresh: HashMap<ModelKind, BTreeMap<String, ModelEntry>> = HashMap::new();

        for kind in ModelKind::iter() {
            let Some(root) = self.base_dir(kind) else {
                continue;
            };
            if !root.is_dir() {
                debug!(kind = kind.as_ref(), root = %root.display(), "model root absent; skipped");
                continue;
            }
            let bucket = fresh.entry(kind).or_default();
            for entry in walkdir::WalkDir::new(&root)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let path = entry.path();
                let Some(extension) = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                else {
                    continue;
                };
                if !MODEL_EXTENSIONS.contains(&extension.as_str()) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let name = rel.to_string_lossy().replace('\\', "/");
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                bucket.insert(
                    name.clone(),
                    ModelEntry {
                        name,
                        full_path: path.to_path_buf(),
                        kind,
                        extension,
                        size_bytes,
                        hash: None,
                    },
                );
            }
        }

        // Carry cached hashes across the rescan for files that are still
        // present with the same size.
        {
            let old = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for (kind, bucket) in fresh.iter_mut() {
                if let Some(old_bucket) = old.get(kind) {
                    for (name, entry) in bucket.iter_mut() {
                        if let Some(prev) = old_bucket.get(name) {
                            if prev.size_bytes == entry.size_bytes {
                                entry.hash = prev.hash.clone();
                            }
                        }
                    }
                }
            }
        }

        let total: usize = fresh.values().map(|b| b.len()).sum();
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!(models = total, "model scan complete");
    }

    pub fn get(&self, kind: ModelKind, name: &str) -> Option<ModelEntry> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)?
            .get(name)
            .cloned()
    }

    pub fn models_of(&self, kind: ModelKind) -> Vec<ModelEntry> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: ModelKind) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Grouped listing for `/models` and the assistant's `get_models` tool.
    /// `loaded` carries the currently resident main model, if any.
    pub fn listing(&self, filter: &ModelFilter, loaded: Option<(&str, ModelKind)>) -> Value {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut result = serde_json::Map::new();

        let groups: &[(ModelKind, &str)] = &[
            (ModelKind::Checkpoint, "checkpoints"),
            (ModelKind::Diffusion, "diffusion_models"),
            (ModelKind::Vae, "vae"),
            (ModelKind::Lora, "loras"),
            (ModelKind::Clip, "clip"),
            (ModelKind::T5, "t5"),
            (ModelKind::Embedding, "embeddings"),
            (ModelKind::Controlnet, "controlnets"),
            (ModelKind::Llm, "llm"),
            (ModelKind::Esrgan, "esrgan"),
            (ModelKind::Taesd, "taesd"),
        ];

        for (kind, key) in groups {
            if filter.kind.is_some_and(|k| k != *kind) {
                result.insert((*key).to_string(), json!([]));
                continue;
            }
            let mut arr = Vec::new();
            if let Some(bucket) = inner.get(kind) {
                for entry in bucket.values() {
                    if !filter.matches(entry) {
                        continue;
                    }
                    let mut j = entry.to_json();
                    if matches!(kind, ModelKind::Checkpoint | ModelKind::Diffusion) {
                        j["is_loaded"] =
                            json!(loaded.is_some_and(|(n, k)| n == entry.name && k == *kind));
                    }
                    arr.push(j);
                }
            }
            result.insert((*key).to_string(), json!(arr));
        }

        result.insert(
            "loaded_model".into(),
            loaded.map(|(n, _)| json!(n)).unwrap_or(Value::Null),
        );
        result.insert(
            "loaded_model_type".into(),
            loaded.map(|(_, k)| json!(k.as_ref())).unwrap_or(Value::Null),
        );

        if !filter.is_empty() {
            let mut info = serde_json::Map::new();
            if let Some(kind) = filter.kind {
                info.insert("type".into(), json!(kind.as_ref()));
            }
            if let Some(ext) = &filter.extension {
                info.insert("extension".into(), json!(ext));
            }
            if let Some(search) = &filter.search {
                info.insert("search".into(), json!(search));
            }
            result.insert("applied_filters".into(), Value::Object(info));
        }

        Value::Object(result)
    }

    /// SHA-256 of a model file, hex-encoded. Computed once and cached.
    pub fn hash(&self, kind: ModelKind, name: &str) -> Result<String, RegistryError> {
        let entry = self.get(kind, name).ok_or_else(|| RegistryError::NotFound {
            kind,
            name: name.to_string(),
        })?;
        if let Some(hash) = entry.hash {
            return Ok(hash);
        }

        info!(model = name, "computing model hash");
        let hash = sha256_file(&entry.full_path).map_err(|source| RegistryError::Io {
            path: entry.full_path.clone(),
            source,
        })?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(e) = inner.get_mut(&kind).and_then(|b| b.get_mut(name)) {
            e.hash = Some(hash.clone());
        } else {
            // Rescanned away while hashing; still return the digest.
            warn!(model = name, "hashed model no longer in index");
        }
        Ok(hash)
    }
}

/// Streamed SHA-256 of a file, hex-encoded. `progress` receives
/// `(bytes_read, total_bytes)` per chunk.
pub fn sha256_file_with_progress(
    path: &Path,
    mut progress: impl FnMut(u64, u64),
) -> std::io::Result<String> {
    let total = std::fs::metadata(path)?.len();
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    let mut read_total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_total += n as u64;
        progress(read_total, total);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    sha256_file_with_progress(path, |_, _| {})
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ModelRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("checkpoints");
        let vae = dir.path().join("vae");
        std::fs::create_dir_all(&ckpt).unwrap();
        std::fs::create_dir_all(&vae).unwrap();
        for (rel, content) in files {
            let path = ckpt.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let registry = ModelRegistry::new(PathsConfig {
            checkpoints: ckpt.to_string_lossy().into_owned(),
            vae: vae.to_string_lossy().into_owned(),
            ..PathsConfig::default()
        });
        registry.scan();
        (dir, registry)
    }

    #[test]
    fn scan_indexes_by_relative_name() {
        let (_dir, reg) = registry_with(&[
            ("SD1x/model.safetensors", "aa"),
            ("top.ckpt", "bb"),
            ("notes.txt", "ignored"),
        ]);
        assert_eq!(reg.count(ModelKind::Checkpoint), 2);
        let entry = reg.get(ModelKind::Checkpoint, "SD1x/model.safetensors").unwrap();
        assert_eq!(entry.extension, "safetensors");
        assert_eq!(entry.size_bytes, 2);
        assert!(reg.get(ModelKind::Checkpoint, "notes.txt").is_none());
    }

    #[test]
    fn filter_by_extension_and_search() {
        let (_dir, reg) = registry_with(&[
            ("anime/waifu.safetensors", "x"),
            ("photo/real.gguf", "y"),
        ]);
        let listing = reg.listing(
            &ModelFilter {
                extension: Some(".gguf".into()),
                ..ModelFilter::default()
            },
            None,
        );
        let arr = listing["checkpoints"].as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["name"], "photo/real.gguf");

        let listing = reg.listing(
            &ModelFilter {
                search: Some("WAIFU".into()),
                ..ModelFilter::default()
            },
            None,
        );
        assert_eq!(listing["checkpoints"].as_array().unwrap().len(), 1);
        assert_eq!(listing["applied_filters"]["search"], "WAIFU");
    }

    #[test]
    fn hash_is_computed_once_and_cached() {
        let (_dir, reg) = registry_with(&[("m.safetensors", "hello")]);
        let h1 = reg.hash(ModelKind::Checkpoint, "m.safetensors").unwrap();
        // SHA-256 of "hello"
        assert_eq!(
            h1,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            reg.get(ModelKind::Checkpoint, "m.safetensors").unwrap().hash,
            Some(h1)
        );
    }

    #[test]
    fn missing_model_is_a_normal_absence() {
        let (_dir, reg) = registry_with(&[]);
        assert!(reg.get(ModelKind::Checkpoint, "nope.ckpt").is_none());
        assert!(matches!(
            reg.hash(ModelKind::Checkpoint, "nope.ckpt"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn loaded_model_is_flagged_in_listing() {
        let (_dir, reg) = registry_with(&[("m.safetensors", "x")]);
        let listing = reg.listing(
            &ModelFilter::default(),
            Some(("m.safetensors", ModelKind::Checkpoint)),
        );
        assert_eq!(listing["checkpoints"][0]["is_loaded"], true);
        assert_eq!(listing["loaded_model"], "m.safetensors");
    }
}
