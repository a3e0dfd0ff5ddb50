//! Architecture preset catalog.
//!
//! `model_architectures.json` maps model families (SD1, SDXL, Flux, ...) to
//! the components they require, the load options that make sense for them
//! and their generation defaults. The file is user-editable, so a
//! background thread polls its mtime every 2 seconds and reloads on change.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use serde_json::{Value, json};
use tracing::{info, warn};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ArchitecturePreset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
    /// component kind -> human description
    pub required_components: BTreeMap<String, String>,
    pub optional_components: BTreeMap<String, String>,
    pub load_options: Value,
    pub generation_defaults: Value,
}

impl ArchitecturePreset {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "aliases": self.aliases,
            "requiredComponents": self.required_components,
            "optionalComponents": self.optional_components,
            "loadOptions": self.load_options,
            "generationDefaults": self.generation_defaults,
        })
    }
}

#[derive(Default)]
struct Snapshot {
    presets: BTreeMap<String, ArchitecturePreset>,
    /// lowercased id or alias -> id
    alias_map: HashMap<String, String>,
    mtime: Option<SystemTime>,
}

pub struct ArchitectureCatalog {
    config_path: PathBuf,
    inner: RwLock<Snapshot>,
    watching: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ArchitectureCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchitectureCatalog")
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl ArchitectureCatalog {
    /// Load `model_architectures.json` from `data_dir`. A missing or broken
    /// file yields an empty catalog, not an error.
    pub fn new(data_dir: &std::path::Path) -> Self {
        let catalog = Self {
            config_path: data_dir.join("model_architectures.json"),
            inner: RwLock::new(Snapshot::default()),
            watching: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        };
        catalog.reload();
        catalog
    }

    /// Spawn the mtime poller. Stops when the catalog is dropped.
    pub fn start_watcher(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let watching = Arc::clone(&self.watching);
        let handle = std::thread::Builder::new()
            .name("arch-watcher".into())
            .spawn(move || {
                while watching.load(Ordering::SeqCst) {
                    std::thread::sleep(WATCH_INTERVAL);
                    let Some(catalog) = weak.upgrade() else {
                        break;
                    };
                    let current = std::fs::metadata(&catalog.config_path)
                        .and_then(|m| m.modified())
                        .ok();
                    let known = catalog
                        .inner
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .mtime;
                    if current.is_some() && current != known {
                        info!("architecture presets changed on disk; reloading");
                        catalog.reload();
                    }
                }
            })
            .expect("spawn arch-watcher thread");
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Re-read the file. Returns false when it is missing or unparsable
    /// (the previous snapshot is kept in that case).
    pub fn reload(&self) -> bool {
        let text = match std::fs::read_to_string(&self.config_path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "architecture config not readable");
                return false;
            }
        };
        let root: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "architecture config is not valid JSON; keeping previous presets");
                return false;
            }
        };
        let Some(architectures) = root.get("architectures").and_then(|a| a.as_object()) else {
            warn!("architecture config missing 'architectures' object");
            return false;
        };

        let mut snapshot = Snapshot {
            mtime: std::fs::metadata(&self.config_path)
                .and_then(|m| m.modified())
                .ok(),
            ..Snapshot::default()
        };

        for (id, value) in architectures {
            let string_map = |key: &str| -> BTreeMap<String, String> {
                value
                    .get(key)
                    .and_then(|v| v.as_object())
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let preset = ArchitecturePreset {
                id: id.clone(),
                name: value
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(id)
                    .to_string(),
                description: value
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                aliases: value
                    .get("aliases")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                required_components: string_map("requiredComponents"),
                optional_components: string_map("optionalComponents"),
                load_options: value.get("loadOptions").cloned().unwrap_or_else(|| json!({})),
                generation_defaults: value
                    .get("generationDefaults")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            };

            snapshot.alias_map.insert(id.to_lowercase(), id.clone());
            for alias in &preset.aliases {
                snapshot.alias_map.insert(alias.to_lowercase(), id.clone());
            }
            snapshot.presets.insert(id.clone(), preset);
        }

        let count = snapshot.presets.len();
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        info!(presets = count, "architecture presets loaded");
        true
    }

    pub fn all(&self) -> Vec<ArchitecturePreset> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .presets
            .values()
            .cloned()
            .collect()
    }

    /// Lookup by exact id, lowercased alias, then substring either way.
    pub fn get(&self, name: &str) -> Option<ArchitecturePreset> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        if let Some(preset) = inner.presets.get(name) {
            return Some(preset.clone());
        }

        let lower = name.to_lowercase();
        if let Some(id) = inner.alias_map.get(&lower) {
            return inner.presets.get(id).cloned();
        }

        inner
            .presets
            .iter()
            .find(|(id, _)| {
                let id_lower = id.to_lowercase();
                lower.contains(&id_lower) || id_lower.contains(&lower)
            })
            .map(|(_, preset)| preset.clone())
    }

    /// Default step count for an architecture, `fallback` when unknown.
    pub fn default_steps(&self, architecture: &str, fallback: i64) -> i64 {
        self.get(architecture)
            .and_then(|p| p.generation_defaults.get("steps").and_then(|v| v.as_i64()))
            .unwrap_or(fallback)
    }

    /// `{id: preset}` object for `/architectures` and the assistant tool.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Value::Object(
            inner
                .presets
                .iter()
                .map(|(id, preset)| (id.clone(), preset.to_json()))
                .collect(),
        )
    }
}

impl Drop for ArchitectureCatalog {
    fn drop(&mut self) {
        self.watching.store(false, Ordering::SeqCst);
        // The watcher holds only a weak reference, so it also exits on its
        // next tick if this drop happens without a join.
        if let Some(handle) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "architectures": {
            "Flux": {
                "name": "Flux",
                "description": "Black Forest Labs Flux",
                "aliases": ["flux1", "flux.1"],
                "requiredComponents": {"vae": "Autoencoder", "clip_l": "CLIP-L", "t5xxl": "T5-XXL"},
                "optionalComponents": {"taesd": "Preview decoder"},
                "loadOptions": {"flash_attn": true},
                "generationDefaults": {"steps": 20, "cfg_scale": 1.0}
            },
            "SDXL": {
                "name": "Stable Diffusion XL",
                "aliases": ["sd_xl"],
                "generationDefaults": {"steps": 30}
            }
        }
    }"#;

    fn catalog_with(content: &str) -> (tempfile::TempDir, ArchitectureCatalog) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model_architectures.json"), content).unwrap();
        let catalog = ArchitectureCatalog::new(dir.path());
        (dir, catalog)
    }

    #[test]
    fn lookup_by_id_alias_and_substring() {
        let (_dir, catalog) = catalog_with(SAMPLE);
        assert_eq!(catalog.get("Flux").unwrap().id, "Flux");
        assert_eq!(catalog.get("FLUX.1").unwrap().id, "Flux");
        assert_eq!(catalog.get("sd_xl").unwrap().id, "SDXL");
        // Substring in either direction.
        assert_eq!(catalog.get("flux1-schnell-q4").unwrap().id, "Flux");
        assert!(catalog.get("unknown-arch").is_none());
    }

    #[test]
    fn required_components_parse() {
        let (_dir, catalog) = catalog_with(SAMPLE);
        let flux = catalog.get("flux").unwrap();
        assert_eq!(flux.required_components.len(), 3);
        assert!(flux.required_components.contains_key("t5xxl"));
        assert_eq!(catalog.default_steps("flux", 99), 20);
        assert_eq!(catalog.default_steps("nope", 99), 99);
    }

    #[test]
    fn reload_picks_up_changes() {
        let (dir, catalog) = catalog_with(SAMPLE);
        assert!(catalog.get("SD3").is_none());
        std::fs::write(
            dir.path().join("model_architectures.json"),
            r#"{"architectures": {"SD3": {"name": "SD3"}}}"#,
        )
        .unwrap();
        assert!(catalog.reload());
        assert!(catalog.get("SD3").is_some());
        assert!(catalog.get("Flux").is_none());
    }

    #[test]
    fn broken_file_keeps_previous_snapshot() {
        let (dir, catalog) = catalog_with(SAMPLE);
        std::fs::write(dir.path().join("model_architectures.json"), "{ not json").unwrap();
        assert!(!catalog.reload());
        assert!(catalog.get("Flux").is_some());
    }
}
