//! Application configuration, loaded from a JSON file at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// WebSocket port; 0 disables the event stream.
    pub ws_port: u16,
    /// HTTP worker threads.
    pub threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            ws_port: 8081,
            threads: 8,
        }
    }
}

/// Model directory roots, one per model kind. Empty entries are treated as
/// "kind not configured" and silently skipped by the registry scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SD1.x / SD2.x / SDXL full checkpoints.
    pub checkpoints: String,
    /// Flux, SD3, Qwen, Wan, Z-Image standalone diffusion models.
    pub diffusion_models: String,
    pub vae: String,
    pub lora: String,
    pub clip: String,
    pub t5: String,
    pub embeddings: String,
    pub controlnet: String,
    /// LLM text encoders for multimodal models.
    pub llm: String,
    /// ESRGAN upscalers.
    pub esrgan: String,
    /// TAESD tiny autoencoders for previews.
    pub taesd: String,
    /// Generated output directory (created if missing).
    pub output: String,
    /// Static Web UI directory (optional).
    pub webui: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdDefaultsConfig {
    /// -1 = auto-detect physical cores.
    pub n_threads: i32,
    pub keep_clip_on_cpu: bool,
    pub keep_vae_on_cpu: bool,
    pub flash_attn: bool,
    pub offload_to_cpu: bool,
}

impl Default for SdDefaultsConfig {
    fn default() -> Self {
        Self {
            n_threads: -1,
            keep_clip_on_cpu: true,
            keep_vae_on_cpu: false,
            flash_attn: true,
            offload_to_cpu: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    /// `none | proj | tae | vae`.
    pub mode: String,
    /// Generate a preview every N steps.
    pub interval: i32,
    /// Longest preview dimension in pixels.
    pub max_size: u32,
    /// JPEG quality 1-100.
    pub quality: u8,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "tae".into(),
            interval: 1,
            max_size: 256,
            quality: 75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub enabled: bool,
    /// Ollama-compatible chat endpoint.
    pub endpoint: String,
    /// Optional bearer token for cloud endpoints.
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Appended to the built-in system prompt when non-empty.
    pub system_prompt: String,
    /// Conversation turns kept; history is pruned to twice this.
    pub max_history_turns: usize,
    pub proactive_suggestions: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434".into(),
            api_key: String::new(),
            model: "llama3.2".into(),
            temperature: 0.7,
            max_tokens: 2000,
            timeout_seconds: 120,
            system_prompt: String::new(),
            max_history_turns: 20,
            proactive_suggestions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecycleBinConfig {
    pub enabled: bool,
    /// Deleted jobs older than this are purged. 0 behaves like disabled.
    pub retention_minutes: u64,
}

impl Default for RecycleBinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_minutes: 7 * 24 * 60,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub sd_defaults: SdDefaultsConfig,
    pub preview: PreviewConfig,
    pub assistant: AssistantConfig,
    pub recycle_bin: RecycleBinConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate ports and paths. Declared model directories must exist; the
    /// output directory is created when missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be in 1..=65535".into()));
        }
        if self.server.ws_port != 0 && self.server.ws_port == self.server.port {
            return Err(ConfigError::Invalid(
                "server.ws_port must differ from server.port".into(),
            ));
        }

        for (key, value) in self.model_dirs() {
            if value.is_empty() {
                continue;
            }
            let p = Path::new(value);
            if !p.exists() {
                return Err(ConfigError::Invalid(format!(
                    "paths.{key} does not exist: {value}"
                )));
            }
            if !p.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "paths.{key} is not a directory: {value}"
                )));
            }
        }

        if self.paths.output.is_empty() {
            return Err(ConfigError::Invalid("paths.output is required".into()));
        }
        std::fs::create_dir_all(&self.paths.output).map_err(|e| {
            ConfigError::Invalid(format!(
                "cannot create output directory {}: {e}",
                self.paths.output
            ))
        })?;

        Ok(())
    }

    fn model_dirs(&self) -> [(&'static str, &str); 12] {
        let p = &self.paths;
        [
            ("checkpoints", &p.checkpoints),
            ("diffusion_models", &p.diffusion_models),
            ("vae", &p.vae),
            ("lora", &p.lora),
            ("clip", &p.clip),
            ("t5", &p.t5),
            ("embeddings", &p.embeddings),
            ("controlnet", &p.controlnet),
            ("llm", &p.llm),
            ("esrgan", &p.esrgan),
            ("taesd", &p.taesd),
            ("webui", &p.webui),
        ]
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal(output: &str) -> Config {
        Config {
            paths: PathsConfig {
                output: output.to_string(),
                ..PathsConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn output_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let cfg = minimal(out.to_str().unwrap());
        cfg.validate().unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn ws_port_must_differ() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = minimal(dir.path().to_str().unwrap());
        cfg.server.ws_port = cfg.server.port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_model_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = minimal(dir.path().to_str().unwrap());
        cfg.paths.checkpoints = dir.path().join("nope").to_string_lossy().into_owned();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("checkpoints"));
    }

    #[test]
    fn defaults_parse_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.ws_port, 8081);
        assert_eq!(cfg.preview.mode, "tae");
        assert!(!cfg.assistant.enabled);
        assert!(cfg.recycle_bin.enabled);
    }
}
