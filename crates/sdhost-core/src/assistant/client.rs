//! Assistant client for an Ollama-compatible chat endpoint.
//!
//! Request construction, response normalization (native tool calls or
//! fenced action blocks), backend-tool interception, and persisted
//! conversation history pruned to twice the configured turn count.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::AsRefStr;
use tracing::{info, warn};

use super::actions::{
    AssistantAction, ToolCallInfo, extract_fenced_actions, extract_tool_calls, strip_action_blocks,
};
use super::prompt::DEFAULT_SYSTEM_PROMPT;
use super::tools::ToolExecutor;
use crate::config::AssistantConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One persisted history entry. Stored newest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
pub struct AssistantResponse {
    pub success: bool,
    pub message: String,
    pub thinking: String,
    /// Frontend actions; backend tools were already intercepted.
    pub actions: Vec<AssistantAction>,
    pub tool_calls: Vec<ToolCallInfo>,
    pub error: Option<String>,
}

impl AssistantResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "message": self.message,
            "thinking": self.thinking,
            "actions": self.actions,
            "tool_calls": self.tool_calls,
            "error": self.error,
        })
    }
}

pub struct AssistantClient {
    config: RwLock<AssistantConfig>,
    /// Path of the server config file; runtime settings changes are written
    /// back into its `assistant` section.
    config_file: Option<PathBuf>,
    history_file: PathBuf,
    history: Mutex<Vec<ConversationMessage>>,
    tools: Arc<ToolExecutor>,
    http: reqwest::Client,
}

impl std::fmt::Debug for AssistantClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantClient")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AssistantClient {
    pub fn new(
        config: AssistantConfig,
        data_dir: &Path,
        config_file: Option<PathBuf>,
        tools: Arc<ToolExecutor>,
    ) -> Self {
        let client = Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
                .build()
                .unwrap_or_default(),
            config: RwLock::new(config),
            config_file,
            history_file: data_dir.join("assistant_history.json"),
            history: Mutex::new(Vec::new()),
            tools,
        };
        client.load_history();
        client
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    fn config(&self) -> AssistantConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    /// One chat turn. `context` is the compact state block the UI supplies.
    pub async fn chat(&self, user_message: &str, context: &Value) -> AssistantResponse {
        let config = self.config();
        if !config.enabled {
            return AssistantResponse::failed("Assistant is disabled");
        }
        if user_message.trim().is_empty() {
            return AssistantResponse::failed("Message cannot be empty");
        }

        let body = json!({
            "model": config.model,
            "messages": self.build_messages(user_message, context, &config),
            "stream": false,
            "options": {
                "temperature": config.temperature,
                "num_predict": config.max_tokens,
            },
        });

        info!(endpoint = %config.endpoint, model = %config.model, "assistant chat request");
        let response = match self.post_chat(&config, &body).await {
            Ok(v) => v,
            Err(e) => return AssistantResponse::failed(e),
        };

        let message = &response["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let thinking = message["thinking"].as_str().unwrap_or("").to_string();

        let mut outcome = self.normalize(message, &content);
        outcome.thinking = thinking;

        if !outcome.success {
            return outcome;
        }

        self.push_history(user_message, &outcome);
        outcome
    }

    /// Streaming chat turn. Events (`content`, `thinking`, `tool_call`,
    /// `done`, `error`) are pushed into `tx` as they happen.
    pub async fn chat_stream(
        &self,
        user_message: &str,
        context: &Value,
        tx: tokio::sync::mpsc::Sender<(String, Value)>,
    ) {
        let send = |tx: &tokio::sync::mpsc::Sender<(String, Value)>, event: &str, data: Value| {
            let _ = tx.try_send((event.to_string(), data));
        };

        let config = self.config();
        if !config.enabled {
            send(&tx, "error", json!({"error": "Assistant is disabled"}));
            return;
        }
        if user_message.trim().is_empty() {
            send(&tx, "error", json!({"error": "Message cannot be empty"}));
            return;
        }

        let body = json!({
            "model": config.model,
            "messages": self.build_messages(user_message, context, &config),
            "stream": true,
            "options": {
                "temperature": config.temperature,
                "num_predict": config.max_tokens,
            },
        });

        let mut request = self
            .http
            .post(format!("{}/api/chat", config.endpoint.trim_end_matches('/')))
            .json(&body);
        if !config.api_key.is_empty() {
            request = request.bearer_auth(&config.api_key);
        }

        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                send(&tx, "error", json!({"error": format!("LLM API error: HTTP {}", r.status())}));
                return;
            }
            Err(e) => {
                send(&tx, "error", json!({"error": format!("Failed to connect to LLM server: {e}")}));
                return;
            }
        };

        // Ollama streams newline-delimited JSON chunks.
        let mut content = String::new();
        let mut thinking = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    send(&tx, "error", json!({"error": format!("stream error: {e}")}));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let Ok(piece) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(delta) = piece["message"]["content"].as_str() {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        send(&tx, "content", json!({"text": delta}));
                    }
                }
                if let Some(delta) = piece["message"]["thinking"].as_str() {
                    if !delta.is_empty() {
                        thinking.push_str(delta);
                        send(&tx, "thinking", json!({"text": delta}));
                    }
                }
            }
        }

        let mut outcome = self.normalize(&json!({}), &content);
        outcome.thinking = thinking;
        for call in &outcome.tool_calls {
            send(
                &tx,
                "tool_call",
                json!({"name": call.name, "parameters": call.parameters, "result": call.result}),
            );
        }
        self.push_history(user_message, &outcome);
        send(
            &tx,
            "done",
            json!({"message": outcome.message, "actions": outcome.actions}),
        );
    }

    async fn post_chat(&self, config: &AssistantConfig, body: &Value) -> Result<Value, String> {
        let mut request = self
            .http
            .post(format!("{}/api/chat", config.endpoint.trim_end_matches('/')))
            .json(body);
        if !config.api_key.is_empty() {
            request = request.bearer_auth(&config.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("Failed to connect to LLM server: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("LLM API error: HTTP {status}"));
        }
        response
            .json()
            .await
            .map_err(|e| format!("Failed to parse LLM response: {e}"))
    }

    /// Normalize the reply into one action stream (native tool calls first,
    /// fenced blocks otherwise), then intercept backend tools.
    fn normalize(&self, message: &Value, content: &str) -> AssistantResponse {
        let native = extract_tool_calls(message);
        let (raw_actions, visible) = if native.is_empty() {
            (extract_fenced_actions(content), strip_action_blocks(content))
        } else {
            (native, content.trim().to_string())
        };

        if raw_actions.is_empty() && visible.is_empty() {
            return AssistantResponse::failed("LLM returned an empty response");
        }

        let mut actions = Vec::new();
        let mut tool_calls = Vec::new();
        for action in raw_actions {
            if self.tools.is_backend_tool(&action.action_type) {
                let result = self.tools.execute(&action.action_type, &action.parameters);
                tool_calls.push(ToolCallInfo {
                    name: action.action_type,
                    parameters: action.parameters,
                    result,
                    executed_on_backend: true,
                });
            } else {
                tool_calls.push(ToolCallInfo {
                    name: action.action_type.clone(),
                    parameters: action.parameters.clone(),
                    result: Value::Null,
                    executed_on_backend: false,
                });
                actions.push(action);
            }
        }

        AssistantResponse {
            success: true,
            message: visible,
            thinking: String::new(),
            actions,
            tool_calls,
            error: None,
        }
    }

    fn build_messages(
        &self,
        user_message: &str,
        context: &Value,
        config: &AssistantConfig,
    ) -> Vec<Value> {
        let mut system = DEFAULT_SYSTEM_PROMPT.to_string();
        if !config.system_prompt.is_empty() {
            system.push_str("\n\n");
            system.push_str(&config.system_prompt);
        }

        let mut messages = vec![json!({"role": "system", "content": system})];
        if !context.is_null() {
            messages.push(json!({
                "role": "system",
                "content": format!("Current application context: {context}"),
            }));
        }

        // History is stored newest-first; replay chronologically.
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        for message in history.iter().rev() {
            messages.push(json!({
                "role": message.role.as_ref(),
                "content": message.content,
            }));
        }
        drop(history);

        messages.push(json!({"role": "user", "content": user_message}));
        messages
    }

    // ── History ──────────────────────────────────────────────────────────

    fn push_history(&self, user_message: &str, outcome: &AssistantResponse) {
        let timestamp = Utc::now().timestamp();
        let assistant_content = if outcome.message.is_empty() && !outcome.tool_calls.is_empty() {
            let names: Vec<&str> = outcome.tool_calls.iter().map(|c| c.name.as_str()).collect();
            format!("[Tool calls: {}]", names.join(", "))
        } else {
            outcome.message.clone()
        };

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.insert(
            0,
            ConversationMessage {
                role: MessageRole::User,
                content: user_message.to_string(),
                thinking: String::new(),
                tool_calls: Vec::new(),
                timestamp,
            },
        );
        history.insert(
            0,
            ConversationMessage {
                role: MessageRole::Assistant,
                content: assistant_content,
                thinking: outcome.thinking.clone(),
                tool_calls: outcome
                    .tool_calls
                    .iter()
                    .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
                    .collect(),
                timestamp,
            },
        );
        self.prune_and_save(&mut history);
    }

    fn prune_and_save(&self, history: &mut Vec<ConversationMessage>) {
        let max = self.config().max_history_turns * 2;
        if history.len() > max {
            history.truncate(max);
        }
        let state = json!({"items": history, "version": 1});
        match serde_json::to_string_pretty(&state) {
            Ok(text) => {
                let tmp = self.history_file.with_extension("json.tmp");
                let result = std::fs::write(&tmp, text)
                    .and_then(|_| std::fs::rename(&tmp, &self.history_file));
                if let Err(e) = result {
                    warn!(error = %e, "failed to persist assistant history");
                }
            }
            Err(e) => warn!(error = %e, "cannot serialize assistant history"),
        }
    }

    fn load_history(&self) {
        let Ok(text) = std::fs::read_to_string(&self.history_file) else {
            return;
        };
        let Ok(state) = serde_json::from_str::<Value>(&text) else {
            warn!("assistant history unreadable; starting fresh");
            return;
        };
        let Some(items) = state.get("items").and_then(|i| i.as_array()) else {
            return;
        };
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        *history = items
            .iter()
            .filter_map(|i| serde_json::from_value(i.clone()).ok())
            .collect();
    }

    pub fn history(&self) -> Vec<ConversationMessage> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn history_count(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear_history(&self) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.clear();
        self.prune_and_save(&mut history);
        info!("assistant history cleared");
    }

    // ── Endpoint probes ──────────────────────────────────────────────────

    pub async fn test_connection(&self) -> bool {
        let config = self.config();
        let url = format!("{}/api/tags", config.endpoint.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn available_models(&self) -> Vec<String> {
        let config = self.config();
        let url = format!("{}/api/tags", config.endpoint.trim_end_matches('/'));
        let Ok(response) = self.http.get(&url).send().await else {
            return Vec::new();
        };
        let Ok(body) = response.json::<Value>().await else {
            return Vec::new();
        };
        body["models"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m["name"].as_str().map(str::to_string))
            .collect()
    }

    /// Capabilities of a model via the endpoint's `/api/show`.
    pub async fn model_info(&self, model_name: Option<&str>) -> Value {
        let config = self.config();
        let model = model_name.unwrap_or(&config.model).to_string();
        let url = format!("{}/api/show", config.endpoint.trim_end_matches('/'));
        let response = self.http.post(&url).json(&json!({"model": model})).send().await;
        let Ok(response) = response else {
            return json!({"model": model, "error": "endpoint unreachable"});
        };
        let Ok(body) = response.json::<Value>().await else {
            return json!({"model": model, "error": "invalid response"});
        };

        let capabilities: Vec<String> = body["capabilities"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|c| c.as_str().map(str::to_string))
            .collect();
        let details = &body["details"];
        json!({
            "model": model,
            "capabilities": capabilities,
            "context_length": body["model_info"]
                .as_object()
                .and_then(|info| {
                    info.iter()
                        .find(|(k, _)| k.ends_with(".context_length"))
                        .and_then(|(_, v)| v.as_i64())
                })
                .unwrap_or(0),
            "family": details["family"].as_str().unwrap_or(""),
            "parameter_size": details["parameter_size"].as_str().unwrap_or(""),
            "has_vision": capabilities.iter().any(|c| c == "vision"),
        })
    }

    // ── Runtime settings ─────────────────────────────────────────────────

    /// Status without the API key.
    pub fn status(&self) -> Value {
        let config = self.config();
        json!({
            "enabled": config.enabled,
            "endpoint": config.endpoint,
            "model": config.model,
            "has_api_key": !config.api_key.is_empty(),
            "history_count": self.history_count(),
        })
    }

    /// Settings for the UI; the API key is masked.
    pub fn settings(&self) -> Value {
        let config = self.config();
        json!({
            "enabled": config.enabled,
            "endpoint": config.endpoint,
            "api_key": if config.api_key.is_empty() { "" } else { "********" },
            "model": config.model,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "timeout_seconds": config.timeout_seconds,
            "system_prompt": config.system_prompt,
            "max_history_turns": config.max_history_turns,
            "proactive_suggestions": config.proactive_suggestions,
        })
    }

    /// Apply a partial settings update and persist it to the config file.
    pub fn update_settings(&self, update: &Value) -> bool {
        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            if let Some(v) = update["enabled"].as_bool() {
                config.enabled = v;
            }
            if let Some(v) = update["endpoint"].as_str() {
                config.endpoint = v.to_string();
            }
            if let Some(v) = update["api_key"].as_str() {
                // The masked placeholder coming back means "unchanged".
                if v != "********" {
                    config.api_key = v.to_string();
                }
            }
            if let Some(v) = update["model"].as_str() {
                config.model = v.to_string();
            }
            if let Some(v) = update["temperature"].as_f64() {
                config.temperature = v as f32;
            }
            if let Some(v) = update["max_tokens"].as_u64() {
                config.max_tokens = v as u32;
            }
            if let Some(v) = update["timeout_seconds"].as_u64() {
                config.timeout_seconds = v;
            }
            if let Some(v) = update["system_prompt"].as_str() {
                config.system_prompt = v.to_string();
            }
            if let Some(v) = update["max_history_turns"].as_u64() {
                config.max_history_turns = v as usize;
            }
            if let Some(v) = update["proactive_suggestions"].as_bool() {
                config.proactive_suggestions = v;
            }
        }
        self.save_to_config_file()
    }

    fn save_to_config_file(&self) -> bool {
        let Some(path) = &self.config_file else {
            return true;
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            warn!(path = %path.display(), "config file unreadable; settings not persisted");
            return false;
        };
        let Ok(mut root) = serde_json::from_str::<Value>(&text) else {
            return false;
        };
        let config = self.config();
        root["assistant"] = serde_json::to_value(&config).unwrap_or(Value::Null);
        match serde_json::to_string_pretty(&root) {
            Ok(out) => std::fs::write(path, out).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::ArchitectureCatalog;
    use crate::config::{PathsConfig, RecycleBinConfig};
    use crate::events::EventBus;
    use crate::lifecycle::ModelLifecycle;
    use crate::queue::JobStore;
    use crate::registry::ModelRegistry;
    use sdhost_engine::software::SoftwareEngine;

    fn client(dir: &Path, enabled: bool) -> AssistantClient {
        let registry = Arc::new(ModelRegistry::new(PathsConfig::default()));
        let bus = Arc::new(EventBus::new(16));
        let lifecycle = Arc::new(ModelLifecycle::new(
            Arc::clone(&registry),
            Arc::new(SoftwareEngine::new()),
            Arc::clone(&bus),
        ));
        let store = Arc::new(JobStore::new(
            Arc::clone(&lifecycle),
            bus,
            dir.join("queue_state.json"),
            RecycleBinConfig::default(),
        ));
        let catalog = Arc::new(ArchitectureCatalog::new(dir));
        let tools = Arc::new(ToolExecutor::new(lifecycle, store, registry, catalog));
        AssistantClient::new(
            AssistantConfig {
                enabled,
                max_history_turns: 2,
                ..AssistantConfig::default()
            },
            dir,
            None,
            tools,
        )
    }

    #[tokio::test]
    async fn disabled_assistant_refuses_chat() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), false);
        let out = c.chat("hi", &Value::Null).await;
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("Assistant is disabled"));
    }

    #[test]
    fn backend_tools_are_intercepted_and_frontend_actions_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), true);

        let text = "Checking.\n```json:action\n{\"actions\": [\
            {\"type\": \"get_status\", \"parameters\": {}},\
            {\"type\": \"navigate\", \"parameters\": {\"view\": \"queue\"}}\
        ]}\n```";
        let out = c.normalize(&json!({}), text);

        assert!(out.success);
        assert_eq!(out.message, "Checking.");
        // get_status was executed here; navigate goes to the UI.
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.actions[0].action_type, "navigate");
        assert_eq!(out.tool_calls.len(), 2);
        let status_call = &out.tool_calls[0];
        assert!(status_call.executed_on_backend);
        assert_eq!(status_call.result["model_info"]["model_loaded"], false);
        assert!(!out.tool_calls[1].executed_on_backend);
    }

    #[test]
    fn native_and_fenced_payloads_normalize_identically() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), true);

        let native = c.normalize(
            &json!({"tool_calls": [{"function": {"name": "navigate", "arguments": {"view": "models"}}}]}),
            "Take a look.",
        );
        let fenced = c.normalize(
            &json!({}),
            "Take a look.\n```json:action\n{\"actions\": [{\"type\": \"navigate\", \"parameters\": {\"view\": \"models\"}}]}\n```",
        );
        assert_eq!(native.actions, fenced.actions);
        assert_eq!(native.message, fenced.message);
    }

    #[test]
    fn history_is_pruned_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), true);
        for i in 0..6 {
            c.push_history(
                &format!("message {i}"),
                &AssistantResponse {
                    success: true,
                    message: format!("reply {i}"),
                    ..AssistantResponse::default()
                },
            );
        }
        // max_history_turns = 2 -> at most 4 stored messages.
        assert_eq!(c.history_count(), 4);
        // Newest first.
        assert_eq!(c.history()[0].content, "reply 5");

        let reloaded = client(dir.path(), true);
        assert_eq!(reloaded.history_count(), 4);

        c.clear_history();
        assert_eq!(c.history_count(), 0);
        assert_eq!(client(dir.path(), true).history_count(), 0);
    }

    #[test]
    fn messages_start_with_system_prompt_and_end_with_user() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), true);
        c.push_history(
            "earlier question",
            &AssistantResponse {
                success: true,
                message: "earlier answer".into(),
                ..AssistantResponse::default()
            },
        );

        let config = c.config();
        let messages = c.build_messages("now", &json!({"view": "generate"}), &config);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("get_status"));
        assert!(messages[1]["content"]
            .as_str()
            .unwrap()
            .starts_with("Current application context:"));
        // Chronological replay: user question before assistant answer.
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "earlier question");
        assert_eq!(messages[3]["role"], "assistant");
        assert_eq!(messages.last().unwrap()["content"], "now");
    }

    #[test]
    fn settings_mask_the_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path(), true);
        c.update_settings(&json!({"api_key": "sk-secret"}));
        assert_eq!(c.settings()["api_key"], "********");
        assert_eq!(c.status()["has_api_key"], true);

        // The mask round-tripping back does not clobber the real key.
        c.update_settings(&json!({"api_key": "********", "model": "qwen3"}));
        assert_eq!(c.config().api_key, "sk-secret");
        assert_eq!(c.config().model, "qwen3");
    }
}
