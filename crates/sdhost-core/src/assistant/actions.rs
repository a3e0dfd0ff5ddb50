//! Tool-call extraction.
//!
//! The remote LLM may answer with native `tool_calls` or, for models
//! without tool support, with fenced ```` ```json:action ```` blocks in the
//! text. Both forms normalize to the same action stream; the fenced blocks
//! are stripped from the visible message.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One action requested by the assistant, e.g. `set_setting` or
/// `load_model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A tool call recorded for the response payload, including the result
/// when it was executed server-side.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub parameters: Value,
    pub result: Value,
    pub executed_on_backend: bool,
}

fn action_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Two or three backticks, tag case-insensitive, body up to the closing
    // fence.
    RE.get_or_init(|| {
        Regex::new(r"(?i)`{2,3}\s*json:action\s*\n([\s\S]*?)\s*`{2,3}")
            .expect("valid action-block pattern")
    })
}

/// Native path: `message.tool_calls[].function.{name, arguments}`.
/// Arguments may arrive as a JSON object or as a JSON-encoded string.
pub fn extract_tool_calls(message: &Value) -> Vec<AssistantAction> {
    let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    let mut actions = Vec::new();
    for call in calls {
        let function = &call["function"];
        let Some(name) = function["name"].as_str() else {
            continue;
        };
        let parameters = match &function["arguments"] {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| {
                warn!(tool = name, "tool arguments are not valid JSON");
                Value::Object(Default::default())
            }),
            Value::Object(o) => Value::Object(o.clone()),
            _ => Value::Object(Default::default()),
        };
        actions.push(AssistantAction {
            action_type: name.to_string(),
            parameters,
        });
    }
    actions
}

/// Fallback path: scan the text for fenced `json:action` blocks, each
/// holding `{"actions": [{type, parameters}, ...]}`.
pub fn extract_fenced_actions(text: &str) -> Vec<AssistantAction> {
    let mut actions = Vec::new();
    for captures in action_block_regex().captures_iter(text) {
        let body = captures[1].trim();
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparsable json:action block ignored");
                continue;
            }
        };
        let Some(list) = parsed.get("actions").and_then(|a| a.as_array()) else {
            warn!("json:action block without an 'actions' array ignored");
            continue;
        };
        for item in list {
            match serde_json::from_value::<AssistantAction>(item.clone()) {
                Ok(action) => actions.push(action),
                Err(e) => warn!(error = %e, "malformed action entry ignored"),
            }
        }
    }
    actions
}

/// Remove every fenced action block, leaving only the prose.
pub fn strip_action_blocks(text: &str) -> String {
    action_block_regex().replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_tool_calls_with_string_and_object_arguments() {
        let message = json!({
            "tool_calls": [
                {"function": {"name": "get_status", "arguments": {}}},
                {"function": {"name": "search_jobs", "arguments": "{\"prompt\": \"cat\"}"}},
            ]
        });
        let actions = extract_tool_calls(&message);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, "get_status");
        assert_eq!(actions[1].parameters["prompt"], "cat");
    }

    #[test]
    fn fenced_blocks_parse_with_two_or_three_backticks() {
        let three = "Sure.\n```json:action\n{\"actions\": [{\"type\": \"navigate\", \"parameters\": {\"view\": \"queue\"}}]}\n```";
        let two = "Sure.\n``JSON:ACTION\n{\"actions\": [{\"type\": \"navigate\", \"parameters\": {\"view\": \"queue\"}}]}\n``";
        for text in [three, two] {
            let actions = extract_fenced_actions(text);
            assert_eq!(actions.len(), 1, "in {text:?}");
            assert_eq!(actions[0].action_type, "navigate");
            assert_eq!(actions[0].parameters["view"], "queue");
        }
    }

    #[test]
    fn stripping_leaves_prose_only() {
        let text = "Before\n```json:action\n{\"actions\": []}\n```\nAfter";
        assert_eq!(strip_action_blocks(text), "Before\n\nAfter");
    }

    #[test]
    fn malformed_blocks_are_ignored() {
        let text = "```json:action\nnot json\n```";
        assert!(extract_fenced_actions(text).is_empty());
        let text = "```json:action\n{\"no_actions\": true}\n```";
        assert!(extract_fenced_actions(text).is_empty());
    }

    // Normalization law: the two encodings of the same call yield the same
    // action stream.
    #[test]
    fn native_and_fenced_forms_are_equivalent() {
        let native = extract_tool_calls(&json!({
            "tool_calls": [{"function": {"name": "search_jobs", "arguments": {"prompt": "cat", "limit": 5}}}]
        }));
        let fenced = extract_fenced_actions(
            "``json:action\n{\"actions\": [{\"type\": \"search_jobs\", \"parameters\": {\"prompt\": \"cat\", \"limit\": 5}}]}\n``",
        );
        assert_eq!(native, fenced);
    }
}
