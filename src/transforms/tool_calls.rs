use super::tool_text::{balanced_object_end, has_tool_markers, parse_tool_calls_from_content};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static NAME_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""name"\s*:\s*"([^"]+)""#).expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(index: u32, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            index,
            id: new_call_id(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// `call_` followed by nine hex characters.
pub fn new_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..9])
}

/// Everything one streamed response has said so far that matters for tool
/// calls. Lives exactly as long as the stream.
#[derive(Debug, Default, Clone)]
pub struct ToolCallBuffer {
    /// Raw assistant text (content and reasoning), append-only.
    pub content: String,
    pub tool_args: String,
    pub tool_name: String,
    pub has_malformed_tool_calls: bool,
    /// Upstream sent a structured call with a real name, or closed its tool
    /// calls itself (`finish_reason: "tool_calls"`).
    pub tool_calls_found: bool,
}

impl ToolCallBuffer {
    pub fn observe_finish_reason(&mut self, payload: &Value) {
        let closed = payload
            .get("choices")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .any(|choice| choice.get("finish_reason").and_then(|v| v.as_str()) == Some("tool_calls"));
        if closed {
            self.tool_calls_found = true;
        }
    }

    /// Tool calls to emit in a synthetic closing chunk, if upstream never
    /// closed any itself.
    pub fn finalize(&self) -> Option<Vec<ToolCall>> {
        if self.tool_calls_found {
            return None;
        }
        let args = self.tool_args.trim();
        let name = self.tool_name.trim();
        if !args.is_empty() && !name.is_empty() && balanced_object_end(args) == Some(args.len()) {
            return Some(vec![ToolCall::new(0, name, args)]);
        }
        if has_tool_markers(&self.content) {
            let calls = parse_tool_calls_from_content(&self.content);
            if !calls.is_empty() {
                return Some(calls);
            }
        }
        None
    }

    fn absorb_text(&mut self, body: &Map<String, Value>) {
        for key in ["content", "reasoning_content"] {
            if let Some(text) = body.get(key).and_then(|v| v.as_str()) {
                self.content.push_str(text);
            }
        }
    }

    fn recover_name(&self) -> Option<String> {
        NAME_FIELD
            .captures(&self.content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Appends each body's text to the buffer, then fills blank tool-call names
/// from a `"name": "..."` fragment found in the buffered text.
pub fn fix_malformed(payload: &mut Value, buffer: &mut ToolCallBuffer) -> bool {
    super::for_each_choice_body(payload, |body| {
        buffer.absorb_text(body);
        let Some(calls) = body.get_mut("tool_calls").and_then(|v| v.as_array_mut()) else {
            return false;
        };
        let mut changed = false;
        for call in calls.iter_mut() {
            let Some(function) = call.get_mut("function").and_then(|v| v.as_object_mut()) else {
                continue;
            };
            let name = function.get("name").and_then(|v| v.as_str());
            let blank = name.is_some_and(|s| s.trim().is_empty());
            if name.is_some_and(|s| !s.trim().is_empty()) {
                buffer.tool_calls_found = true;
            }
            if blank {
                buffer.has_malformed_tool_calls = true;
                if let Some(name) = buffer.recover_name() {
                    tracing::debug!(tool = %name, "repaired tool call with empty name");
                    function.insert("name".to_string(), Value::String(name));
                    changed = true;
                }
            }
            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                if !name.trim().is_empty() {
                    buffer.tool_name = name.to_string();
                }
            }
            if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                buffer.tool_args.push_str(args);
            }
        }
        changed
    })
}

/// Non-streaming variant: turns inline tool-call text in a message into
/// structured `tool_calls`.
pub fn extract_inline_tool_calls(body: &mut Value) -> bool {
    let Some(choices) = body.get_mut("choices").and_then(|v| v.as_array_mut()) else {
        return false;
    };
    let mut changed = false;
    for choice in choices.iter_mut() {
        let Some(choice) = choice.as_object_mut() else {
            continue;
        };
        let Some(message) = choice.get_mut("message").and_then(|v| v.as_object_mut()) else {
            continue;
        };
        let has_structured = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .is_some_and(|calls| !calls.is_empty());
        if has_structured {
            continue;
        }
        let Some(content) = message.get("content").and_then(|v| v.as_str()) else {
            continue;
        };
        if !has_tool_markers(content) {
            continue;
        }
        let calls = parse_tool_calls_from_content(content);
        if calls.is_empty() {
            continue;
        }
        let Ok(encoded) = serde_json::to_value(&calls) else {
            continue;
        };
        message.insert("tool_calls".to_string(), encoded);
        message.insert("content".to_string(), Value::Null);
        choice.insert(
            "finish_reason".to_string(),
            Value::String("tool_calls".to_string()),
        );
        changed = true;
    }
    changed
}
