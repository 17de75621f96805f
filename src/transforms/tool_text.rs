//! Extraction of tool calls that a model wrote as plain text instead of
//! structured `tool_calls` deltas.
//!
//! Each dialect is a [`TextToolParser`]. [`parse_tool_calls_from_content`]
//! walks [`PARSERS`] in priority order and the first parser yielding at least
//! one call wins; new dialects are appended to the list.

use super::tool_calls::ToolCall;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Name and JSON-encoded arguments of one call recovered from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: String,
}

pub trait TextToolParser: Send + Sync {
    fn dialect(&self) -> &'static str;

    /// Cheap check whether `text` looks like this dialect.
    fn has_markers(&self, text: &str) -> bool;

    fn parse(&self, text: &str) -> Vec<ParsedCall>;
}

pub static PARSERS: [&dyn TextToolParser; 4] = [
    &McpXmlParser,
    &ClosingTagJsonParser,
    &TaggedJsonParser,
    &BareJsonParser,
];

pub fn has_tool_markers(text: &str) -> bool {
    PARSERS.iter().any(|parser| parser.has_markers(text))
}

pub fn parse_tool_calls_from_content(text: &str) -> Vec<ToolCall> {
    for parser in PARSERS.iter() {
        if !parser.has_markers(text) {
            continue;
        }
        let parsed = parser.parse(text);
        if parsed.is_empty() {
            continue;
        }
        tracing::debug!(
            dialect = parser.dialect(),
            calls = parsed.len(),
            "extracted tool calls from text"
        );
        return parsed
            .into_iter()
            .enumerate()
            .map(|(index, call)| ToolCall::new(index as u32, call.name, call.arguments))
            .collect();
    }
    Vec::new()
}

static MCP_XML: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<use_mcp_tool>\s*<server_name>(.*?)</server_name>\s*<tool_name>(.*?)</tool_name>\s*<arguments>(.*?)</arguments>\s*</use_mcp_tool>",
    )
    .expect("valid regex")
});
static CLOSING_TAG_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)(\{\s*"name"\s*:\s*"[^"]*"\s*,\s*"arguments"\s*:\s*\{.*?\}\s*\})\s*</tool_call>"#)
        .expect("valid regex")
});
static TAGGED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid regex"));
static BARE_JSON_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"name"\s*:"#).expect("valid regex"));
static BARE_JSON_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\s*"name"\s*:\s*"[^"]+"\s*,\s*"arguments"\s*:"#).expect("valid regex")
});

/// `<use_mcp_tool><server_name>..</server_name><tool_name>..</tool_name><arguments>{..}</arguments></use_mcp_tool>`
pub struct McpXmlParser;

impl TextToolParser for McpXmlParser {
    fn dialect(&self) -> &'static str {
        "use_mcp_tool"
    }

    fn has_markers(&self, text: &str) -> bool {
        text.contains("<use_mcp_tool>")
    }

    fn parse(&self, text: &str) -> Vec<ParsedCall> {
        MCP_XML
            .captures_iter(text)
            .filter_map(|caps| {
                let name = caps.get(2)?.as_str().trim();
                if name.is_empty() {
                    return None;
                }
                let raw = caps.get(3)?.as_str().trim();
                let arguments = match serde_json::from_str::<Value>(raw) {
                    Ok(value) => value.to_string(),
                    Err(_) => raw.to_string(),
                };
                Some(ParsedCall {
                    name: name.to_string(),
                    arguments,
                })
            })
            .collect()
    }
}

/// `{"name": .., "arguments": {..}}</tool_call>`, emitted by models that drop
/// the opening tag.
pub struct ClosingTagJsonParser;

impl TextToolParser for ClosingTagJsonParser {
    fn dialect(&self) -> &'static str {
        "json_closing_tag"
    }

    fn has_markers(&self, text: &str) -> bool {
        text.contains("</tool_call>")
    }

    fn parse(&self, text: &str) -> Vec<ParsedCall> {
        CLOSING_TAG_JSON
            .captures_iter(text)
            .filter_map(|caps| call_from_json(caps.get(1)?.as_str()))
            .collect()
    }
}

/// `<tool_call>{json}</tool_call>`
pub struct TaggedJsonParser;

impl TextToolParser for TaggedJsonParser {
    fn dialect(&self) -> &'static str {
        "tool_call_tag"
    }

    fn has_markers(&self, text: &str) -> bool {
        text.contains("<tool_call>")
    }

    fn parse(&self, text: &str) -> Vec<ParsedCall> {
        TAGGED_JSON
            .captures_iter(text)
            .filter_map(|caps| call_from_json(caps.get(1)?.as_str()))
            .collect()
    }
}

/// A bare `{"name": .., "arguments": ..}` object anywhere in the text.
pub struct BareJsonParser;

impl TextToolParser for BareJsonParser {
    fn dialect(&self) -> &'static str {
        "bare_json"
    }

    fn has_markers(&self, text: &str) -> bool {
        BARE_JSON_MARKER.is_match(text)
    }

    fn parse(&self, text: &str) -> Vec<ParsedCall> {
        let mut calls = Vec::new();
        let mut cursor = 0;
        while let Some(found) = BARE_JSON_START.find_at(text, cursor) {
            let start = found.start();
            match balanced_object_end(&text[start..]) {
                Some(len) => {
                    if let Some(call) = call_from_json(&text[start..start + len]) {
                        calls.push(call);
                    }
                    cursor = start + len;
                }
                None => break,
            }
        }
        calls
    }
}

fn call_from_json(raw: &str) -> Option<ParsedCall> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let name = value.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = match value.get("arguments").or_else(|| value.get("parameters")) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ParsedCall {
        name: name.to_string(),
        arguments,
    })
}

/// Byte length of the balanced `{..}` object at the start of `text`,
/// honoring JSON string escapes.
pub fn balanced_object_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, &byte) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match byte {
                b'\\' => escape_next = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
