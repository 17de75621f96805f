use crate::usage::StreamUsage;
use serde_json::{Map, Value};

pub mod reasoning_field;
pub mod think_xml_to_reasoning;
pub mod tool_calls;
pub mod tool_text;
pub mod user_echo;
pub mod utf8_repair;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Returns the JSON payload of a `data: ` line. Non-data lines, the `[DONE]`
/// sentinel and payloads that fail to parse all yield `None`.
pub fn parse_data_line(line: &str) -> Option<Value> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim_end_matches('\r');
    if payload.trim() == DONE_PAYLOAD {
        return None;
    }
    serde_json::from_str(payload).ok()
}

pub fn is_done_line(line: &str) -> bool {
    line.strip_prefix(DATA_PREFIX)
        .map(|payload| payload.trim() == DONE_PAYLOAD)
        .unwrap_or(false)
}

pub fn format_data_line(payload: &Value) -> String {
    format!("{DATA_PREFIX}{payload}")
}

/// Runs `f` over every parseable data payload. Lines for which `f` reports a
/// change are re-serialized; every other line is left byte-identical.
pub fn rewrite_data_lines(lines: &mut [String], mut f: impl FnMut(&mut Value) -> bool) {
    for line in lines.iter_mut() {
        let Some(mut payload) = parse_data_line(line) else {
            continue;
        };
        if f(&mut payload) {
            *line = format_data_line(&payload);
        }
    }
}

/// Visits the `delta` and `message` objects of every choice.
pub fn for_each_choice_body(
    payload: &mut Value,
    mut f: impl FnMut(&mut Map<String, Value>) -> bool,
) -> bool {
    let Some(choices) = payload.get_mut("choices").and_then(|v| v.as_array_mut()) else {
        return false;
    };
    let mut changed = false;
    for choice in choices {
        for key in ["delta", "message"] {
            if let Some(body) = choice.get_mut(key).and_then(|v| v.as_object_mut()) {
                changed |= f(body);
            }
        }
    }
    changed
}

pub fn choice_bodies(payload: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    payload
        .get("choices")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .flat_map(|choice| {
            ["delta", "message"]
                .into_iter()
                .filter_map(move |key| choice.get(key).and_then(|v| v.as_object()))
        })
}

/// One-shot fixups for a buffered (non-streaming) chat completion body.
/// Returns the usage the body reports, if any.
pub fn apply_completion_fixups(body: &mut Value) -> Option<StreamUsage> {
    for_each_choice_body(body, reasoning_field::fold_reasoning_field);
    let mut think = think_xml_to_reasoning::ThinkState::default();
    think_xml_to_reasoning::extract_think(body, &mut think);
    let mut buffer = tool_calls::ToolCallBuffer::default();
    tool_calls::fix_malformed(body, &mut buffer);
    tool_calls::extract_inline_tool_calls(body);
    StreamUsage::from_payload(body)
}
