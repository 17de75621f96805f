use super::{choice_bodies, parse_data_line};
use serde_json::{Map, Value};

/// Blanks SSE lines that only echo back an empty `user` turn. Returns the
/// number of dropped lines.
pub fn filter_user_echo_lines(lines: &mut [String]) -> usize {
    let mut dropped = 0;
    for line in lines.iter_mut() {
        let Some(payload) = parse_data_line(line) else {
            continue;
        };
        if is_user_echo(&payload) {
            line.clear();
            dropped += 1;
        }
    }
    dropped
}

pub fn is_user_echo(payload: &Value) -> bool {
    choice_bodies(payload).any(is_empty_user_body)
}

fn is_empty_user_body(body: &Map<String, Value>) -> bool {
    if body.get("role").and_then(|v| v.as_str()) != Some("user") {
        return false;
    }
    let has_tool_calls = body
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .is_some_and(|calls| !calls.is_empty());
    !has_tool_calls && is_blank(body.get("content")) && is_blank(body.get("reasoning_content"))
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}
