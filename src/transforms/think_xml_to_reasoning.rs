use serde_json::{Map, Value};

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// Whether the stream is currently inside a `<think>` block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThinkState {
    pub in_thinking: bool,
}

/// Moves `<think>` spans out of `content` into `reasoning_content` for every
/// choice body carrying string content. Only the first tag pair of a body is
/// handled per call.
pub fn extract_think(payload: &mut Value, state: &mut ThinkState) -> bool {
    super::for_each_choice_body(payload, |body| extract_from_body(body, state))
}

fn extract_from_body(body: &mut Map<String, Value>, state: &mut ThinkState) -> bool {
    let Some(content) = body.get("content").and_then(|v| v.as_str()) else {
        return false;
    };
    let content = content.to_string();
    let has_open = content.contains(OPEN);
    let has_close = content.contains(CLOSE);

    if body.contains_key("reasoning_content") {
        if !has_open && !has_close {
            return false;
        }
        let stripped = content.replace(OPEN, "").replace(CLOSE, "");
        body.insert(
            "content".to_string(),
            Value::String(stripped.trim().to_string()),
        );
        return true;
    }

    if has_close && !has_open && !state.in_thinking {
        let (reasoning, rest) = split_once(&content, CLOSE);
        set_reasoning(body, reasoning);
        set_content(body, rest);
        return true;
    }

    if let Some(open_at) = content.find(OPEN) {
        let prefix = &content[..open_at];
        let remainder = &content[open_at + OPEN.len()..];
        state.in_thinking = true;
        if let Some(close_at) = remainder.find(CLOSE) {
            let reasoning = &remainder[..close_at];
            let after = &remainder[close_at + CLOSE.len()..];
            set_reasoning(body, reasoning);
            set_content(body, &format!("{prefix}{after}"));
            state.in_thinking = false;
        } else {
            set_reasoning(body, remainder);
            set_content(body, prefix);
        }
        return true;
    }

    if state.in_thinking {
        if has_close {
            let (reasoning, rest) = split_once(&content, CLOSE);
            set_reasoning(body, reasoning);
            set_content(body, rest);
            state.in_thinking = false;
        } else {
            set_reasoning(body, &content);
            body.insert("content".to_string(), Value::Null);
        }
        return true;
    }

    false
}

fn split_once<'a>(text: &'a str, tag: &str) -> (&'a str, &'a str) {
    text.split_once(tag).unwrap_or((text, ""))
}

fn set_reasoning(body: &mut Map<String, Value>, reasoning: &str) {
    body.insert(
        "reasoning_content".to_string(),
        Value::String(reasoning.to_string()),
    );
}

fn set_content(body: &mut Map<String, Value>, content: &str) {
    let trimmed = content.trim();
    let value = if trimmed.is_empty() {
        Value::Null
    } else {
        Value::String(trimmed.to_string())
    };
    body.insert("content".to_string(), value);
}
