//! Healing of tokenizer byte-fallback corruption.
//!
//! Models whose tokenizer splits a multi-byte glyph across two tokens stream
//! stray U+FFFD characters, mostly around box-drawing characters and inside
//! inline code. Repair is streaming-safe: a chunk that still ends in U+FFFD
//! may be the first half of a split sequence, so it is held back whole until
//! the next chunk of the same field arrives.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

pub const REPLACEMENT: char = '\u{FFFD}';

static FFFD_BEFORE_BOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x{FFFD}+([\x{2500}-\x{259F}])").expect("valid regex"));
static FFFD_AFTER_BOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\x{2500}-\x{259F}])\x{FFFD}+").expect("valid regex"));
static FFFD_AFTER_BACKTICK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`\x{FFFD}+([`,)])").expect("valid regex"));
static FFFD_BEFORE_BACKTICK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x{FFFD}+`").expect("valid regex"));
static SPACED_FFFD_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" \x{FFFD}+ ").expect("valid regex"));
static SPACED_FFFD_BEFORE_MARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" \x{FFFD}+([\x{2500}-\x{259F},`])").expect("valid regex"));
static FFFD_AFTER_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([,.:;])\x{FFFD}+").expect("valid regex"));

pub fn is_box_drawing(ch: char) -> bool {
    ('\u{2500}'..='\u{259F}').contains(&ch)
}

/// Per-connection residue held back by [`clean`], one buffer per field.
#[derive(Debug, Default, Clone)]
pub struct Utf8State {
    pub pending_content: String,
    pub pending_reasoning: String,
}

impl Utf8State {
    pub fn is_idle(&self) -> bool {
        self.pending_content.is_empty() && self.pending_reasoning.is_empty()
    }

    /// Cleans `content` and `reasoning_content` of every choice body.
    pub fn repair_payload(&mut self, payload: &mut Value) -> bool {
        super::for_each_choice_body(payload, |body| {
            let content = repair_field(body, "content", &mut self.pending_content);
            let reasoning = repair_field(body, "reasoning_content", &mut self.pending_reasoning);
            content || reasoning
        })
    }

    /// Drains the residue of both fields, applying the final pattern pass.
    pub fn take_residue(&mut self) -> (Option<String>, Option<String>) {
        let drain = |pending: &mut String| {
            if pending.is_empty() {
                None
            } else {
                Some(clean_final(&std::mem::take(pending)))
            }
        };
        (
            drain(&mut self.pending_content),
            drain(&mut self.pending_reasoning),
        )
    }
}

fn repair_field(body: &mut Map<String, Value>, key: &str, pending: &mut String) -> bool {
    let Some(text) = body.get(key).and_then(|v| v.as_str()) else {
        return false;
    };
    let cleaned = clean(text, pending);
    if cleaned == text {
        return false;
    }
    body.insert(key.to_string(), Value::String(cleaned));
    true
}

/// Cleans one field's text, carrying an unterminated tail in `pending`.
pub fn clean(text: &str, pending: &mut String) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut joined = std::mem::take(pending);
    joined.push_str(text);

    drop_replacements_after_trailing_box(&mut joined);
    if joined.ends_with(REPLACEMENT) {
        *pending = joined;
        return String::new();
    }
    clean_final(&joined)
}

/// Fixed pattern removals plus the box-drawing heuristic, without any
/// carry-over. Also used when the stream ends with residue still pending.
pub fn clean_final(text: &str) -> String {
    if !text.contains(REPLACEMENT) {
        return text.to_string();
    }
    let mut out = FFFD_BEFORE_BOX.replace_all(text, "$1").into_owned();
    out = FFFD_AFTER_BOX.replace_all(&out, "$1").into_owned();
    out = FFFD_AFTER_BACKTICK.replace_all(&out, "`$1").into_owned();
    out = FFFD_BEFORE_BACKTICK.replace_all(&out, "`").into_owned();
    out = SPACED_FFFD_RUN.replace_all(&out, " ").into_owned();
    out = SPACED_FFFD_BEFORE_MARK.replace_all(&out, " $1").into_owned();
    out = FFFD_AFTER_PUNCT.replace_all(&out, "$1").into_owned();

    if out.contains(REPLACEMENT) && out.chars().any(is_box_drawing) {
        out.retain(|ch| ch != REPLACEMENT);
    }
    out
}

fn drop_replacements_after_trailing_box(text: &mut String) {
    let trimmed_len = text.trim_end_matches(REPLACEMENT).len();
    if trimmed_len == text.len() {
        return;
    }
    if text[..trimmed_len].chars().next_back().is_some_and(is_box_drawing) {
        text.truncate(trimmed_len);
    }
}
