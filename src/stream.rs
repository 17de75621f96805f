use crate::transforms::{
    self, format_data_line, is_done_line, parse_data_line, reasoning_field,
    think_xml_to_reasoning::{ThinkState, extract_think},
    tool_calls::{ToolCallBuffer, fix_malformed},
    user_echo::filter_user_echo_lines,
    utf8_repair::{REPLACEMENT, Utf8State},
};
use crate::usage::StreamUsage;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CHANNEL_CAPACITY: usize = 64;

/// Byte-to-text decoder that holds an incomplete multi-byte sequence until
/// the rest of it arrives.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    tail: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.tail.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.tail.len());
        let mut rest: &[u8] = &self.tail;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.tail = rest.to_vec();
        out
    }

    /// Whatever is still held, decoded lossily.
    pub fn flush(&mut self) -> String {
        let tail = std::mem::take(&mut self.tail);
        String::from_utf8_lossy(&tail).into_owned()
    }
}

#[derive(Debug, Default, Clone)]
struct Envelope {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
}

impl Envelope {
    fn observe(&mut self, payload: &Value) {
        if let Some(id) = payload.get("id").and_then(|v| v.as_str()) {
            self.id = Some(id.to_string());
        }
        if let Some(model) = payload.get("model").and_then(|v| v.as_str()) {
            self.model = Some(model.to_string());
        }
        if let Some(created) = payload.get("created").and_then(|v| v.as_i64()) {
            self.created = Some(created);
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": self.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            "model": self.model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

type UsageCallback = Box<dyn FnMut(StreamUsage) + Send>;

/// Per-connection rewriter for an OpenAI chat-completion SSE stream.
///
/// Bytes go in through [`push`](Self::push) in arrival order; each call
/// returns whatever is ready to forward. Complete lines are run through the
/// echo filter, the reasoning-field fold, think-tag extraction, tool-call
/// repair and UTF-8 repair, in that order. Synthetic closing chunks are
/// inserted in front of `data: [DONE]`, or emitted by
/// [`finish`](Self::finish) when the upstream ends without one.
pub struct SseTransducer {
    decoder: Utf8StreamDecoder,
    partial_line: String,
    think: ThinkState,
    utf8: Utf8State,
    tools: ToolCallBuffer,
    envelope: Envelope,
    usage_tracked: bool,
    on_usage: Option<UsageCallback>,
    hide_usage_chunks: bool,
    finalized: bool,
}

impl Default for SseTransducer {
    fn default() -> Self {
        Self::new()
    }
}

impl SseTransducer {
    pub fn new() -> Self {
        Self {
            decoder: Utf8StreamDecoder::default(),
            partial_line: String::new(),
            think: ThinkState::default(),
            utf8: Utf8State::default(),
            tools: ToolCallBuffer::default(),
            envelope: Envelope::default(),
            usage_tracked: false,
            on_usage: None,
            hide_usage_chunks: false,
            finalized: false,
        }
    }

    /// Called once, with the first non-zero `usage` object of the stream.
    pub fn on_usage(mut self, callback: impl FnMut(StreamUsage) + Send + 'static) -> Self {
        self.on_usage = Some(Box::new(callback));
        self
    }

    /// Blanks usage-only events (`"choices": []`) after accounting for them,
    /// for clients that never asked for usage.
    pub fn hide_usage_chunks(mut self, hide: bool) -> Self {
        self.hide_usage_chunks = hide;
        self
    }

    pub fn usage_reported(&self) -> bool {
        self.usage_tracked
    }

    /// Assistant text (content and reasoning) seen so far.
    pub fn completion_text(&self) -> &str {
        &self.tools.content
    }

    pub fn push(&mut self, bytes: &[u8]) -> Bytes {
        let decoded = self.decoder.decode(bytes);
        self.partial_line.push_str(&decoded);
        let Some(last_newline) = self.partial_line.rfind('\n') else {
            return Bytes::new();
        };
        let rest = self.partial_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial_line, rest);
        Bytes::from(self.process(&complete))
    }

    /// Flushes held text and, if no `[DONE]` line did so already, appends the
    /// synthetic closing chunks.
    pub fn finish(&mut self) -> Bytes {
        let mut out = String::new();
        let decoded = self.decoder.flush();
        self.partial_line.push_str(&decoded);
        let held = std::mem::take(&mut self.partial_line);
        if !held.is_empty() {
            out.push_str(&self.process(&format!("{held}\n")));
        }
        if !self.finalized {
            let lines = self.finalize_lines();
            if !lines.is_empty() {
                out.push_str(&lines.join("\n"));
                out.push('\n');
            }
        }
        Bytes::from(out)
    }

    fn process(&mut self, chunk: &str) -> String {
        let body = chunk.strip_suffix('\n').unwrap_or(chunk);
        let mut lines: Vec<String> = body.split('\n').map(str::to_string).collect();

        if chunk.contains("\"user\"") {
            let dropped = filter_user_echo_lines(&mut lines);
            if dropped > 0 {
                tracing::debug!(dropped, "dropped user echo lines");
            }
        }

        if chunk.contains("\"reasoning\"") {
            transforms::rewrite_data_lines(&mut lines, |payload| {
                transforms::for_each_choice_body(payload, reasoning_field::fold_reasoning_field)
            });
        }

        if self.think.in_thinking || chunk.contains("<think>") || chunk.contains("</think>") {
            let think = &mut self.think;
            transforms::rewrite_data_lines(&mut lines, |payload| extract_think(payload, think));
        }

        // Runs on every chunk: the buffer has to see all assistant text.
        let tools = &mut self.tools;
        transforms::rewrite_data_lines(&mut lines, |payload| fix_malformed(payload, tools));

        if !self.utf8.is_idle() || has_replacement(chunk) {
            let utf8 = &mut self.utf8;
            transforms::rewrite_data_lines(&mut lines, |payload| utf8.repair_payload(payload));
        }

        let mut done_at = None;
        for (idx, line) in lines.iter_mut().enumerate() {
            if is_done_line(line) {
                if done_at.is_none() {
                    done_at = Some(idx);
                }
                continue;
            }
            let Some(payload) = parse_data_line(line) else {
                continue;
            };
            self.observe(&payload);
            if self.hide_usage_chunks && is_usage_only(&payload) {
                line.clear();
            }
        }

        if let Some(idx) = done_at {
            if !self.finalized {
                let synthetic = self.finalize_lines();
                for (offset, line) in synthetic.into_iter().enumerate() {
                    lines.insert(idx + offset, line);
                }
            }
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    fn observe(&mut self, payload: &Value) {
        self.envelope.observe(payload);
        self.tools.observe_finish_reason(payload);
        if self.usage_tracked {
            return;
        }
        if let Some(usage) = StreamUsage::from_payload(payload) {
            self.usage_tracked = true;
            if let Some(callback) = self.on_usage.as_mut() {
                callback(usage);
            }
        }
    }

    /// Residue and synthetic tool-call chunks, each followed by the blank
    /// separator line. Runs at most once per stream.
    fn finalize_lines(&mut self) -> Vec<String> {
        self.finalized = true;
        let mut lines = Vec::new();

        let (content, reasoning) = self.utf8.take_residue();
        if content.is_some() || reasoning.is_some() {
            let mut delta = serde_json::Map::new();
            if let Some(reasoning) = reasoning {
                delta.insert("reasoning_content".to_string(), Value::String(reasoning));
            }
            if let Some(content) = content {
                delta.insert("content".to_string(), Value::String(content));
            }
            lines.push(format_data_line(&self.envelope.chunk(Value::Object(delta), None)));
            lines.push(String::new());
        }

        if let Some(calls) = self.tools.finalize() {
            tracing::info!(
                count = calls.len(),
                malformed = self.tools.has_malformed_tool_calls,
                "emitting synthetic tool call chunk"
            );
            let delta = json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": calls,
            });
            lines.push(format_data_line(
                &self.envelope.chunk(delta, Some("tool_calls")),
            ));
            lines.push(String::new());
        }
        lines
    }
}

fn is_usage_only(payload: &Value) -> bool {
    payload.get("usage").is_some_and(Value::is_object)
        && payload
            .get("choices")
            .and_then(|v| v.as_array())
            .is_some_and(|choices| choices.is_empty())
}

fn has_replacement(chunk: &str) -> bool {
    chunk.contains(REPLACEMENT) || chunk.contains("\\ufffd") || chunk.contains("\\uFFFD")
}

/// Pumps `upstream` through `transducer` on a spawned task and returns the
/// rewritten stream. Dropping the returned stream drops the upstream body,
/// and so does an upstream that stays silent for longer than `idle_timeout`.
/// `on_complete` runs once the upstream is finished or abandoned.
pub fn drive<S, E, F>(
    upstream: S,
    mut transducer: SseTransducer,
    idle_timeout: Duration,
    on_complete: F,
) -> ReceiverStream<Result<Bytes, Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send,
    F: FnOnce(&SseTransducer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let client_gone = pump(upstream, &mut transducer, idle_timeout, &tx).await;
        if client_gone {
            tracing::debug!("client disconnected, upstream stream dropped");
        } else {
            let tail = transducer.finish();
            if !tail.is_empty() {
                let _ = tx.send(Ok(tail)).await;
            }
        }
        on_complete(&transducer);
    });
    ReceiverStream::new(rx)
}

/// Returns `true` when the client went away before the upstream finished.
async fn pump<S, E>(
    upstream: S,
    transducer: &mut SseTransducer,
    idle_timeout: Duration,
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
) -> bool
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return true,
            next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
        };
        let Ok(next) = next else {
            tracing::warn!(
                idle_ms = idle_timeout.as_millis() as u64,
                "upstream stream went idle, closing"
            );
            return false;
        };
        match next {
            Some(Ok(bytes)) => {
                let out = transducer.push(&bytes);
                if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                    return true;
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "upstream stream read failed, closing");
                return false;
            }
            None => return false,
        }
    }
}
