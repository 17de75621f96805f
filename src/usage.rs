use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token usage reported by one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl StreamUsage {
    /// Reads a top-level `usage` object. All-zero usage counts as absent.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let usage = payload.get("usage")?.as_object()?;
        let read = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let parsed = Self {
            prompt_tokens: read("prompt_tokens"),
            completion_tokens: read("completion_tokens"),
        };
        (parsed.prompt_tokens > 0 || parsed.completion_tokens > 0).then_some(parsed)
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Lifetime counters fed by the proxy.
pub trait UsageSink: Send + Sync {
    fn add_prompt_tokens(&self, n: u64);
    fn add_completion_tokens(&self, n: u64);
    fn add_tokens(&self, n: u64);
    fn add_requests(&self, n: u64);
}

pub fn record_usage(sink: &dyn UsageSink, usage: StreamUsage) {
    sink.add_prompt_tokens(usage.prompt_tokens);
    sink.add_completion_tokens(usage.completion_tokens);
    sink.add_tokens(usage.total());
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

/// Process-wide totals, also exported as Prometheus counters.
#[derive(Debug, Default)]
pub struct LifetimeUsage {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    requests: AtomicU64,
}

impl LifetimeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

impl UsageSink for LifetimeUsage {
    fn add_prompt_tokens(&self, n: u64) {
        self.prompt_tokens.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("studio_prompt_tokens_total").increment(n);
    }

    fn add_completion_tokens(&self, n: u64) {
        self.completion_tokens.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("studio_completion_tokens_total").increment(n);
    }

    fn add_tokens(&self, n: u64) {
        self.total_tokens.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("studio_tokens_total").increment(n);
    }

    fn add_requests(&self, n: u64) {
        self.requests.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("studio_requests_total").increment(n);
    }
}

/// Counts prompt and completion tokens through the backend tokenizer when a
/// stream finished without reporting usage. Failures are swallowed.
pub async fn count_usage_fallback(
    http: reqwest::Client,
    tokenize_url: String,
    model: String,
    prompt: String,
    completion: String,
    sink: std::sync::Arc<dyn UsageSink>,
) {
    let prompt_tokens = crate::upstream::tokenize_count(&http, &tokenize_url, &model, &prompt).await;
    let completion_tokens =
        crate::upstream::tokenize_count(&http, &tokenize_url, &model, &completion).await;
    let usage = StreamUsage {
        prompt_tokens: prompt_tokens.unwrap_or_else(|err| {
            tracing::debug!(error = %err.message, "prompt token count unavailable");
            0
        }),
        completion_tokens: completion_tokens.unwrap_or_else(|err| {
            tracing::debug!(error = %err.message, "completion token count unavailable");
            0
        }),
    };
    if usage.total() > 0 {
        record_usage(sink.as_ref(), usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn zero_usage_is_ignored() {
        assert_eq!(
            StreamUsage::from_payload(&json!({"usage": {"prompt_tokens": 0, "completion_tokens": 0}})),
            None
        );
        assert_eq!(StreamUsage::from_payload(&json!({"usage": null})), None);
        assert_eq!(
            StreamUsage::from_payload(&json!({"usage": {"prompt_tokens": 3}})),
            Some(StreamUsage {
                prompt_tokens: 3,
                completion_tokens: 0
            })
        );
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let usage = Arc::new(LifetimeUsage::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let usage = usage.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        record_usage(
                            usage.as_ref(),
                            StreamUsage {
                                prompt_tokens: 2,
                                completion_tokens: 1,
                            },
                        );
                        usage.add_requests(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        let snapshot = usage.snapshot();
        assert_eq!(snapshot.prompt_tokens, 16_000);
        assert_eq!(snapshot.completion_tokens, 8_000);
        assert_eq!(snapshot.total_tokens, 24_000);
        assert_eq!(snapshot.requests, 8_000);
    }
}
