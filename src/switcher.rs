use crate::process::{ProcessManager, log_path};
use crate::recipes::Recipe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const LOG_TAIL_READ: usize = 500;
const LOG_TAIL_KEEP: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct SwitchTimings {
    /// Pause between evicting the old model and launching the new one.
    pub settle: Duration,
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
}

impl Default for SwitchTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            deadline: Duration::from_secs(300),
            poll_interval: Duration::from_secs(3),
            health_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwitchError {
    #[error("failed to launch model {model}: {message}")]
    LaunchFailed { model: String, message: String },
    #[error("model {model} crashed during startup: {tail}")]
    Crashed { model: String, tail: String },
    #[error("model {model} did not become healthy within {secs}s")]
    Timeout { model: String, secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPhase {
    CheckingCurrent,
    Evicting,
    Launching,
    PollingHealth,
    Ready,
}

impl SwitchPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::CheckingCurrent => "checking_current",
            Self::Evicting => "evicting",
            Self::Launching => "launching",
            Self::PollingHealth => "polling_health",
            Self::Ready => "ready",
        }
    }
}

/// Makes sure the inference backend is serving a given recipe, swapping the
/// loaded model when it is not. At most one evict+launch runs at a time.
pub struct ModelSwitcher {
    processes: Arc<dyn ProcessManager>,
    http: reqwest::Client,
    inference_port: u16,
    health_url: String,
    log_dir: PathBuf,
    timings: SwitchTimings,
    lock: Mutex<()>,
}

impl ModelSwitcher {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        http: reqwest::Client,
        inference_port: u16,
        health_url: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        timings: SwitchTimings,
    ) -> Self {
        Self {
            processes,
            http,
            inference_port,
            health_url: health_url.into(),
            log_dir: log_dir.into(),
            timings,
            lock: Mutex::new(()),
        }
    }

    pub async fn ensure_running(&self, recipe: &Recipe) -> Result<(), SwitchError> {
        if self.is_current(recipe).await {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        phase(recipe, SwitchPhase::CheckingCurrent);
        if self.is_current(recipe).await {
            return Ok(());
        }

        phase(recipe, SwitchPhase::Evicting);
        if let Some(pid) = self.processes.evict_model(false).await {
            tracing::info!(model = %recipe.id, pid, "evicted previous model");
        }
        tokio::time::sleep(self.timings.settle).await;

        phase(recipe, SwitchPhase::Launching);
        let launch = self.processes.launch_model(recipe).await;
        if !launch.success {
            let err = SwitchError::LaunchFailed {
                model: recipe.id.clone(),
                message: launch.message,
            };
            tracing::warn!(error = %err, "model switch failed");
            return Err(err);
        }

        phase(recipe, SwitchPhase::PollingHealth);
        let result = self.wait_healthy(recipe, launch.pid).await;
        match &result {
            Ok(()) => phase(recipe, SwitchPhase::Ready),
            Err(err) => tracing::warn!(error = %err, "model switch failed"),
        }
        result
    }

    async fn is_current(&self, recipe: &Recipe) -> bool {
        let Some(info) = self
            .processes
            .find_inference_process(self.inference_port)
            .await
        else {
            return false;
        };
        match info.served_model_name.as_deref() {
            Some(served) => served.eq_ignore_ascii_case(recipe.canonical_name()),
            None => info
                .model_path
                .as_deref()
                .is_some_and(|path| !recipe.model_path.is_empty() && path == recipe.model_path),
        }
    }

    async fn wait_healthy(&self, recipe: &Recipe, pid: Option<u32>) -> Result<(), SwitchError> {
        let deadline = tokio::time::Instant::now() + self.timings.deadline;
        while tokio::time::Instant::now() < deadline {
            if let Some(pid) = pid {
                if !self.processes.pid_exists(pid).await {
                    let tail = self.read_log_tail(recipe).await;
                    return Err(SwitchError::Crashed {
                        model: recipe.id.clone(),
                        tail,
                    });
                }
            }
            if crate::upstream::probe_health(&self.http, &self.health_url, self.timings.health_timeout)
                .await
            {
                return Ok(());
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
        Err(SwitchError::Timeout {
            model: recipe.id.clone(),
            secs: self.timings.deadline.as_secs(),
        })
    }

    async fn read_log_tail(&self, recipe: &Recipe) -> String {
        let path = log_path(&self.log_dir, &recipe.id);
        match tokio::fs::read(&path).await {
            Ok(raw) => log_tail(&String::from_utf8_lossy(&raw)),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "launch log unreadable");
                String::new()
            }
        }
    }
}

fn phase(recipe: &Recipe, phase: SwitchPhase) {
    tracing::info!(model = %recipe.id, phase = phase.as_str(), "model switch");
}

/// Last 500 characters of the log, cut down to the last 200.
pub fn log_tail(log: &str) -> String {
    let read = last_chars(log, LOG_TAIL_READ);
    last_chars(read, LOG_TAIL_KEEP).trim().to_string()
}

fn last_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    match text.char_indices().nth(count - n) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
