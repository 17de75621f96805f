use crate::recipes::{Backend, Recipe};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

const EVICT_GRACE: Duration = Duration::from_secs(10);
const EVICT_POLL: Duration = Duration::from_millis(500);

/// A running inference backend found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub backend: Backend,
    pub served_model_name: Option<String>,
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    pub success: bool,
    pub pid: Option<u32>,
    pub message: String,
}

impl LaunchResult {
    pub fn started(pid: u32, message: impl Into<String>) -> Self {
        Self {
            success: true,
            pid: Some(pid),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            pid: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signal {signal} to pid {pid} failed: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        source: nix::errno::Errno,
    },
}

/// Owns the single inference backend process on this host.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn find_inference_process(&self, port: u16) -> Option<ProcessInfo>;
    async fn launch_model(&self, recipe: &Recipe) -> LaunchResult;
    /// Stops whatever is serving the inference port. Returns the evicted pid.
    async fn evict_model(&self, force: bool) -> Option<u32>;
    async fn pid_exists(&self, pid: u32) -> bool;
}

/// Per-recipe launch log, `<dir>/vllm_<id>.log`.
pub fn log_path(log_dir: &Path, recipe_id: &str) -> PathBuf {
    log_dir.join(format!("vllm_{recipe_id}.log"))
}

/// Reads a backend command line (argv) and reports it if it serves `port`.
pub fn parse_cmdline(pid: u32, args: &[String], port: u16) -> Option<ProcessInfo> {
    let joined = args.join(" ");
    let backend = if joined.contains("sglang.launch_server") {
        Backend::Sglang
    } else if joined.contains("vllm")
        && (args.iter().any(|a| a == "serve") || joined.contains("vllm.entrypoints"))
    {
        Backend::Vllm
    } else {
        return None;
    };

    let flag = |name: &str| -> Option<String> {
        let prefix = format!("{name}=");
        args.iter().enumerate().find_map(|(i, arg)| {
            if arg == name {
                args.get(i + 1).cloned()
            } else {
                arg.strip_prefix(&prefix).map(str::to_string)
            }
        })
    };

    let listen_port = flag("--port")
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(backend.default_port());
    if listen_port != port {
        return None;
    }

    let positional_path = args
        .iter()
        .position(|a| a == "serve")
        .and_then(|i| args.get(i + 1))
        .filter(|a| !a.starts_with('-'))
        .cloned();
    let model_path = positional_path
        .or_else(|| flag("--model"))
        .or_else(|| flag("--model-path"));

    Some(ProcessInfo {
        pid,
        backend,
        served_model_name: flag("--served-model-name"),
        model_path,
    })
}

/// Program and argv that launch `recipe` on `port`.
pub fn build_launch_command(recipe: &Recipe, port: u16) -> (String, Vec<String>) {
    let served = recipe.canonical_name().to_string();
    let mut args = Vec::new();
    let program = match recipe.backend {
        Backend::Vllm => {
            args.extend([
                "serve".to_string(),
                recipe.model_path.clone(),
                "--port".to_string(),
                port.to_string(),
                "--served-model-name".to_string(),
                served,
            ]);
            if let Some(tp) = recipe.tensor_parallel_size {
                args.extend(["--tensor-parallel-size".to_string(), tp.to_string()]);
            }
            if let Some(len) = recipe.max_model_len {
                args.extend(["--max-model-len".to_string(), len.to_string()]);
            }
            if let Some(util) = recipe.gpu_memory_utilization {
                args.extend(["--gpu-memory-utilization".to_string(), util.to_string()]);
            }
            "vllm".to_string()
        }
        Backend::Sglang => {
            args.extend([
                "-m".to_string(),
                "sglang.launch_server".to_string(),
                "--model-path".to_string(),
                recipe.model_path.clone(),
                "--port".to_string(),
                port.to_string(),
                "--served-model-name".to_string(),
                served,
            ]);
            if let Some(tp) = recipe.tensor_parallel_size {
                args.extend(["--tp-size".to_string(), tp.to_string()]);
            }
            if let Some(len) = recipe.max_model_len {
                args.extend(["--context-length".to_string(), len.to_string()]);
            }
            if let Some(util) = recipe.gpu_memory_utilization {
                args.extend(["--mem-fraction-static".to_string(), util.to_string()]);
            }
            "python".to_string()
        }
    };
    args.extend(recipe.extra_args.iter().cloned());
    (program, args)
}

/// Process manager for backends running on the local host, found via `/proc`.
#[derive(Debug, Clone)]
pub struct LocalProcessManager {
    port: u16,
    log_dir: PathBuf,
}

impl LocalProcessManager {
    pub fn new(port: u16, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            log_dir: log_dir.into(),
        }
    }

    fn scan(&self, port: u16) -> Option<ProcessInfo> {
        let entries = std::fs::read_dir("/proc").ok()?;
        let own_pid = std::process::id();
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| *pid != own_pid)
            .find_map(|pid| {
                let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
                let args: Vec<String> = raw
                    .split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect();
                parse_cmdline(pid, &args, port)
            })
    }

    fn spawn(&self, recipe: &Recipe) -> Result<u32, ProcessError> {
        std::fs::create_dir_all(&self.log_dir)?;
        let log = std::fs::File::create(log_path(&self.log_dir, &recipe.id))?;
        let stderr = log.try_clone()?;
        let (program, args) = build_launch_command(recipe, self.port);

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        unsafe {
            cmd.pre_exec(|| {
                nix::libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("child exited before reporting a pid")
        })?;
        let recipe_id = recipe.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(recipe = %recipe_id, pid, %status, "inference backend exited"),
                Err(err) => tracing::warn!(recipe = %recipe_id, pid, error = %err, "wait on inference backend failed"),
            }
        });
        Ok(pid)
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal).map_err(|source| ProcessError::Signal {
        pid,
        signal: signal.as_str(),
        source,
    })
}

/// Signal 0 succeeds for zombies too, so a `Z` state in `/proc/<pid>/stat`
/// counts as gone.
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => true,
    }
}

#[async_trait]
impl ProcessManager for LocalProcessManager {
    async fn find_inference_process(&self, port: u16) -> Option<ProcessInfo> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.scan(port))
            .await
            .ok()
            .flatten()
    }

    async fn launch_model(&self, recipe: &Recipe) -> LaunchResult {
        match self.spawn(recipe) {
            Ok(pid) => {
                tracing::info!(
                    recipe = %recipe.id,
                    backend = recipe.backend.as_str(),
                    pid,
                    "launched inference backend"
                );
                LaunchResult::started(pid, format!("launched {} (pid {pid})", recipe.id))
            }
            Err(err) => LaunchResult::failed(format!("failed to launch {}: {err}", recipe.id)),
        }
    }

    async fn evict_model(&self, force: bool) -> Option<u32> {
        let info = self.find_inference_process(self.port).await?;
        let pid = info.pid;
        let first = if force {
            nix::sys::signal::Signal::SIGKILL
        } else {
            nix::sys::signal::Signal::SIGTERM
        };
        if let Err(err) = send_signal(pid, first) {
            tracing::warn!(pid, error = %err, "evict signal failed");
            return None;
        }

        let deadline = tokio::time::Instant::now() + EVICT_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !is_alive(pid) {
                tracing::info!(pid, "evicted inference backend");
                return Some(pid);
            }
            tokio::time::sleep(EVICT_POLL).await;
        }

        tracing::warn!(pid, "backend ignored SIGTERM, sending SIGKILL");
        if let Err(err) = send_signal(pid, nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(pid, error = %err, "SIGKILL failed");
        }
        Some(pid)
    }

    async fn pid_exists(&self, pid: u32) -> bool {
        is_alive(pid)
    }
}
