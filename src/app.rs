use crate::error::{AppError, AppResult};
use crate::process::{LocalProcessManager, ProcessManager};
use crate::recipes::SqliteRecipeStore;
use crate::switcher::{ModelSwitcher, SwitchTimings};
use crate::upstream::{GatewayConfig, join_url};
use crate::usage::LifetimeUsage;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub recipe_store: SqliteRecipeStore,
    pub switcher: Arc<ModelSwitcher>,
    pub usage: Arc<LifetimeUsage>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub upstream_url: String,
    pub upstream_api_key: String,
    pub upstream_timeout_ms: u64,
    pub inference_host: String,
    pub inference_port: u16,
    pub log_dir: PathBuf,
    pub max_body_bytes: usize,
    pub switch: SwitchTimings,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("STUDIO_LISTEN", "0.0.0.0:8080"),
            metrics_path: env_or("STUDIO_METRICS_PATH", "/metrics"),
            database_dsn: resolve_database_dsn(),
            upstream_url: env_or("STUDIO_UPSTREAM_URL", "http://localhost:4100"),
            upstream_api_key: env_or("LITELLM_MASTER_KEY", "sk-master"),
            upstream_timeout_ms: env_parse("STUDIO_UPSTREAM_TIMEOUT_MS", 600_000),
            inference_host: env_or("STUDIO_INFERENCE_HOST", "localhost"),
            inference_port: env_parse("STUDIO_INFERENCE_PORT", 8000),
            log_dir: PathBuf::from(env_or("STUDIO_LOG_DIR", "/tmp")),
            max_body_bytes: env_parse("STUDIO_MAX_BODY_BYTES", 64 * 1024 * 1024),
            switch: SwitchTimings::default(),
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.upstream_url.clone(),
            api_key: self.upstream_api_key.clone(),
            timeout_ms: self.upstream_timeout_ms,
        }
    }

    fn inference_base(&self) -> String {
        format!("http://{}:{}", self.inference_host, self.inference_port)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.inference_base(), "/health")
    }

    pub fn tokenize_url(&self) -> String {
        join_url(&self.inference_base(), "/tokenize")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let processes = Arc::new(LocalProcessManager::new(
        runtime.inference_port,
        runtime.log_dir.clone(),
    ));
    load_state_with(runtime, processes).await
}

/// Builds the state around a caller-supplied process manager.
pub async fn load_state_with(
    runtime: RuntimeConfig,
    processes: Arc<dyn ProcessManager>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("studio-proxy/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "database_init_failed",
            err,
        )
    })?;

    // Every connection to an in-memory database is its own database.
    let max_connections = if is_memory_dsn(&runtime.database_dsn) { 1 } else { 5 };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        axum::http::StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let recipe_store = SqliteRecipeStore::new(pool).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "recipe_store_init_failed",
            err.to_string(),
        )
    })?;

    let metrics = init_metrics()?;

    let switcher = Arc::new(ModelSwitcher::new(
        processes,
        http.clone(),
        runtime.inference_port,
        runtime.health_url(),
        runtime.log_dir.clone(),
        runtime.switch,
    ));

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        recipe_store,
        switcher,
        usage: Arc::new(LifetimeUsage::new()),
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    std::env::var("STUDIO_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/studio.db".to_string())
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let max_body_bytes = state.runtime.max_body_bytes;
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/health", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(max_body_bytes))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}
