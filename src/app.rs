use crate::auth::AuthState;
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{AppError, AppResult};
use crate::gateway::{ModelGateway, OpenAiGateway};
use crate::identity::{IdentityStore, MemoryIdentityStore};
use crate::usage_log::UsageLogger;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub gateway: Arc<dyn ModelGateway>,
    pub usage_log: UsageLogger,
    pub identity_store: Arc<dyn IdentityStore>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const DEFAULT_PORT: &str = "3000";
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub log_dir: PathBuf,
    pub gateway: GatewayConfig,
    pub jwt_secret: Option<String>,
    /// `None` lets a stream run as long as upstream keeps it open.
    pub max_stream_duration: Option<Duration>,
    pub body_limit_bytes: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok()).map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_invalid",
                err.to_string(),
            )
        })
    }

    /// Builds the runtime from any variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;

        let listen = match var("ASKRELAY_LISTEN") {
            Some(listen) => listen,
            None => {
                let port = var("PORT").unwrap_or_else(|| DEFAULT_PORT.to_string());
                let port: u16 = port.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "PORT",
                    reason: format!("`{port}` is not a port number"),
                })?;
                format!("0.0.0.0:{port}")
            }
        };
        let metrics_path = var("ASKRELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        if !metrics_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                name: "ASKRELAY_METRICS_PATH",
                reason: "must start with `/`".to_string(),
            });
        }
        let log_dir = var("ASKRELAY_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./logs"));

        let base_url = var("ASKRELAY_GATEWAY_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let mut gateway = GatewayConfig::new(base_url, api_key);
        if let Some(model) = var("ASKRELAY_FAST_MODEL") {
            gateway.models.fast = model;
        }
        if let Some(model) = var("ASKRELAY_CAPABLE_MODEL") {
            gateway.models.capable = model;
        }
        if let Some(model) = var("ASKRELAY_TRANSCRIPTION_MODEL") {
            gateway.transcription_model = model;
        }
        if let Some(ms) = parse_number::<u64>(&var, "ASKRELAY_REQUEST_TIMEOUT_MS")? {
            gateway.request_timeout_ms = ms;
        }

        let stream_secs = parse_number::<u64>(&var, "ASKRELAY_STREAM_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_STREAM_TIMEOUT_SECS);
        let max_stream_duration = (stream_secs > 0).then(|| Duration::from_secs(stream_secs));
        let body_limit_bytes = parse_number::<usize>(&var, "ASKRELAY_BODY_LIMIT_BYTES")?
            .unwrap_or(DEFAULT_BODY_LIMIT_BYTES);

        Ok(Self {
            listen,
            metrics_path,
            log_dir,
            gateway,
            jwt_secret: var("JWT_SECRET"),
            max_stream_duration,
            body_limit_bytes,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    var(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                name,
                reason: format!("`{raw}` is not a non-negative integer"),
            })
        })
        .transpose()
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()?).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("askrelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let gateway: Arc<dyn ModelGateway> =
        Arc::new(OpenAiGateway::new(http, runtime.gateway.clone()));
    Ok(build_state(runtime, gateway))
}

/// Assembles state around an already-built gateway.
pub fn build_state(runtime: RuntimeConfig, gateway: Arc<dyn ModelGateway>) -> AppState {
    let auth = AuthState::new(runtime.jwt_secret.clone());
    if !auth.has_secret() {
        tracing::warn!("JWT_SECRET is not set; authenticated endpoints will answer 500");
    }
    let usage_log = UsageLogger::new(runtime.log_dir.clone());
    tracing::info!(
        usage_log = %usage_log.path().display(),
        fast_model = %runtime.gateway.models.fast,
        capable_model = %runtime.gateway.models.capable,
        max_stream_secs = ?runtime.max_stream_duration.map(|d| d.as_secs()),
        "relay configured"
    );
    AppState {
        runtime: Arc::new(runtime),
        auth,
        gateway,
        usage_log,
        identity_store: Arc::new(MemoryIdentityStore::default()),
        metrics: metrics_handle(),
    }
}

fn metrics_handle() -> PrometheusHandle {
    match init_metrics() {
        Ok(handle) => handle,
        Err(err) => {
            // Another recorder owns the process; keep a detached handle so /metrics still answers.
            tracing::warn!(error = %err.message, "prometheus recorder unavailable");
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle()
        }
    }
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
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
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let body_limit = state.runtime.body_limit_bytes;
    Router::<AppState>::new()
        .route("/", get(crate::handlers::root))
        .route(&metrics_path, get(crate::handlers::metrics))
        .nest("/api", build_api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/ask", post(crate::relay::ask))
        .route("/auth/register", post(crate::handlers::register))
        .route("/auth/login", post(crate::handlers::login))
}
