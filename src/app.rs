use crate::accounts::{AccountStore, SqliteAccountStore};
use crate::chat::now_ts;
use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::providers::{Provider, build_providers};
use crate::quota::QuotaGate;
use crate::registry::ProviderRegistry;
use crate::search::{DuckDuckGoSearch, NoopSearch, WebSearch};
use crate::telemetry::{TelemetryQueue, TelemetrySink, TracingSink, WebhookSink};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub gateway: Gateway,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub config_path: PathBuf,
    pub telemetry_webhook: Option<String>,
    /// Zero disables the background reset sweep.
    pub reset_sweep_seconds: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("OZONE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("OZONE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let config_path = env_non_empty("OZONE_CONFIG")
            .unwrap_or_else(|| "./config/gateway.json".to_string())
            .into();
        let reset_sweep_seconds = env_non_empty("OZONE_RESET_SWEEP_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            listen,
            metrics_path,
            database_dsn: resolve_database_dsn(),
            config_path,
            telemetry_webhook: env_non_empty("OZONE_TELEMETRY_WEBHOOK"),
            reset_sweep_seconds,
        }
    }
}

/// Collaborators that replace or extend what the config file describes.
#[derive(Default)]
pub struct Collaborators {
    /// Registered after the configured providers.
    pub providers: Vec<Arc<dyn Provider>>,
    pub search: Option<Arc<dyn WebSearch>>,
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
    pub accounts: Option<Arc<dyn AccountStore>>,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = GatewayConfig::load(&runtime.config_path).map_err(AppError::internal)?;
    load_state_with(runtime, config, Collaborators::default()).await
}

pub async fn load_state_with(
    runtime: RuntimeConfig,
    config: GatewayConfig,
    collaborators: Collaborators,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("ozone/0.1")
        .build()
        .map_err(|err| AppError::internal(format!("http_client_init_failed: {err}")))?;

    let accounts: Arc<dyn AccountStore> = match collaborators.accounts {
        Some(store) => store,
        None => Arc::new(
            SqliteAccountStore::connect(&runtime.database_dsn)
                .await
                .map_err(|err| AppError::internal(format!("database_init_failed: {err}")))?,
        ),
    };

    let mut providers = build_providers(&config.providers, &http).map_err(AppError::internal)?;
    providers.extend(collaborators.providers);
    if providers.is_empty() {
        tracing::warn!("no providers configured; every model will be reported as not found");
    }
    let registry = Arc::new(ProviderRegistry::new(providers));
    tracing::info!(
        providers = registry.list_providers().len(),
        models = registry.catalog().len(),
        "provider registry ready"
    );

    let search: Arc<dyn WebSearch> = match collaborators.search {
        Some(search) => search,
        None if config.search.enabled => Arc::new(DuckDuckGoSearch::new(http.clone(), &config.search)),
        None => Arc::new(NoopSearch),
    };

    let sink: Arc<dyn TelemetrySink> = match (collaborators.telemetry, &runtime.telemetry_webhook) {
        (Some(sink), _) => sink,
        (None, Some(url)) => Arc::new(WebhookSink::new(http.clone(), url.clone())),
        (None, None) => Arc::new(TracingSink),
    };
    let telemetry = TelemetryQueue::spawn(sink, config.telemetry_queue_capacity);

    let quota = QuotaGate::new(accounts, config.plan_book());
    let gateway = Gateway::new(
        registry,
        quota.clone(),
        search,
        config.search.max_results,
        telemetry,
        config.restricted_models.clone(),
        config.api_version.clone(),
    );

    let metrics = init_metrics()?;

    if runtime.reset_sweep_seconds > 0 {
        spawn_reset_sweep(quota, Duration::from_secs(runtime.reset_sweep_seconds));
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        gateway,
        metrics,
    })
}

fn spawn_reset_sweep(quota: QuotaGate, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match quota.reset_sweep(now_ts()).await {
                Ok(0) => {}
                Ok(reset) => tracing::info!(reset, "period reset sweep"),
                Err(err) => tracing::warn!(error = %err, "period reset sweep failed"),
            }
        }
    });
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!("metrics_init_failed: {err}")));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn resolve_database_dsn() -> String {
    env_non_empty("OZONE_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/ozone.db".to_string())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
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
