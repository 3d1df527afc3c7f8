use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::Json,
    routing::{any, get},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use throttle_gate::{
    cache::{Cache, MemoryCache},
    manager::RateLimitManager,
    metrics::Metrics,
    middleware::{RateLimitLayer, RateLimitMiddleware},
    redis::RedisCache,
    settings::Settings,
};

#[derive(Clone)]
struct AppState {
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "throttle_gate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting throttle-gate");

    let settings = Settings::load()?;
    let metrics = Arc::new(Metrics::new()?);
    let cache = create_cache(&settings, metrics.clone()).await?;

    let manager = RateLimitManager::new();
    manager.register_cache("default", cache.clone())?;
    settings.configure_strategies(&manager)?;

    let config = settings.rate_limit_config(&manager)?;
    match &config {
        Some(config) => info!(rules = %config.to_parameters(), "Rate limiting enabled"),
        None => info!("No rate limit rules configured, requests pass through"),
    }
    let middleware =
        Arc::new(RateLimitMiddleware::new(config, &manager)?.with_metrics(metrics.clone()));

    let state = AppState { cache, metrics };
    let api = Router::new()
        .route("/api", any(echo))
        .route("/api/*path", any(echo))
        .layer(RateLimitLayer::new(middleware));

    let app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api);

    let addr = settings.http_addr.parse::<SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

async fn create_cache(settings: &Settings, metrics: Arc<Metrics>) -> Result<Arc<dyn Cache>> {
    match &settings.redis {
        Some(redis_config) => {
            let cache = RedisCache::connect(redis_config.clone())
                .await?
                .with_metrics(metrics);
            Ok(Arc::new(cache))
        }
        None => {
            info!(
                capacity = settings.local_cache_size,
                "Using in-memory cache store"
            );
            Ok(Arc::new(MemoryCache::new(settings.local_cache_size)))
        }
    }
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
    }
}

async fn echo(method: Method, uri: Uri, body: Bytes) -> Json<serde_json::Value> {
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "bytes": body.len(),
    }))
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.cache.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
