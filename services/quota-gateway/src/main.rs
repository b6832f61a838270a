//! Geonames Quota Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Geonames accounts from config
//! 2. Hands out credentials round-robin under per-account and pool ceilings
//! 3. Takes accounts out of rotation when Geonames rejects or exhausts them
//! 4. Reports usage per window on `/v1/quota/status` and `/metrics`

mod admin;
mod config;
mod error;
mod leases;
mod metrics;
mod quota;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{FromRef, MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use geonames_quota::{Pool, PoolHealth, Scope, SystemClock, UsageMonitor};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::leases::LeaseTable;
use crate::quota::QuotaState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    quota: QuotaState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl FromRef<AppState> for QuotaState {
    fn from_ref(state: &AppState) -> Self {
        state.quota.clone()
    }
}

/// Build the main router with all routes and shared state.
///
/// `max_connections` caps concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/quota/status", get(quota::status_handler))
        .route("/v1/quota/check", post(quota::check_handler))
        .route("/v1/leases", post(quota::acquire_handler))
        .route("/v1/leases/{lease_id}/release", post(quota::release_handler))
        .route_layer(middleware::from_fn(track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Count and time every routed request by its route template.
async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::record_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Build the pool from config: per-credential ceiling overrides first, then
/// the credentials in configured order.
fn build_pool(config: &Config) -> Result<Pool> {
    let monitor = Arc::new(UsageMonitor::new(
        Arc::new(SystemClock),
        config.limits.pool,
        config.limits.credential,
    ));

    let mut credentials = Vec::new();
    for (credential, limits) in config.pool_credentials() {
        if let Some(limits) = limits {
            monitor.register(Scope::credential(credential.id.as_str()), limits)?;
        }
        credentials.push(credential);
    }

    Ok(Pool::new(
        credentials,
        monitor,
        config.pool.to_pool_config(),
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting geonames-quota-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = ?config.server.admin_listen_addr,
        credentials = config.credentials.len(),
        lease_ttl_secs = config.server.lease_ttl_secs,
        "configuration loaded"
    );
    if config.credentials.is_empty() {
        warn!(
            "no credentials configured; every lease will be refused until one is added via the admin API"
        );
    }

    let pool = Arc::new(build_pool(&config).context("failed to build credential pool")?);

    let app_state = AppState {
        quota: QuotaState {
            pool: pool.clone(),
            leases: Arc::new(LeaseTable::new(config.lease_ttl())),
        },
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // One signal drains both listeners.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = match config.server.admin_listen_addr {
        Some(addr) => {
            let admin_listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {addr}"))?;
            info!(addr = %addr, "admin API listening");
            let admin_app = build_admin_router(AdminState::new(pool.clone()));
            let mut rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.wait_for(|stop| *stop).await;
                    })
                    .await
            }))
        }
        None => None,
    };

    let mut rx = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    // Wait for the OS signal, then start draining. The drain timeout starts
    // at signal receipt.
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }
    if let Some(handle) = admin_handle
        && let Err(e) = tokio::time::timeout(DRAIN_TIMEOUT, handle).await
    {
        warn!(error = %e, "admin listener did not drain in time");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 when healthy or degraded, 503 when no credential is
/// usable or accounting is broken.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let leases_outstanding = state.quota.leases.len().await;

    let (status_code, body) = match state.quota.pool.snapshot().await {
        Ok(snapshot) => {
            let status_code = if snapshot.status == PoolHealth::Unhealthy {
                axum::http::StatusCode::SERVICE_UNAVAILABLE
            } else {
                axum::http::StatusCode::OK
            };
            (
                status_code,
                serde_json::json!({
                    "status": snapshot.status,
                    "credentials_total": snapshot.credentials_total,
                    "credentials_available": snapshot.credentials_available,
                    "credentials_exhausted": snapshot.credentials_exhausted,
                    "credentials_suspended": snapshot.credentials_suspended,
                    "leases_outstanding": leases_outstanding,
                    "uptime_seconds": uptime,
                }),
            )
        }
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "uptime_seconds": uptime,
            }),
        ),
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
