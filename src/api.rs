//! Minimal HTTP surface: liveness, readiness, and Prometheus metrics.
//! Everything else -- per-route JSON request/response shapes for the
//! ledger, gateway, escrow, etc. -- is outside this crate's scope; those
//! routes belong to a service built on top of `AppState`. Grounded on the
//! canceler's `server.rs`: a small `axum::Router` with a `with_state`
//! handle, readiness gated on whether the core has done useful work yet.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use eyre::eyre;
use serde::Serialize;
use tracing::info;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    env: String,
    db_connected: bool,
}

async fn liveness() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.db.is_connected() || state.config.database_url.is_none() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        env: state.config.env.clone(),
        db_connected: state.db.is_connected(),
    })
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.encode();
    match Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(axum::body::Body::from(body))
    {
        Ok(resp) => resp,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "failed to build metrics response").into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

pub async fn serve(bind_address: &str, port: u16, state: Arc<AppState>) -> eyre::Result<()> {
    let app = router(state);
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .map_err(|e| eyre!("invalid bind address {bind_address}:{port}: {e}"))?;
    info!(%addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            port: 8080,
            env: "test".into(),
            log_level: "info".into(),
            database_url: None,
            db_max_connections: 1,
            db_min_connections: 1,
            rpc_url: "https://rpc.example.com".into(),
            chain_id: 1,
            private_key: None,
            wallet_address: None,
            usdc_contract: "0x0000000000000000000000000000000000000001".into(),
            default_price: crate::money::Micros::parse("0.01").unwrap(),
            min_payment: crate::money::Micros::parse("0.000001").unwrap(),
            max_payment: crate::money::Micros::parse("1000").unwrap(),
            rate_limit_rps: 10,
            admin_secret: None,
            demo_mode: true,
            reputation_hmac_secret: None,
            http_connect_timeout: std::time::Duration::from_secs(5),
            http_request_timeout: std::time::Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness().await, "OK");
    }

    #[tokio::test]
    async fn metrics_encodes_to_200() {
        let state = Arc::new(AppState::new(test_config(), crate::db::Db::disabled()));
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_ok_without_database_configured() {
        let state = Arc::new(AppState::new(test_config(), crate::db::Db::disabled()));
        let (status, _) = readiness(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn router_builds_without_panicking() {
        let state = Arc::new(AppState::new(test_config(), crate::db::Db::disabled()));
        let _ = router(state);
    }
}
