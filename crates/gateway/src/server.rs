use std::{future::Future, net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Json},
        routing::get,
    },
    serde_json::json,
    tracing::info,
};

use crate::gateway::Gateway;

// ── Router ──────────────────────────────────────────────────────────────────

/// HTTP surface: `GET /health`, 404 for everything else.
pub fn build_app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(not_found)
        .with_state(gateway)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    gateway: Arc<Gateway>,
    bind: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, build_app(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let report = gateway.get_health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}
