//! Axum-based HTTP + WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::config::GatewayConfig;

use crate::session::handle_ws_connection;
use crate::state::GatewayState;

/// Build the gateway router: the audio WebSocket route and `/health`.
pub fn router(state: Arc<GatewayState>) -> Router {
    let gateway = state.config.gateway();

    let app = Router::new()
        .route(&gateway.path, get(ws_handler))
        .route("/health", get(health_handler));

    with_metrics(app)
        .with_state(state)
        .layer(cors_layer(&gateway))
        .layer(TraceLayer::new_for_http())
}

#[cfg(feature = "metrics")]
fn with_metrics(app: Router<Arc<GatewayState>>) -> Router<Arc<GatewayState>> {
    match crate::metrics::install_prometheus_recorder() {
        Ok(handle) => app.route("/metrics", get(move || std::future::ready(handle.render()))),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable");
            app
        }
    }
}

#[cfg(not(feature = "metrics"))]
fn with_metrics(app: Router<Arc<GatewayState>>) -> Router<Arc<GatewayState>> {
    app
}

/// Start the gateway and serve until Ctrl-C or `state.shutdown` fires.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let gateway = state.config.gateway();
    let bind_addr = gateway.bind.clone().unwrap_or_else(|| "0.0.0.0".to_string());

    let app = router(state.clone());

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr} (audio at {})", gateway.path);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Gateway stopped");
    Ok(())
}

fn cors_layer(gateway: &GatewayConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if gateway.allows_any_origin() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = gateway
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.session_count().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
    }))
}

/// Resolves on Ctrl-C or when `shutdown` is cancelled elsewhere. Either
/// way every live session is cancelled through the shared parent token.
async fn shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                shutdown.cancelled().await;
            }
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
