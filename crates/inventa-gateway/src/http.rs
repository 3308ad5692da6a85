// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP surface: `GET /health`, `GET /models`, `WS /ws/chat`.
//!
//! `/health` never consults downstream systems — it answers as long as the
//! process is serving.  `/models` evaluates the registry's availability
//! probes at request time (each under the registry's latency ceiling).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use inventa_agent::TransportFactory;
use inventa_config::Config;
use inventa_model::{list_models, ModelDescriptor};

use crate::error::GatewayError;
use crate::ws::ws_handler;

/// Shared, read-mostly state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub factory: Arc<dyn TransportFactory>,
}

/// Build the router.  Exposed separately from [`serve`] so tests can bind
/// an ephemeral port themselves.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(models))
        .route("/ws/chat", get(ws_handler))
        .layer(cors_layer(&state.config.server.allowed_origins))
        .with_state(state)
}

/// Bind the configured address and serve until ctrl-c / SIGTERM.
pub async fn serve(config: Arc<Config>, factory: Arc<dyn TransportFactory>) -> Result<(), GatewayError> {
    let bind = config.server.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| GatewayError::Bind { addr: bind.clone(), source: e })?;
    info!(%bind, "gateway listening");

    let app = router(AppState { config, factory });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(GatewayError::Serve)?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "inventa",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn models(State(state): State<AppState>) -> Json<Vec<ModelDescriptor>> {
    Json(list_models(&state.config).await)
}

/// CORS for the plain HTTP endpoints.  Origins that fail header-value
/// parsing are skipped with a warning rather than aborting startup.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers(Any)
}
