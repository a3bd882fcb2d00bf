// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Operational HTTP API.
//!
//! Read-only status surface for dashboards and health checks; viewers never
//! touch this (they subscribe at the SFU).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::relay::RelayOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RelayOrchestrator,
}

pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/cameras", get(cameras))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr, error = %e, "Failed to bind API listener");
            return;
        }
    };
    info!(addr, "Status API listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "API server error");
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "camrelay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

async fn cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.orchestrator.status();
    (StatusCode::OK, Json(snapshot.cameras))
}
