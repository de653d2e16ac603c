//! HTTP surface for the firewall.
//!
//! `POST /analyze` takes a candidate transaction and returns the full
//! verdict envelope; `GET /health` reports scan counters. Everything else
//! about serving (supervision, TLS termination) lives outside the core.

use crate::scan::{self, ScanContext};
use crate::types::{AnalyzeRequest, AnalyzeResponse, TxRequest};
use axum::{
    extract::State,
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub scans_total: u64,
    pub blocked: u64,
    pub warned: u64,
    pub incomplete: u64,
    /// Distinct addresses with at least one stored scan record.
    pub tracked_addresses: usize,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// POST /analyze — run the full analysis pipeline on one transaction.
async fn analyze(
    State(ctx): State<Arc<ScanContext>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tx = TxRequest::from_wire(&req)
        .map_err(|error| (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })))?;

    if !ctx.config.chains.contains_key(&tx.chain_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: format!("unrecognized chain: {}", tx.chain_id) }),
        ));
    }

    info!(chain = tx.chain_id, "analyze request received");
    Ok(Json(scan::scan(&ctx, tx).await))
}

/// GET /health — liveness plus scan counters.
async fn health(State(ctx): State<Arc<ScanContext>>) -> Json<HealthResponse> {
    let tracked_addresses = ctx.history.keys("history:").await.map(|k| k.len()).unwrap_or(0);
    Json(HealthResponse {
        status: "ok".into(),
        scans_total: ctx.stats.scans_total.load(Ordering::Relaxed),
        blocked: ctx.stats.blocked.load(Ordering::Relaxed),
        warned: ctx.stats.warned.load(Ordering::Relaxed),
        incomplete: ctx.stats.incomplete.load(Ordering::Relaxed),
        tracked_addresses,
    })
}

/// Build the axum router with CORS enabled.
pub fn build_router(ctx: Arc<ScanContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/analyze", post(analyze))
        .route("/health", get(health))
        .layer(cors)
        .with_state(ctx)
}

// ── Tests ───────────────────────────────────────────────────────
