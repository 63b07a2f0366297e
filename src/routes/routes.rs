//! Routes served by the populator while a transfer runs.
//!
//! - `GET /metrics`: transfer progress in Prometheus text format
//! - `GET /healthz`: liveness
//! - `GET /readyz`: readiness (destination volume reachable)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        metrics_handlers::metrics,
    },
    metrics::ProgressGauge,
};
use axum::{Router, routing::get};
use std::path::PathBuf;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub gauge: ProgressGauge,
    pub volume_path: PathBuf,
}

pub fn routes() -> Router<ServerState> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
