//! Prometheus scrape endpoint.

use crate::routes::routes::ServerState;
use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `GET /metrics`
pub async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.gauge.render(),
    )
}
