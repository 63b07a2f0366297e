//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the destination volume is reachable

use crate::routes::routes::ServerState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;

/// `GET /healthz`
///
/// Liveness probe. Always 200 with a small JSON body and no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 once the destination volume can be stat'ed, 503 otherwise. The
/// volume is opened by the transfer itself, so this only looks at metadata.
pub async fn readyz(State(state): State<ServerState>) -> impl IntoResponse {
    let volume_check = match fs::metadata(&state.volume_path).await {
        Ok(_) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("{}: {}", state.volume_path.display(), e)),
        },
    };
    let ok = volume_check.ok;

    let mut checks = HashMap::new();
    checks.insert("volume", volume_check);

    let body = ReadyResponse {
        status: if ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProgressGauge;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn readiness_follows_volume() {
        let dir = tempfile::tempdir().unwrap();
        let state = ServerState {
            gauge: ProgressGauge::populator(),
            volume_path: dir.path().join("disk.img"),
        };

        let missing = readyz(State(state.clone())).await.into_response();
        assert_eq!(missing.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(missing.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["checks"]["volume"]["ok"], false);

        tokio::fs::write(&state.volume_path, b"").await.unwrap();
        let present = readyz(State(state)).await.into_response();
        assert_eq!(present.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(healthz().await.into_response().status(), StatusCode::OK);
    }
}
