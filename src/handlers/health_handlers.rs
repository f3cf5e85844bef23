//! Health & readiness handlers.
//!
//! - GET /health   -> service identity ("ok" + service name)
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks both backing stores

use crate::services::relay::RelayService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

pub const SERVICE_NAME: &str = "transfer-relay";

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(ServiceHealth {
        status: "ok",
        service: SERVICE_NAME,
    })
}

/// `GET /healthz`
///
/// Liveness probe. Cheap, never performs I/O.
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
/// Probes the metadata store and the object store. HTTP 200 when both
/// pass, HTTP 503 when either fails; details are in the server log.
pub async fn readyz(State(relay): State<RelayService>) -> impl IntoResponse {
    let report = relay.health().await;

    let mut checks = HashMap::new();
    checks.insert("metadata", CheckStatus { ok: report.metadata });
    checks.insert("objects", CheckStatus { ok: report.objects });

    let overall_ok = report.is_ready();
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct ServiceHealth {
    status: &'static str,
    service: &'static str,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use axum::response::Response;

    async fn json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_names_the_service() {
        let value = json(health().await.into_response()).await;
        assert_eq!(value, serde_json::json!({"status": "ok", "service": "transfer-relay"}));
    }

    #[tokio::test]
    async fn readyz_reports_failing_store() {
        let h = Harness::new();
        let response = readyz(State(h.relay.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        h.objects.fail_next(1);
        let response = readyz(State(h.relay.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = json(response).await;
        assert_eq!(value["checks"]["objects"]["ok"], false);
        assert_eq!(value["checks"]["metadata"]["ok"], true);
    }
}
