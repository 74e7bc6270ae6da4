//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub store: ComponentStatus,
    pub baseline: ComponentStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok", "pending" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "ipruler-controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// Liveness: the process is serving requests.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Readiness: the store answers. A missing baseline is reported but does
/// not fail readiness; node groups still converge without one.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.cluster().full_configs.list(None).await;
    let store_ok = store.is_ok();

    let baseline = match state.locator().current() {
        Some(key) => ComponentStatus {
            status: "ok".to_string(),
            message: Some(key.to_string()),
        },
        None => ComponentStatus {
            status: "pending".to_string(),
            message: Some("no ClusterConfig observed yet".to_string()),
        },
    };

    let components = ComponentHealth {
        store: ComponentStatus {
            status: if store_ok { "ok" } else { "unavailable" }.to_string(),
            message: store.err().map(|e| e.to_string()),
        },
        baseline,
    };

    if store_ok {
        (StatusCode::OK, Json(response("ok", Some(components))))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(response("degraded", Some(components))),
        )
    }
}
