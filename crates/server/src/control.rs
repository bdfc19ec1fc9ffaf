//! Control endpoints, guarded by the shared node secret.

use crate::gateway::{error_response, GatewayState};
use axum::{extract::State, response::Response, Json};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

pub const SECRET_HEADER: &str = "x-tollgate-authorization";

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    !state.secret.is_empty() && presented == state.secret
}

/// Health-counter snapshot for every routed API.
pub async fn health(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        warn!("health snapshot request with bad secret");
        return error_response(StatusCode::FORBIDDEN, "Secret incorrect");
    }

    let mut report: HashMap<String, HashMap<&'static str, i64>> = HashMap::new();
    for api_id in state.api_ids() {
        let snapshot = state.health.snapshot(&api_id).await;
        report.insert(api_id, snapshot);
    }

    axum::response::IntoResponse::into_response(Json(json!({ "status": "ok", "apis": report })))
}

/// Triggers a spec-table rebuild on the reload channel.
pub async fn reload(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        warn!("reload request with bad secret");
        return error_response(StatusCode::FORBIDDEN, "Secret incorrect");
    }

    info!("reload requested via control endpoint");
    if state.reload.send(()).is_err() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Reload listener is not running");
    }
    axum::response::IntoResponse::into_response(Json(json!({ "status": "ok" })))
}
