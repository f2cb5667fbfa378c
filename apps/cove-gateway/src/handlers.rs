//! HTTP control plane: version, statistics, and management operations.
//!
//! Unauthenticated or malformed admin tokens answer 404 rather than 401
//! so the management surface is indistinguishable from a missing route.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::manager::CloseCause;
use crate::token::decode_token;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ManageQuery {
    pub token: String,
    pub operation: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub timeout: Option<u32>,
}

pub async fn version_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "version": state.config.model_version }))
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub async fn statistics_handler(
    State(state): State<Arc<AppState>>,
    query: Option<Query<TokenQuery>>,
) -> Response {
    // a missing or unparseable query string answers like a bad token,
    // never 400, so the route stays indistinguishable from a missing one
    let Some(Query(query)) = query else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(claims) = decode_token(&query.token, &state.config.product_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Json(state.manager.statistics(claims.is_admin())).into_response()
}

pub async fn manage_handler(
    State(state): State<Arc<AppState>>,
    query: Option<Query<ManageQuery>>,
) -> Response {
    let Some(Query(query)) = query else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let claims = match decode_token(&query.token, &state.config.product_id) {
        Ok(claims) if claims.is_admin() => claims,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    counter!("cove_gateway_manage_operations_total", 1, "operation" => query.operation.clone());

    match query.operation.as_str() {
        "maintenance" => {
            let minutes = query.timeout.unwrap_or(1);
            info!(admin = %claims.account_email, minutes, "maintenance scheduled");
            state.manager.schedule_maintenance(minutes).await;
            Json(json!({ "ok": true })).into_response()
        }
        "wipe-statistics" => {
            state.manager.wipe_statistics();
            Json(json!({ "ok": true })).into_response()
        }
        "force-close" => {
            let Some(workspace) = query.workspace.as_deref() else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let found = state.manager.force_close(workspace).await;
            Json(json!({ "ok": found })).into_response()
        }
        "reboot" => {
            info!(admin = %claims.account_email, "reboot requested");
            let manager = state.manager.clone();
            let shutdown = state.shutdown.clone();
            tokio::spawn(async move {
                manager.close_everything(CloseCause::Shutdown).await;
                let _ = shutdown.send(()).await;
            });
            Json(json!({ "ok": true })).into_response()
        }
        other => {
            warn!(operation = %other, "unknown manage operation");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
