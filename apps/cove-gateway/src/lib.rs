//! Real-time collaboration gateway.
//!
//! Terminates many long-lived client connections on one listener,
//! authenticates each with a bearer token, multiplexes them onto
//! per-workspace pipelines, and brokers request/response and broadcast
//! traffic between clients and those pipelines.

pub mod config;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod pipeline;
pub mod session;
pub mod socket;
pub mod token;
pub mod websocket;
pub mod workspace;

use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::manager::SessionManager;

pub struct AppState {
    pub manager: SessionManager,
    pub config: ServerConfig,
    pub metrics: PrometheusHandle,
    /// Signalled by the admin `reboot` operation; the serve loop drains
    /// it for graceful shutdown.
    pub shutdown: mpsc::Sender<()>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket::connect_handler_no_token))
        .route("/:token", get(websocket::connect_handler))
        .route("/api/v1/version", get(handlers::version_handler))
        .route("/api/v1/statistics", get(handlers::statistics_handler))
        .route("/api/v1/manage", put(handlers::manage_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
