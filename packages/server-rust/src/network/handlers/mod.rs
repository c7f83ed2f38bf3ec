//! HTTP handlers for the plugin verb surface, operation polling and health.
//!
//! `AppState` is the shared state carried through axum extractors.

pub mod health;
pub mod operations;
pub mod verbs;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use operations::{cancel_operation_handler, operation_status_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{NetworkConfig, ShutdownController};
use crate::service::{Dispatcher, VerbOutcome};

/// Shared application state passed to every handler via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Process start, for uptime.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, config: NetworkConfig) -> Self {
        Self {
            shutdown: dispatcher.shutdown_controller(),
            dispatcher,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

impl IntoResponse for VerbOutcome {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// All routes, without middleware.
///
/// - `POST /plugin:{Verb}?operationId=...` -- the nine plugin verbs
/// - `GET /operations/{operation_id}` -- poll
/// - `POST /operations/{operation_id}/cancel` -- cancel a running backup or restore
/// - `GET /health`, `/health/live`, `/health/ready`
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/plugin:ValidateForProtection",
            post(verbs::validate_for_protection),
        )
        .route("/plugin:StartProtection", post(verbs::start_protection))
        .route("/plugin:StopProtection", post(verbs::stop_protection))
        .route("/plugin:ValidateForBackup", post(verbs::validate_for_backup))
        .route("/plugin:Backup", post(verbs::backup))
        .route(
            "/plugin:CommitOrRollbackBackup",
            post(verbs::commit_or_rollback_backup),
        )
        .route("/plugin:ValidateForRestore", post(verbs::validate_for_restore))
        .route("/plugin:Restore", post(verbs::restore))
        .route(
            "/plugin:CommitOrRollbackRestore",
            post(verbs::commit_or_rollback_restore),
        )
        .route("/operations/{operation_id}", get(operation_status_handler))
        .route(
            "/operations/{operation_id}/cancel",
            post(cancel_operation_handler),
        )
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}
