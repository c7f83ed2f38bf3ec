//! `POST /plugin:{Verb}` handlers.
//!
//! Each handler builds the [`RequestContext`] from the `operationId` query
//! parameter and the correlation headers, then calls the dispatcher.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use plugin_core::{
    BackupRequest, CommitOrRollbackRequest, ProtectionRequest, RequestContext, RestoreRequest,
    ValidateForBackupRequest, ValidateForProtectionRequest, ValidateForRestoreRequest,
};
use serde::Deserialize;

use super::AppState;
use crate::network::middleware::{CORRELATION_HEADER, SUBSCRIPTION_HEADER};
use crate::service::VerbOutcome;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationQuery {
    /// Missing ids are rejected by the dispatcher with a failed envelope.
    #[serde(default)]
    pub operation_id: String,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Per-request context; never stored beyond the call.
#[must_use]
pub fn request_context(query: OperationQuery, headers: &HeaderMap) -> RequestContext {
    RequestContext {
        operation_id: query.operation_id,
        correlation_id: header(headers, CORRELATION_HEADER),
        subscription_id: header(headers, SUBSCRIPTION_HEADER),
    }
}

pub async fn validate_for_protection(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<ValidateForProtectionRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.validate_for_protection(&ctx, request).await
}

pub async fn start_protection(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<ProtectionRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.start_protection(&ctx, request).await
}

pub async fn stop_protection(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<ProtectionRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.stop_protection(&ctx, request).await
}

pub async fn validate_for_backup(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<ValidateForBackupRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.validate_for_backup(&ctx, request).await
}

pub async fn backup(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<BackupRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.backup(&ctx, request)
}

pub async fn commit_or_rollback_backup(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<CommitOrRollbackRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.commit_or_rollback_backup(&ctx, request).await
}

pub async fn validate_for_restore(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<ValidateForRestoreRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.validate_for_restore(&ctx, request).await
}

pub async fn restore(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<RestoreRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.restore(&ctx, request)
}

pub async fn commit_or_rollback_restore(
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
    headers: HeaderMap,
    Json(request): Json<CommitOrRollbackRequest>,
) -> VerbOutcome {
    let ctx = request_context(query, &headers);
    state.dispatcher.commit_or_rollback_restore(&ctx, request).await
}
