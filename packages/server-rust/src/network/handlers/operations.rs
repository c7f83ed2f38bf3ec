//! Operation poll and cancel handlers.

use axum::extract::{Path, State};

use super::AppState;
use crate::service::VerbOutcome;

/// `GET /operations/{operation_id}`
pub async fn operation_status_handler(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> VerbOutcome {
    state.dispatcher.status(&operation_id)
}

/// `POST /operations/{operation_id}/cancel`
pub async fn cancel_operation_handler(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> VerbOutcome {
    state.dispatcher.cancel(&operation_id)
}
