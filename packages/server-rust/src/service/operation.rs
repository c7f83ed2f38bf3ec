//! Error taxonomy and verb outcome types shared by the registry, the dispatcher
//! and the HTTP handlers.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use plugin_core::{
    error_codes, Completion, InnerError, LoopbackContext, OperationKind, OperationResponse,
    PluginError,
};

use crate::storage::PitError;

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Failure of a verb, classified as validation, data-plane, protocol or
/// infrastructural. Every variant maps to an HTTP status and a stable code.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Caller input failed a precondition of the verb.
    #[error("{message}")]
    Validation { code: String, message: String },

    /// The source data plane failed while moving or checking data.
    #[error("data plane failure: {0:#}")]
    DataPlane(anyhow::Error),

    #[error(transparent)]
    Pit(#[from] PitError),

    #[error("operation {id} already exists as {existing}")]
    DuplicateOperation { id: String, existing: OperationKind },

    #[error("operation {id} not found")]
    UnknownOperation { id: String },

    #[error("operation {id} cannot be cancelled")]
    NotCancellable { id: String },

    #[error("operation was cancelled")]
    Cancelled,

    /// New async work is refused while the service drains.
    #[error("service is shutting down")]
    ShuttingDown,

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Validation failure with the generic validation code.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            code: error_codes::VALIDATION_FAILED.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Pit(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Pit(e) if e.is_conflict() => StatusCode::CONFLICT,
            Self::Pit(PitError::InvalidName { .. }) => StatusCode::BAD_REQUEST,
            Self::UnknownOperation { .. } => StatusCode::NOT_FOUND,
            Self::DuplicateOperation { .. } | Self::NotCancellable { .. } => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::OK,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Pit(_) | Self::DataPlane(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    #[must_use]
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::DataPlane(_) => error_codes::DATA_PLANE_FAILURE,
            Self::Pit(e) if e.is_not_found() => error_codes::RECOVERY_POINT_NOT_FOUND,
            Self::Pit(e) if e.is_conflict() => error_codes::RECOVERY_POINT_CONFLICT,
            Self::Pit(PitError::InvalidName { .. }) => error_codes::VALIDATION_FAILED,
            Self::Pit(_) => error_codes::PIT_PROTOCOL,
            Self::DuplicateOperation { .. } => error_codes::DUPLICATE_OPERATION,
            Self::UnknownOperation { .. } => error_codes::OPERATION_NOT_FOUND,
            Self::NotCancellable { .. } => error_codes::OPERATION_NOT_CANCELLABLE,
            Self::Cancelled => error_codes::OPERATION_CANCELLED,
            Self::ShuttingDown => error_codes::SHUTTING_DOWN,
            Self::Internal(_) => error_codes::INTERNAL,
        }
    }

    fn recommended_action(&self) -> Option<&'static str> {
        match self {
            Self::Validation { .. } | Self::Pit(PitError::InvalidName { .. }) => {
                Some("Correct the request and retry.")
            }
            Self::Pit(e) if e.is_not_found() => Some("Check that the recovery point exists."),
            Self::Pit(e) if e.is_conflict() => {
                Some("Use a new recovery point id or wait for the active backup to finish.")
            }
            Self::DuplicateOperation { .. } => Some("Retry with a new operation id."),
            Self::DataPlane(_) | Self::Internal(_) => Some("Retry the operation."),
            Self::ShuttingDown => Some("Retry against another instance or after restart."),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wire error body for this failure.
    #[must_use]
    pub fn to_plugin_error(&self) -> PluginError {
        let mut error = PluginError::new(self.error_code(), self.to_string());
        if let Some(action) = self.recommended_action() {
            error = error.with_recommended_action(action);
        }
        if let Self::DataPlane(source) = self {
            let mut inner = InnerError {
                code: error_codes::DATA_PLANE_FAILURE.to_string(),
                ..InnerError::default()
            };
            inner
                .additional_info
                .insert("detail".to_string(), format!("{source:#}"));
            error = error.with_inner_error(inner);
        }
        error
    }

    /// Terminal outcome recording this failure.
    ///
    /// The loopback context handed to the next phase carries the error code,
    /// so a following commit-or-rollback call takes the rollback branch.
    #[must_use]
    pub fn completion(
        &self,
        end_time: DateTime<Utc>,
        loopback: Option<&LoopbackContext>,
    ) -> Completion {
        let error = self.to_plugin_error();
        let stamped = LoopbackContext::with_error_code(loopback, self.error_code()).into_inner();
        let completion = if self.is_cancelled() {
            Completion::cancelled(end_time, error)
        } else {
            Completion::failed(end_time, self.status_code().as_u16(), error)
        };
        completion.with_payload(stamped)
    }
}

// ---------------------------------------------------------------------------
// VerbOutcome
// ---------------------------------------------------------------------------

/// What a verb call or poll returns over HTTP: the status line and the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct VerbOutcome {
    pub status: StatusCode,
    pub body: OperationResponse,
}

impl VerbOutcome {
    #[must_use]
    pub fn new(status: StatusCode, body: OperationResponse) -> Self {
        Self { status, body }
    }

    /// Kind-less failed envelope for a call refused before anything was recorded.
    #[must_use]
    pub fn rejected(operation_id: &str, error: &OperationError) -> Self {
        Self::new(
            error.status_code(),
            OperationResponse::rejected(operation_id, error.to_plugin_error()),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
