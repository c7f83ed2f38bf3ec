//! The common response envelope returned by every verb and by operation polls.
//!
//! The envelope carries exactly one of `succeededResponse`, `runningResponse`,
//! `failedResponse` or `cancelledResponse`. The variant is chosen once, from the
//! operation status, when the envelope is built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::base::PluginError;
use crate::loopback::LoopbackContext;
use crate::operation::{ExecutionStatus, OperationDetails, OperationKind};

/// Per-variant body: the loopback context for the next phase and, on failure or
/// cancellation, the structured error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_back_context: Option<LoopbackContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginError>,
}

/// Status-specific part of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusPayload {
    SucceededResponse(VerbStatus),
    RunningResponse(VerbStatus),
    FailedResponse(VerbStatus),
    CancelledResponse(VerbStatus),
}

impl StatusPayload {
    #[must_use]
    pub fn body(&self) -> &VerbStatus {
        match self {
            Self::SucceededResponse(s)
            | Self::RunningResponse(s)
            | Self::FailedResponse(s)
            | Self::CancelledResponse(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purge_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub outcome: StatusPayload,
}

impl OperationResponse {
    /// Builds the envelope for the current state of an operation.
    ///
    /// `NotStarted` is reported as running: from the caller's point of view the
    /// operation has been accepted and has not finished.
    #[must_use]
    pub fn from_details(details: &OperationDetails) -> Self {
        let body = VerbStatus {
            loop_back_context: details.payload.clone().map(LoopbackContext::from),
            error: details.error.clone(),
        };
        let outcome = match details.status {
            ExecutionStatus::NotStarted | ExecutionStatus::Running => {
                StatusPayload::RunningResponse(body)
            }
            ExecutionStatus::Succeeded => StatusPayload::SucceededResponse(body),
            ExecutionStatus::Failed => StatusPayload::FailedResponse(body),
            ExecutionStatus::Cancelled => StatusPayload::CancelledResponse(body),
        };

        Self {
            id: details.id.clone(),
            kind: Some(details.kind),
            status: Some(details.status),
            start_time: details.start_time,
            created_time: Some(details.created_time),
            end_time: details.end_time,
            purge_time: details.purge_time,
            outcome,
        }
    }

    /// Generic failed envelope for an id the registry does not know. Carries neither
    /// kind nor status.
    #[must_use]
    pub fn not_found(operation_id: &str) -> Self {
        Self::rejected(operation_id, PluginError::operation_not_found(operation_id))
    }

    /// Failed envelope for a call that was refused before any operation was recorded
    /// under its id.
    #[must_use]
    pub fn rejected(operation_id: &str, error: PluginError) -> Self {
        Self {
            id: operation_id.to_string(),
            kind: None,
            status: None,
            start_time: None,
            created_time: None,
            end_time: None,
            purge_time: None,
            outcome: StatusPayload::FailedResponse(VerbStatus {
                loop_back_context: None,
                error: Some(error),
            }),
        }
    }

    #[must_use]
    pub fn loop_back_context(&self) -> Option<&LoopbackContext> {
        self.outcome.body().loop_back_context.as_ref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&PluginError> {
        self.outcome.body().error.as_ref()
    }
}
