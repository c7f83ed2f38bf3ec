//! Base types shared by every verb: datasources, access tokens and the structured
//! error body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable error codes emitted by the service itself (as opposed to codes that come
/// from a source data plane).
pub mod error_codes {
    pub const OPERATION_NOT_FOUND: &str = "ErrorOperationIdNotFound";
    pub const DUPLICATE_OPERATION: &str = "ErrorDuplicateOperationId";
    pub const OPERATION_NOT_CANCELLABLE: &str = "ErrorOperationNotCancellable";
    pub const OPERATION_CANCELLED: &str = "OperationCancelled";
    pub const VALIDATION_FAILED: &str = "UserErrorValidationFailed";
    pub const DATA_PLANE_FAILURE: &str = "DataPlaneFailure";
    pub const RECOVERY_POINT_NOT_FOUND: &str = "UserErrorRecoveryPointNotFound";
    pub const RECOVERY_POINT_CONFLICT: &str = "ErrorRecoveryPointConflict";
    pub const PIT_PROTOCOL: &str = "ErrorPitProtocol";
    pub const SHUTTING_DOWN: &str = "ErrorServiceShuttingDown";
    pub const INTERNAL: &str = "InternalError";
}

// ---------------------------------------------------------------------------
// Datasources
// ---------------------------------------------------------------------------

/// A protectable resource. Only `resource_id` is interpreted by the service;
/// everything else is plugin-specific and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    #[serde(default)]
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_location: Option<String>,
    /// Plugin-specific fields.
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Datasource {
    #[must_use]
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            ..Self::default()
        }
    }
}

/// The parent set a datasource belongs to. Same shape as a datasource.
pub type DatasourceSet = Datasource;

/// Tokens issued to the vault identity. Carried, never inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceAccessToken {
    #[serde(default)]
    pub mgmt_plane_token: Option<String>,
    #[serde(default)]
    pub data_plane_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error detail that originates below the plugin (e.g. in the source data plane).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerError {
    pub code: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_info: BTreeMap<String, String>,
}

/// Structured error body attached to failed and cancelled operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_error: Option<InnerError>,
}

impl PluginError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recommended_action: None,
            inner_error: None,
        }
    }

    #[must_use]
    pub fn with_recommended_action(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_inner_error(mut self, inner: InnerError) -> Self {
        self.inner_error = Some(inner);
        self
    }

    /// The body returned when a poll names an id the registry does not know.
    #[must_use]
    pub fn operation_not_found(operation_id: &str) -> Self {
        Self::new(
            error_codes::OPERATION_NOT_FOUND,
            format!("operation {operation_id} was not found"),
        )
    }
}
