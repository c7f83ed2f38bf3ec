//! Operation lifecycle model.
//!
//! An [`OperationDetails`] tracks one verb invocation from registration to a terminal
//! state. Status only moves forward:
//!
//! ```text
//! NotStarted -> Running -> { Succeeded | Failed | Cancelled }
//! ```
//!
//! Once terminal, `end_time`, `purge_time` and `status_code` are set and never change.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::PluginError;

/// Hours a terminal operation stays queryable before it becomes eligible for purge.
pub const DEFAULT_RETENTION_HOURS: i64 = 8;

/// Default offset between an operation's end time and its purge time.
#[must_use]
pub fn default_retention() -> TimeDelta {
    TimeDelta::hours(DEFAULT_RETENTION_HOURS)
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The plugin verb that created an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    ValidateForProtection,
    StartProtection,
    StopProtection,
    ValidateForBackup,
    Backup,
    CommitOrRollbackBackup,
    ValidateForRestore,
    Restore,
    CommitOrRollbackRestore,
}

impl OperationKind {
    pub const ALL: [Self; 9] = [
        Self::ValidateForProtection,
        Self::StartProtection,
        Self::StopProtection,
        Self::ValidateForBackup,
        Self::Backup,
        Self::CommitOrRollbackBackup,
        Self::ValidateForRestore,
        Self::Restore,
        Self::CommitOrRollbackRestore,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidateForProtection => "ValidateForProtection",
            Self::StartProtection => "StartProtection",
            Self::StopProtection => "StopProtection",
            Self::ValidateForBackup => "ValidateForBackup",
            Self::Backup => "Backup",
            Self::CommitOrRollbackBackup => "CommitOrRollbackBackup",
            Self::ValidateForRestore => "ValidateForRestore",
            Self::Restore => "Restore",
            Self::CommitOrRollbackRestore => "CommitOrRollbackRestore",
        }
    }

    /// Whether this verb completes on a background worker rather than inline.
    #[must_use]
    pub fn is_async(self) -> bool {
        matches!(self, Self::Backup | Self::Restore)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal forward step from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::NotStarted => next == Self::Running,
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// Terminal outcome written onto a running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub end_time: DateTime<Utc>,
    /// HTTP status reported by polls once terminal.
    pub status_code: u16,
    pub error: Option<PluginError>,
    /// Replaces the operation payload when set.
    pub payload: Option<String>,
}

impl Completion {
    #[must_use]
    pub fn succeeded(end_time: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            end_time,
            status_code: 200,
            error: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn failed(end_time: DateTime<Utc>, status_code: u16, error: PluginError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            end_time,
            status_code,
            error: Some(error),
            payload: None,
        }
    }

    #[must_use]
    pub fn cancelled(end_time: DateTime<Utc>, error: PluginError) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            end_time,
            status_code: 200,
            error: Some(error),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

// ---------------------------------------------------------------------------
// OperationDetails
// ---------------------------------------------------------------------------

/// Tracked state of one verb invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDetails {
    pub id: String,
    pub kind: OperationKind,
    pub status: ExecutionStatus,
    pub created_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub purge_time: Option<DateTime<Utc>>,
    pub error: Option<PluginError>,
    pub status_code: Option<u16>,
    /// Opaque plugin data, typically the loopback context handed to the next phase.
    pub payload: Option<String>,
}

impl OperationDetails {
    /// A freshly created operation that has not begun executing.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: OperationKind, created_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            status: ExecutionStatus::NotStarted,
            created_time,
            start_time: None,
            end_time: None,
            purge_time: None,
            error: None,
            status_code: None,
            payload: None,
        }
    }

    /// An operation that entered `Running` at the moment it was created.
    #[must_use]
    pub fn running(id: impl Into<String>, kind: OperationKind, now: DateTime<Utc>) -> Self {
        let mut details = Self::new(id, kind, now);
        details.status = ExecutionStatus::Running;
        details.start_time = Some(now);
        details
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }

    /// Moves a `NotStarted` operation to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::InvalidTransition`] from any other status.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check_transition(ExecutionStatus::Running)?;
        self.status = ExecutionStatus::Running;
        self.start_time = Some(now);
        Ok(())
    }

    /// Applies a terminal outcome. `purge_time` becomes `end_time + retention`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::InvalidTransition`] if the operation is not `Running`
    /// or the completion status is not terminal. The operation is left untouched.
    pub fn complete(
        &mut self,
        completion: Completion,
        retention: TimeDelta,
    ) -> Result<(), TransitionError> {
        self.check_transition(completion.status)?;
        self.status = completion.status;
        self.end_time = Some(completion.end_time);
        self.purge_time = Some(completion.end_time + retention);
        self.status_code = Some(completion.status_code);
        self.error = completion.error;
        if completion.payload.is_some() {
            self.payload = completion.payload;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the operation's purge time has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.purge_time.is_some_and(|purge| purge <= now)
    }

    fn check_transition(&self, to: ExecutionStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn running_sets_start_and_created_time() {
        let op = OperationDetails::running("op1", OperationKind::Backup, t0());
        assert_eq!(op.status, ExecutionStatus::Running);
        assert_eq!(op.created_time, t0());
        assert_eq!(op.start_time, Some(t0()));
        assert!(op.end_time.is_none());
        assert!(op.purge_time.is_none());
        assert!(op.status_code.is_none());
    }

    #[test]
    fn success_computes_purge_time_from_retention() {
        let mut op = OperationDetails::running("op1", OperationKind::Backup, t0());
        let end = t0() + TimeDelta::minutes(3);
        op.complete(Completion::succeeded(end), default_retention())
            .unwrap();

        assert_eq!(op.status, ExecutionStatus::Succeeded);
        assert_eq!(op.end_time, Some(end));
        assert_eq!(op.purge_time, Some(end + TimeDelta::hours(8)));
        assert_eq!(op.status_code, Some(200));
        assert!(op.error.is_none());
    }

    #[test]
    fn failure_records_code_and_error() {
        let mut op = OperationDetails::running("op1", OperationKind::Restore, t0());
        let err = PluginError::new("DataPlaneFailure", "disk on fire");
        op.complete(Completion::failed(t0(), 500, err.clone()), default_retention())
            .unwrap();

        assert_eq!(op.status, ExecutionStatus::Failed);
        assert_eq!(op.status_code, Some(500));
        assert_eq!(op.error, Some(err));
    }

    #[test]
    fn terminal_state_is_write_once() {
        let mut op = OperationDetails::running("op1", OperationKind::Backup, t0());
        op.complete(Completion::succeeded(t0()), default_retention())
            .unwrap();
        let snapshot = op.clone();

        let err = op
            .complete(
                Completion::failed(t0(), 500, PluginError::new("x", "y")),
                default_retention(),
            )
            .unwrap_err();

        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                id: "op1".to_string(),
                from: ExecutionStatus::Succeeded,
                to: ExecutionStatus::Failed,
            }
        );
        assert_eq!(op, snapshot);
    }

    #[test]
    fn not_started_cannot_jump_to_terminal() {
        let mut op = OperationDetails::new("op1", OperationKind::Backup, t0());
        assert!(op
            .complete(Completion::succeeded(t0()), default_retention())
            .is_err());

        op.begin(t0()).unwrap();
        assert_eq!(op.status, ExecutionStatus::Running);
        assert!(op.begin(t0()).is_err());
    }

    #[test]
    fn completion_payload_replaces_existing_payload() {
        let mut op = OperationDetails::running("op1", OperationKind::Backup, t0())
            .with_payload(Some("before".to_string()));
        op.complete(
            Completion::succeeded(t0()).with_payload("after"),
            default_retention(),
        )
        .unwrap();
        assert_eq!(op.payload.as_deref(), Some("after"));

        let mut kept = OperationDetails::running("op2", OperationKind::Backup, t0())
            .with_payload(Some("kept".to_string()));
        kept.complete(Completion::succeeded(t0()), default_retention())
            .unwrap();
        assert_eq!(kept.payload.as_deref(), Some("kept"));
    }

    #[test]
    fn expiry_follows_purge_time() {
        let mut op = OperationDetails::running("op1", OperationKind::Backup, t0());
        assert!(!op.is_expired(t0() + TimeDelta::days(30)));

        op.complete(Completion::succeeded(t0()), TimeDelta::hours(1))
            .unwrap();
        assert!(!op.is_expired(t0() + TimeDelta::minutes(59)));
        assert!(op.is_expired(t0() + TimeDelta::hours(1)));
    }

    #[test]
    fn only_backup_and_restore_are_async() {
        let async_kinds: Vec<_> = OperationKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_async())
            .collect();
        assert_eq!(async_kinds, vec![OperationKind::Backup, OperationKind::Restore]);
    }

    #[test]
    fn status_serializes_as_pascal_case() {
        let json = serde_json::to_string(&ExecutionStatus::Succeeded).unwrap();
        assert_eq!(json, "\"Succeeded\"");
        let kind = serde_json::to_string(&OperationKind::CommitOrRollbackBackup).unwrap();
        assert_eq!(kind, "\"CommitOrRollbackBackup\"");
    }
}
