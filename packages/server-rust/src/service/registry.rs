//! In-memory registry of operations, keyed by caller-supplied operation id.
//!
//! Each id is written by exactly one owner (the verb handler or the worker it
//! spawned) and read by any number of pollers. Every update replaces the
//! record under the map's per-shard lock, so a reader observes either the
//! state before a completion or the state after it.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use plugin_core::{
    default_retention, Completion, ExecutionStatus, OperationDetails, OperationKind,
    PluginError, TransitionError,
};
use tracing::debug;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// The id is already registered. Carries the existing record so callers
    /// can replay it.
    #[error("operation {id} already registered")]
    Duplicate {
        id: String,
        existing: Box<OperationDetails>,
    },

    #[error("operation {id} not found")]
    Unknown { id: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Canonical id-to-operation mapping, shared by handlers, workers and pollers.
pub struct OperationRegistry {
    operations: DashMap<String, OperationDetails>,
    retention: TimeDelta,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(default_retention())
    }
}

impl OperationRegistry {
    /// Creates an empty registry. `retention` is the offset between an
    /// operation's end time and its purge time.
    #[must_use]
    pub fn new(retention: TimeDelta) -> Self {
        Self {
            operations: DashMap::new(),
            retention,
        }
    }

    #[must_use]
    pub fn retention(&self) -> TimeDelta {
        self.retention
    }

    /// Records a new operation in `Running`, with `created_time = start_time = now`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if `id` is already present; the
    /// existing record is left untouched.
    pub fn register(
        &self,
        id: &str,
        kind: OperationKind,
        now: DateTime<Utc>,
        payload: Option<String>,
    ) -> Result<OperationDetails, RegistryError> {
        match self.operations.entry(id.to_string()) {
            Entry::Occupied(existing) => Err(RegistryError::Duplicate {
                id: id.to_string(),
                existing: Box::new(existing.get().clone()),
            }),
            Entry::Vacant(slot) => {
                let details = OperationDetails::running(id, kind, now).with_payload(payload);
                slot.insert(details.clone());
                debug!(operation_id = %id, kind = %kind, "operation registered");
                Ok(details)
            }
        }
    }

    /// Snapshot of the operation, or `None` if unknown.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<OperationDetails> {
        self.operations.get(id).map(|entry| entry.value().clone())
    }

    /// Applies a terminal outcome and returns the updated record.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Unknown`] if the id is absent
    /// - [`RegistryError::Transition`] if the operation is already terminal
    pub fn complete(
        &self,
        id: &str,
        completion: Completion,
    ) -> Result<OperationDetails, RegistryError> {
        let mut entry = self
            .operations
            .get_mut(id)
            .ok_or_else(|| RegistryError::Unknown { id: id.to_string() })?;

        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut updated = entry.value().clone();
        updated.complete(completion, self.retention)?;
        *entry.value_mut() = updated.clone();
        drop(entry);

        debug!(operation_id = %id, status = %updated.status, "operation completed");
        Ok(updated)
    }

    /// # Errors
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_success(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<OperationDetails, RegistryError> {
        self.complete(id, Completion::succeeded(end_time))
    }

    /// # Errors
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_failure(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
        status_code: u16,
        error: PluginError,
    ) -> Result<OperationDetails, RegistryError> {
        self.complete(id, Completion::failed(end_time, status_code, error))
    }

    /// # Errors
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_cancelled(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
        error: PluginError,
    ) -> Result<OperationDetails, RegistryError> {
        self.complete(id, Completion::cancelled(end_time, error))
    }

    /// Removes terminal operations whose purge time is at or before `now`.
    /// Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.operations.len();
        self.operations.retain(|_, op| !op.is_expired(now));
        before.saturating_sub(self.operations.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations not yet terminal.
    #[must_use]
    pub fn count_running(&self) -> usize {
        self.operations
            .iter()
            .filter(|entry| entry.value().status == ExecutionStatus::Running)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
