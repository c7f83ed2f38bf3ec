//! Errors raised by the Pit store, writer and reader.

use std::io;

use plugin_core::PitState;

/// Failure of a Pit storage or protocol call.
#[derive(Debug, thiserror::Error)]
pub enum PitError {
    #[error("invalid {what} name {name:?}")]
    InvalidName { what: &'static str, name: String },

    #[error("recovery point {id} is already committed")]
    AlreadyCommitted { id: String },

    #[error("recovery point {id} already has an active write session")]
    SessionActive { id: String },

    #[error("recovery point {id} not found")]
    NotFound { id: String },

    /// A call that the record's current state does not allow, e.g. adding a
    /// storage unit after commit.
    #[error("cannot {action} recovery point {id} in state {state:?}")]
    InvalidState {
        id: String,
        state: PitState,
        action: &'static str,
    },

    #[error("write session for recovery point {id} was aborted")]
    SessionAborted { id: String },

    #[error("storage unit {unit} already exists")]
    DuplicateStorageUnit { unit: String },

    #[error("storage unit {unit} must expect at least one stream")]
    InvalidStreamCount { unit: String },

    #[error("no storage unit has been added")]
    NoStorageUnit,

    #[error("storage unit {unit} already holds its {expected} stream(s)")]
    StorageUnitFull { unit: String, expected: u32 },

    #[error("storage unit {unit} holds {actual} of {expected} expected stream(s)")]
    IncompleteStorageUnit {
        unit: String,
        expected: u32,
        actual: usize,
    },

    #[error("a stream channel is still open")]
    ChannelOpen,

    #[error("stream {name} (occurrence {index}) not found")]
    StreamNotFound { name: String, index: usize },

    #[error("reader for recovery point {id} has been cleaned up")]
    ReaderReleased { id: String },

    #[error("catalog entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PitError {
    /// Whether the error reports a clash with an existing record or session.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyCommitted { .. } | Self::SessionActive { .. })
    }

    /// Whether the error reports a missing record or stream.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::StreamNotFound { .. })
    }
}
