use std::io::Read;

use async_trait::async_trait;
use plugin_core::{CommitDecision, Datasource, LoopbackContext};

use crate::service::OperationError;

/// Verb phase a validation call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Protection,
    Backup,
    Restore,
}

/// Phase a commit-or-rollback call finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizePhase {
    Backup,
    Restore,
}

/// One stream to back up: its name and a forward-only source for its bytes.
pub struct PlannedStream {
    pub name: String,
    pub reader: Box<dyn Read + Send>,
}

/// One storage unit to back up, with its streams in write order.
pub struct PlannedUnit {
    pub name: String,
    pub streams: Vec<PlannedStream>,
}

/// Everything a backup writes into one Pit.
#[derive(Default)]
pub struct BackupPlan {
    pub units: Vec<PlannedUnit>,
    /// Opaque metadata stored on the Pit record.
    pub plugin_metadata: Option<String>,
}

/// Position of one stream being restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreItem {
    pub storage_unit: String,
    pub stream: String,
    /// Occurrence of `stream` within `storage_unit`, 0-based.
    pub index: usize,
}

/// The source system a plugin protects. Produces bytes on backup and consumes
/// them on restore; the service never looks inside them.
///
/// Control-plane calls are async. Byte movement is blocking [`Read`] and runs on
/// blocking threads.
#[async_trait]
pub trait SourceDataplane: Send + Sync + 'static {
    /// Checks that `datasource` is fit for `phase`. May return a loopback
    /// context for the next phase.
    async fn validate(
        &self,
        phase: ValidationPhase,
        datasource: &Datasource,
    ) -> Result<Option<LoopbackContext>, OperationError>;

    /// Enables or disables protection of `datasource`.
    async fn set_protection(
        &self,
        datasource: &Datasource,
        enabled: bool,
    ) -> Result<(), OperationError>;

    /// Describes the storage units and streams to write for one backup.
    async fn backup(
        &self,
        datasource: &Datasource,
        loopback: Option<&LoopbackContext>,
    ) -> Result<BackupPlan, OperationError>;

    /// Consumes one restored stream. Called on a blocking thread.
    ///
    /// # Errors
    ///
    /// Any error fails the restore as a data-plane failure.
    fn restore(
        &self,
        target: &Datasource,
        item: &RestoreItem,
        reader: &mut dyn Read,
    ) -> anyhow::Result<()>;

    /// Commit or roll back the source-side effects of `phase`.
    async fn finalize(
        &self,
        phase: FinalizePhase,
        decision: CommitDecision,
        datasource: Option<&Datasource>,
    ) -> Result<(), OperationError>;
}
