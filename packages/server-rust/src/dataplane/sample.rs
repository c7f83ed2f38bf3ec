//! Sample source data plane: one storage unit with one fixed stream.

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_core::{CommitDecision, Datasource, LoopbackContext};
use tracing::info;

use crate::service::OperationError;
use crate::traits::{
    BackupPlan, FinalizePhase, PlannedStream, PlannedUnit, RestoreItem, SourceDataplane,
    ValidationPhase,
};

pub const SAMPLE_STORAGE_UNIT: &str = "TestStorageUnit";
pub const SAMPLE_STREAM: &str = "testStream";
pub const SAMPLE_CONTENT: &str = "Just a small random backup content";
pub const SAMPLE_LOOPBACK: &str = r#"{"foo":"foo","bar":"bar"}"#;
pub const SAMPLE_METADATA: &str = r#"{"Foo":"Foo","Bar":"Bar"}"#;

/// In-process data plane that backs up a fixed payload and checks it on restore.
#[derive(Default)]
pub struct SampleDataplane {
    restored: AtomicUsize,
    decisions: Mutex<Vec<(FinalizePhase, CommitDecision)>>,
}

impl SampleDataplane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams restored and verified so far.
    #[must_use]
    pub fn restored_count(&self) -> usize {
        self.restored.load(Ordering::Relaxed)
    }

    /// Commit-or-rollback decisions received, oldest first.
    #[must_use]
    pub fn decisions(&self) -> Vec<(FinalizePhase, CommitDecision)> {
        self.decisions.lock().clone()
    }
}

fn require_resource_id(datasource: &Datasource) -> Result<(), OperationError> {
    if datasource.resource_id.trim().is_empty() {
        return Err(OperationError::validation("datasource resourceId is required"));
    }
    Ok(())
}

#[async_trait]
impl SourceDataplane for SampleDataplane {
    async fn validate(
        &self,
        phase: ValidationPhase,
        datasource: &Datasource,
    ) -> Result<Option<LoopbackContext>, OperationError> {
        require_resource_id(datasource)?;
        Ok(match phase {
            ValidationPhase::Backup => Some(LoopbackContext::new(SAMPLE_LOOPBACK)),
            ValidationPhase::Protection | ValidationPhase::Restore => None,
        })
    }

    async fn set_protection(
        &self,
        datasource: &Datasource,
        enabled: bool,
    ) -> Result<(), OperationError> {
        require_resource_id(datasource)?;
        info!(resource_id = %datasource.resource_id, enabled, "protection changed");
        Ok(())
    }

    async fn backup(
        &self,
        datasource: &Datasource,
        _loopback: Option<&LoopbackContext>,
    ) -> Result<BackupPlan, OperationError> {
        require_resource_id(datasource)?;
        Ok(BackupPlan {
            units: vec![PlannedUnit {
                name: SAMPLE_STORAGE_UNIT.to_string(),
                streams: vec![PlannedStream {
                    name: SAMPLE_STREAM.to_string(),
                    reader: Box::new(Cursor::new(SAMPLE_CONTENT.as_bytes())),
                }],
            }],
            plugin_metadata: Some(SAMPLE_METADATA.to_string()),
        })
    }

    fn restore(
        &self,
        target: &Datasource,
        item: &RestoreItem,
        reader: &mut dyn Read,
    ) -> anyhow::Result<()> {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .with_context(|| format!("reading {}/{}", item.storage_unit, item.stream))?;

        if item.stream == SAMPLE_STREAM && content != SAMPLE_CONTENT.as_bytes() {
            bail!(
                "restored content of {}/{} does not match the backup",
                item.storage_unit,
                item.stream
            );
        }
        self.restored.fetch_add(1, Ordering::Relaxed);
        info!(
            resource_id = %target.resource_id,
            storage_unit = %item.storage_unit,
            stream = %item.stream,
            bytes = content.len(),
            "stream restored"
        );
        Ok(())
    }

    async fn finalize(
        &self,
        phase: FinalizePhase,
        decision: CommitDecision,
        _datasource: Option<&Datasource>,
    ) -> Result<(), OperationError> {
        self.decisions.lock().push((phase, decision));
        info!(phase = ?phase, decision = decision.as_str(), "finalized");
        Ok(())
    }
}
