//! LRO dispatcher: turns verb calls into tracked operations.
//!
//! Synchronous verbs run inline and return their terminal state. Backup and
//! restore are handed to the [`Supervisor`] and answer `202 Running` at once;
//! their outcome is only visible by polling.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use futures_util::FutureExt;
use plugin_core::{
    BackupRequest, CommitDecision, CommitOrRollbackRequest, Completion, ExecutionStatus,
    LoopbackContext, OperationDetails, OperationKind, OperationResponse, ProtectionRequest,
    RequestContext, RestoreRequest, ValidateForBackupRequest, ValidateForProtectionRequest,
    ValidateForRestoreRequest,
};
use tracing::{error, info, info_span, warn, Instrument};

use super::config::ServerConfig;
use super::operation::{OperationError, VerbOutcome};
use super::registry::{OperationRegistry, RegistryError};
use super::supervisor::{record_completion, Supervisor};
use super::transfer::{blocking, BackupJob, RestoreJob};
use crate::network::shutdown::{HealthState, ShutdownController};
use crate::storage::{PitError, PitStoreFactory};
use crate::traits::{FinalizePhase, SourceDataplane, ValidationPhase};

/// Entry point for every verb and poll. Shared behind an `Arc` by the HTTP layer.
pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    supervisor: Supervisor,
    stores: Arc<PitStoreFactory>,
    dataplane: Arc<dyn SourceDataplane>,
    shutdown: Arc<ShutdownController>,
    config: Arc<ServerConfig>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: ServerConfig,
        stores: Arc<PitStoreFactory>,
        dataplane: Arc<dyn SourceDataplane>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let registry = Arc::new(OperationRegistry::new(config.operation_retention));
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&shutdown),
            config.node_id.clone(),
        );
        Self {
            registry,
            supervisor,
            stores,
            dataplane,
            shutdown,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stores(&self) -> &Arc<PitStoreFactory> {
        &self.stores
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Async operations whose worker has not finished.
    #[must_use]
    pub fn running(&self) -> usize {
        self.supervisor.running()
    }

    /// Waits for running workers, cancelling them after `timeout`.
    pub async fn drain(&self, timeout: Duration, grace: Duration) -> bool {
        self.supervisor.drain(timeout, grace).await
    }

    // -----------------------------------------------------------------------
    // Polling and cancellation
    // -----------------------------------------------------------------------

    /// Current envelope of `operation_id`.
    ///
    /// Running and succeeded operations answer 200; failed and cancelled ones
    /// answer their recorded status code; unknown ids answer 404.
    #[must_use]
    pub fn status(&self, operation_id: &str) -> VerbOutcome {
        match self.registry.get(operation_id) {
            Some(details) => {
                let status = match details.status {
                    ExecutionStatus::Failed | ExecutionStatus::Cancelled => recorded_status(&details),
                    _ => StatusCode::OK,
                };
                VerbOutcome::new(status, OperationResponse::from_details(&details))
            }
            None => VerbOutcome::new(
                StatusCode::NOT_FOUND,
                OperationResponse::not_found(operation_id),
            ),
        }
    }

    /// Requests cancellation of a running backup or restore.
    #[must_use]
    pub fn cancel(&self, operation_id: &str) -> VerbOutcome {
        let Some(details) = self.registry.get(operation_id) else {
            return VerbOutcome::new(
                StatusCode::NOT_FOUND,
                OperationResponse::not_found(operation_id),
            );
        };
        if details.is_terminal()
            || !details.kind.is_async()
            || !self.supervisor.cancel(operation_id)
        {
            let e = OperationError::NotCancellable {
                id: operation_id.to_string(),
            };
            return VerbOutcome::rejected(operation_id, &e);
        }
        let current = self.registry.get(operation_id).unwrap_or(details);
        VerbOutcome::new(StatusCode::ACCEPTED, OperationResponse::from_details(&current))
    }

    // -----------------------------------------------------------------------
    // Protection verbs
    // -----------------------------------------------------------------------

    pub async fn validate_for_protection(
        &self,
        ctx: &RequestContext,
        request: ValidateForProtectionRequest,
    ) -> VerbOutcome {
        self.run_sync(ctx, OperationKind::ValidateForProtection, None, || async {
            self.dataplane
                .validate(ValidationPhase::Protection, &request.datasource)
                .await
        })
        .await
    }

    pub async fn start_protection(
        &self,
        ctx: &RequestContext,
        request: ProtectionRequest,
    ) -> VerbOutcome {
        self.set_protection(ctx, OperationKind::StartProtection, request, true)
            .await
    }

    pub async fn stop_protection(
        &self,
        ctx: &RequestContext,
        request: ProtectionRequest,
    ) -> VerbOutcome {
        self.set_protection(ctx, OperationKind::StopProtection, request, false)
            .await
    }

    async fn set_protection(
        &self,
        ctx: &RequestContext,
        kind: OperationKind,
        request: ProtectionRequest,
        enabled: bool,
    ) -> VerbOutcome {
        self.run_sync(ctx, kind, None, || async {
            self.dataplane
                .set_protection(&request.datasource, enabled)
                .await?;
            Ok(None)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Backup verbs
    // -----------------------------------------------------------------------

    pub async fn validate_for_backup(
        &self,
        ctx: &RequestContext,
        request: ValidateForBackupRequest,
    ) -> VerbOutcome {
        self.run_sync(ctx, OperationKind::ValidateForBackup, None, || async {
            self.dataplane
                .validate(ValidationPhase::Backup, &request.datasource)
                .await
        })
        .await
    }

    /// Starts a backup worker. The recovery point id comes from
    /// `RecoveryPointId` in the catalog params and defaults to the operation id.
    #[must_use]
    pub fn backup(&self, ctx: &RequestContext, request: BackupRequest) -> VerbOutcome {
        if let Some(rejected) = self.refuse_when_draining(ctx) {
            return rejected;
        }
        let loopback = request.loop_back_context.clone();
        let details = match self.admit(ctx, OperationKind::Backup, payload_of(loopback.as_ref())) {
            Ok(details) => details,
            Err(outcome) => return outcome,
        };

        let recovery_point_id = request
            .recovery_point_id()
            .unwrap_or(&ctx.operation_id)
            .to_string();
        let job = BackupJob {
            stores: Arc::clone(&self.stores),
            dataplane: Arc::clone(&self.dataplane),
            request,
            recovery_point_id,
            format: self.config.default_format,
            copy_buffer_size: self.config.copy_buffer_size,
            simulated_delay: self.config.simulated_work_delay,
        };
        self.supervisor
            .spawn(&details, ctx.correlation(), loopback, move |token| job.run(token));
        VerbOutcome::new(StatusCode::ACCEPTED, OperationResponse::from_details(&details))
    }

    /// Commits or rolls back a backup, depending on the loopback context's
    /// error code. Rollback deletes the recovery point if it was committed.
    pub async fn commit_or_rollback_backup(
        &self,
        ctx: &RequestContext,
        request: CommitOrRollbackRequest,
    ) -> VerbOutcome {
        let loopback = request.loop_back_context.clone();
        let decision = CommitDecision::from_loopback(loopback.as_ref());
        self.run_sync(ctx, OperationKind::CommitOrRollbackBackup, loopback, || async {
            if let Some(rp) = request.recovery_point_id() {
                let rp = rp.to_string();
                let datastore = request.datastore_id().map(str::to_owned);
                let stores = Arc::clone(&self.stores);
                blocking(move || {
                    let store = stores.resolve(datastore.as_deref())?;
                    match decision {
                        CommitDecision::Commit => {
                            store.open(&rp)?;
                        }
                        CommitDecision::Rollback => {
                            let removed = store.delete(&rp)?;
                            info!(recovery_point_id = %rp, removed, "recovery point rolled back");
                        }
                    }
                    Ok(())
                })
                .await?;
            }
            self.dataplane
                .finalize(FinalizePhase::Backup, decision, request.datasource.as_ref())
                .await?;
            Ok(None)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Restore verbs
    // -----------------------------------------------------------------------

    /// Validates the restore target and, when given, that the recovery point
    /// exists in the requested datastore.
    pub async fn validate_for_restore(
        &self,
        ctx: &RequestContext,
        request: ValidateForRestoreRequest,
    ) -> VerbOutcome {
        self.run_sync(ctx, OperationKind::ValidateForRestore, None, || async {
            let next = self
                .dataplane
                .validate(ValidationPhase::Restore, &request.target_datasource)
                .await?;
            if let Some(rp) = request.restore_to_rp_id.clone().filter(|rp| !rp.is_empty()) {
                let stores = Arc::clone(&self.stores);
                let datastore_id = request.datastore_id().map(str::to_owned);
                blocking(move || {
                    if stores.resolve(datastore_id.as_deref())?.contains(&rp) {
                        Ok(())
                    } else {
                        Err(PitError::NotFound { id: rp }.into())
                    }
                })
                .await?;
            }
            Ok(next)
        })
        .await
    }

    /// Starts a restore worker for `restoreToRPId`.
    #[must_use]
    pub fn restore(&self, ctx: &RequestContext, request: RestoreRequest) -> VerbOutcome {
        if let Some(rejected) = self.refuse_when_draining(ctx) {
            return rejected;
        }
        let loopback = request.loop_back_context.clone();
        let details = match self.admit(ctx, OperationKind::Restore, payload_of(loopback.as_ref()))
        {
            Ok(details) => details,
            Err(outcome) => return outcome,
        };

        let job = RestoreJob {
            stores: Arc::clone(&self.stores),
            dataplane: Arc::clone(&self.dataplane),
            request,
            simulated_delay: self.config.simulated_work_delay,
        };
        self.supervisor
            .spawn(&details, ctx.correlation(), loopback, move |token| job.run(token));
        VerbOutcome::new(StatusCode::ACCEPTED, OperationResponse::from_details(&details))
    }

    pub async fn commit_or_rollback_restore(
        &self,
        ctx: &RequestContext,
        request: CommitOrRollbackRequest,
    ) -> VerbOutcome {
        let loopback = request.loop_back_context.clone();
        let decision = CommitDecision::from_loopback(loopback.as_ref());
        self.run_sync(ctx, OperationKind::CommitOrRollbackRestore, loopback, || async {
            self.dataplane
                .finalize(FinalizePhase::Restore, decision, request.datasource.as_ref())
                .await?;
            Ok(None)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Registers the operation, or returns what to answer instead: a replay of
    /// the existing operation for a same-kind duplicate, a rejection otherwise.
    fn admit(
        &self,
        ctx: &RequestContext,
        kind: OperationKind,
        payload: Option<String>,
    ) -> Result<OperationDetails, VerbOutcome> {
        let id = ctx.operation_id.as_str();
        if id.trim().is_empty() {
            let e = OperationError::validation("operationId is required");
            return Err(VerbOutcome::rejected(id, &e));
        }

        match self.registry.register(id, kind, Utc::now(), payload) {
            Ok(details) => {
                metrics::counter!("plugin_operations_started_total", "kind" => kind.as_str())
                    .increment(1);
                info!(
                    operation_id = %id,
                    kind = %kind,
                    correlation_id = %ctx.correlation(),
                    subscription_id = ctx.subscription_id.as_deref().unwrap_or("-"),
                    "operation started"
                );
                Ok(details)
            }
            Err(RegistryError::Duplicate { existing, .. }) if existing.kind == kind => {
                info!(operation_id = %id, kind = %kind, status = %existing.status, "replaying existing operation");
                Err(verb_outcome(&existing))
            }
            Err(RegistryError::Duplicate { existing, .. }) => {
                warn!(operation_id = %id, kind = %kind, existing = %existing.kind, "operation id reused for another verb");
                let e = OperationError::DuplicateOperation {
                    id: id.to_string(),
                    existing: existing.kind,
                };
                Err(VerbOutcome::rejected(id, &e))
            }
            Err(e) => Err(VerbOutcome::rejected(
                id,
                &OperationError::Internal(anyhow::Error::new(e)),
            )),
        }
    }

    fn refuse_when_draining(&self, ctx: &RequestContext) -> Option<VerbOutcome> {
        match self.shutdown.health_state() {
            HealthState::Draining | HealthState::Stopped => {
                warn!(operation_id = %ctx.operation_id, "refusing new operation while draining");
                Some(VerbOutcome::rejected(
                    &ctx.operation_id,
                    &OperationError::ShuttingDown,
                ))
            }
            HealthState::Starting | HealthState::Ready => None,
        }
    }

    /// Registers and completes a synchronous verb in one call.
    ///
    /// `work` returns the loopback context for the next phase. Errors and
    /// panics both end in `Failed`.
    async fn run_sync<F, Fut>(
        &self,
        ctx: &RequestContext,
        kind: OperationKind,
        loopback: Option<LoopbackContext>,
        work: F,
    ) -> VerbOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<LoopbackContext>, OperationError>>,
    {
        let details = match self.admit(ctx, kind, payload_of(loopback.as_ref())) {
            Ok(details) => details,
            Err(outcome) => return outcome,
        };

        let span = info_span!(
            "operation",
            node_id = %self.config.node_id,
            operation_id = %ctx.operation_id,
            kind = %kind,
            correlation_id = %ctx.correlation()
        );
        let result = AssertUnwindSafe(work())
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        let end_time = Utc::now();
        let completion = match result {
            Ok(Ok(next)) => {
                let completion = Completion::succeeded(end_time);
                match next.or(loopback) {
                    Some(next) => completion.with_payload(next.into_inner()),
                    None => completion,
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "verb failed");
                e.completion(end_time, loopback.as_ref())
            }
            Err(_) => {
                let e = OperationError::Internal(anyhow::anyhow!("verb handler panicked"));
                error!(error = %e, "verb handler died");
                e.completion(end_time, loopback.as_ref())
            }
        };

        let id = details.id.clone();
        let recorded = record_completion(&self.registry, &id, kind, completion)
            .or_else(|| self.registry.get(&id))
            .unwrap_or(details);
        verb_outcome(&recorded)
    }
}

fn payload_of(loopback: Option<&LoopbackContext>) -> Option<String> {
    loopback.map(|l| l.as_str().to_string())
}

fn recorded_status(details: &OperationDetails) -> StatusCode {
    details
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Verb response for an operation: 202 while running or after success, the
/// recorded code after failure or cancellation.
fn verb_outcome(details: &OperationDetails) -> VerbOutcome {
    let status = match details.status {
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => recorded_status(details),
        ExecutionStatus::NotStarted | ExecutionStatus::Running | ExecutionStatus::Succeeded => {
            StatusCode::ACCEPTED
        }
    };
    VerbOutcome::new(status, OperationResponse::from_details(details))
}
