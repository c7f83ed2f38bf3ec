//! Supervised execution of asynchronous operations.
//!
//! Every worker runs in its own tokio task. A second, supervising task awaits
//! the worker's `JoinHandle` and always writes a terminal state to the
//! registry, whether the worker returned, failed, was cancelled or panicked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use plugin_core::{Completion, LoopbackContext, OperationDetails, OperationKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::operation::OperationError;
use super::registry::OperationRegistry;
use crate::network::shutdown::ShutdownController;

/// Writes a terminal state and counts it. Returns `None` if the registry
/// refused the update (unknown id or already terminal); that is logged, not
/// propagated, because there is no caller left to report it to.
pub(crate) fn record_completion(
    registry: &OperationRegistry,
    id: &str,
    kind: OperationKind,
    completion: Completion,
) -> Option<OperationDetails> {
    let status = completion.status;
    match registry.complete(id, completion) {
        Ok(details) => {
            metrics::counter!(
                "plugin_operations_completed_total",
                "kind" => kind.as_str(),
                "status" => status.as_str()
            )
            .increment(1);
            Some(details)
        }
        Err(e) => {
            error!(operation_id = %id, error = %e, "failed to record operation completion");
            None
        }
    }
}

/// Owns the cancellation tokens of running async operations and the tasks
/// that complete them.
pub struct Supervisor {
    registry: Arc<OperationRegistry>,
    shutdown: Arc<ShutdownController>,
    node_id: Arc<str>,
    root: CancellationToken,
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        shutdown: Arc<ShutdownController>,
        node_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            registry,
            shutdown,
            node_id: node_id.into(),
            root: CancellationToken::new(),
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Runs `work` for the already registered operation `details`.
    ///
    /// `work` receives a token that is cancelled by [`cancel`](Self::cancel)
    /// or [`cancel_all`](Self::cancel_all). `loopback` is the context the
    /// operation started with; a failure stamps its error code into it.
    pub fn spawn<F, Fut>(
        &self,
        details: &OperationDetails,
        correlation_id: &str,
        loopback: Option<LoopbackContext>,
        work: F,
    ) where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        let id = details.id.clone();
        let kind = details.kind;
        let token = self.root.child_token();
        self.tokens.insert(id.clone(), token.clone());

        let span = info_span!(
            "operation",
            node_id = %self.node_id,
            operation_id = %id,
            kind = %kind,
            correlation_id = %correlation_id
        );
        let worker = tokio::spawn(work(token.clone()).instrument(span.clone()));

        let guard = self.shutdown.in_flight_guard();
        let registry = Arc::clone(&self.registry);
        let tokens = Arc::clone(&self.tokens);
        tokio::spawn(
            async move {
                let _guard = guard;
                let joined = worker.await;

                let end_time = Utc::now();
                let completion = match joined {
                    Ok(Ok(())) => {
                        info!("operation succeeded");
                        Completion::succeeded(end_time)
                    }
                    Ok(Err(e)) => {
                        let e = if token.is_cancelled() && !e.is_cancelled() {
                            OperationError::Cancelled
                        } else {
                            e
                        };
                        if e.is_cancelled() {
                            info!("operation cancelled");
                        } else {
                            warn!(error = %e, "operation failed");
                        }
                        e.completion(end_time, loopback.as_ref())
                    }
                    Err(join_error) => {
                        let e = if join_error.is_panic() {
                            OperationError::Internal(anyhow::anyhow!("operation worker panicked"))
                        } else {
                            OperationError::Internal(anyhow::anyhow!("operation worker was aborted"))
                        };
                        error!(error = %e, "operation worker died");
                        e.completion(end_time, loopback.as_ref())
                    }
                };
                record_completion(&registry, &id, kind, completion);
                // Cancellable until the terminal state is visible.
                tokens.remove(&id);
            }
            .instrument(span),
        );
    }

    /// Requests cancellation of a running async operation. Returns `false` if
    /// no worker runs under `id`.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                info!(operation_id = %id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancels every running worker.
    pub fn cancel_all(&self) {
        let running = self.tokens.len();
        self.root.cancel();
        if running > 0 {
            warn!(running, "cancelling all running operations");
        }
    }

    /// Number of workers not yet completed.
    #[must_use]
    pub fn running(&self) -> usize {
        self.tokens.len()
    }

    /// Waits up to `timeout` for running workers, then cancels the rest and
    /// waits up to `grace` for them to record their cancellation. Returns
    /// `true` if every worker finished.
    pub async fn drain(&self, timeout: Duration, grace: Duration) -> bool {
        if self.shutdown.wait_for_drain(timeout).await {
            return true;
        }
        self.cancel_all();
        self.shutdown.wait_for_drain(grace).await
    }
}

#[cfg(test)]
mod tests {
    use plugin_core::{error_codes, ExecutionStatus};

    use super::*;

    fn setup() -> (Arc<OperationRegistry>, Arc<ShutdownController>, Supervisor) {
        let registry = Arc::new(OperationRegistry::default());
        let shutdown = Arc::new(ShutdownController::new());
        let supervisor = Supervisor::new(Arc::clone(&registry), Arc::clone(&shutdown), "node-a");
        (registry, shutdown, supervisor)
    }

    fn register(registry: &OperationRegistry, id: &str) -> OperationDetails {
        registry
            .register(id, OperationKind::Backup, Utc::now(), None)
            .unwrap()
    }

    async fn wait_terminal(registry: &OperationRegistry, id: &str) -> OperationDetails {
        for _ in 0..200 {
            let op = registry.get(id).unwrap();
            if op.is_terminal() {
                return op;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {id} never completed");
    }

    async fn explode() -> Result<(), OperationError> {
        panic!("worker exploded");
    }

    #[tokio::test]
    async fn success_is_recorded() {
        let (registry, shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |_| async { Ok(()) });

        let op = wait_terminal(&registry, "op1").await;
        assert_eq!(op.status, ExecutionStatus::Succeeded);
        assert!(shutdown.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn failure_is_recorded_with_stamped_loopback() {
        let (registry, _shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |_| async {
            Err(OperationError::DataPlane(anyhow::anyhow!("source gone")))
        });

        let op = wait_terminal(&registry, "op1").await;
        assert_eq!(op.status, ExecutionStatus::Failed);
        assert_eq!(op.status_code, Some(500));
        assert_eq!(op.error.unwrap().code, error_codes::DATA_PLANE_FAILURE);
        let loopback = LoopbackContext::from(op.payload.unwrap());
        assert_eq!(
            loopback.error_code().as_deref(),
            Some(error_codes::DATA_PLANE_FAILURE)
        );
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let (registry, shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |_| explode());

        let op = wait_terminal(&registry, "op1").await;
        assert_eq!(op.status, ExecutionStatus::Failed);
        assert_eq!(op.error.unwrap().code, error_codes::INTERNAL);
        assert!(shutdown.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn cancel_reaches_worker() {
        let (registry, _shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |token| async move {
            token.cancelled().await;
            Err(OperationError::Cancelled)
        });

        assert!(supervisor.cancel("op1"));
        assert!(!supervisor.cancel("other"));
        let op = wait_terminal(&registry, "op1").await;
        assert_eq!(op.status, ExecutionStatus::Cancelled);
        assert_eq!(op.status_code, Some(200));
    }

    #[tokio::test]
    async fn drain_cancels_stragglers() {
        let (registry, _shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |token| async move {
            token.cancelled().await;
            Err(OperationError::Internal(anyhow::anyhow!("interrupted")))
        });

        let drained = supervisor
            .drain(Duration::from_millis(20), Duration::from_secs(1))
            .await;
        assert!(drained);
        // A failure after cancellation was requested is recorded as cancelled.
        let op = registry.get("op1").unwrap();
        assert_eq!(op.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_is_accepted_until_terminal_state_is_recorded() {
        let (registry, _shutdown, supervisor) = setup();
        let details = register(&registry, "op1");
        supervisor.spawn(&details, "-", None, |_| async { Ok(()) });

        for _ in 0..10_000 {
            if !supervisor.cancel("op1") {
                assert!(registry.get("op1").unwrap().is_terminal());
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("worker never finished");
    }
}
