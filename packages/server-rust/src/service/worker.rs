//! Background maintenance worker.
//!
//! `BackgroundWorker<R>` drives a [`BackgroundRunnable`] from an mpsc channel
//! plus a periodic tick. The service runs one instance with [`PurgeRunnable`],
//! which drops terminal operations whose purge time has passed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::registry::OperationRegistry;

const TASK_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

/// On-demand maintenance requests.
#[derive(Debug)]
pub enum MaintenanceTask {
    /// Purge expired operations now instead of waiting for the next tick.
    PurgeExpired,
    /// Purge as if the clock read `now`.
    PurgeExpiredAt { now: DateTime<Utc> },
}

/// Removes terminal operations past their purge time.
pub struct PurgeRunnable {
    registry: Arc<OperationRegistry>,
    purged: usize,
}

impl PurgeRunnable {
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            registry,
            purged: 0,
        }
    }

    fn purge(&mut self, now: DateTime<Utc>) {
        let removed = self.registry.purge_expired(now);
        self.purged += removed;
        if removed > 0 {
            info!(removed, remaining = self.registry.len(), "purged expired operations");
        } else {
            debug!("no expired operations");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for PurgeRunnable {
    type Task = MaintenanceTask;

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::PurgeExpired => self.purge(Utc::now()),
            MaintenanceTask::PurgeExpiredAt { now } => self.purge(now),
        }
    }

    async fn on_tick(&mut self) {
        self.purge(Utc::now());
    }

    async fn shutdown(&mut self) {
        info!(purged = self.purged, "purge worker stopped");
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs a [`BackgroundRunnable`] on its own tokio task until stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. `on_tick` first fires one `tick` after start.
    #[must_use]
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Signals shutdown and waits for the worker task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
