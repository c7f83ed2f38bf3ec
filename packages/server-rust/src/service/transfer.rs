//! Data movement for the asynchronous verbs.
//!
//! A backup pulls streams from the source data plane and writes them into a new
//! Pit; a restore reopens a committed Pit and pushes every stream back. Byte
//! copying is blocking and runs under `spawn_blocking`. Cancellation is checked
//! between storage units, between streams and between copy chunks.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use plugin_core::{BackupRequest, PitFormatType, RestoreRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::operation::OperationError;
use crate::storage::{PitError, PitFormatReader, PitFormatWriter, PitStoreFactory};
use crate::traits::{BackupPlan, RestoreItem, SourceDataplane};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Runs blocking storage work off the async executor. A panic inside `work`
/// is resumed on the calling task.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, OperationError>
where
    F: FnOnce() -> Result<T, OperationError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(OperationError::Internal(anyhow::anyhow!(
            "blocking task failed: {e}"
        ))),
    }
}

fn ensure_running(token: &CancellationToken) -> Result<(), OperationError> {
    if token.is_cancelled() {
        Err(OperationError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleeps for `delay` unless cancelled first.
async fn simulated_work(delay: Duration, token: &CancellationToken) -> Result<(), OperationError> {
    if delay.is_zero() {
        return ensure_running(token);
    }
    tokio::select! {
        () = token.cancelled() => Err(OperationError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Copies `reader` into `writer` chunk by chunk, stopping at cancellation.
/// Read failures are the source's; write failures are the store's.
fn copy_chunks(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<u64, OperationError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        ensure_running(token)?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(OperationError::DataPlane(
                    anyhow::Error::new(e).context("reading source stream"),
                ))
            }
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| OperationError::Pit(PitError::Io(e)))?;
        total += n as u64;
    }
}

/// Forwards reads until the token is cancelled, then fails every read.
struct CancellableReader<'a> {
    inner: &'a mut dyn Read,
    token: &'a CancellationToken,
}

impl Read for CancellableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Everything one backup worker needs, moved into its task.
pub(crate) struct BackupJob {
    pub stores: Arc<PitStoreFactory>,
    pub dataplane: Arc<dyn SourceDataplane>,
    pub request: BackupRequest,
    pub recovery_point_id: String,
    pub format: PitFormatType,
    pub copy_buffer_size: usize,
    pub simulated_delay: Duration,
}

impl BackupJob {
    pub(crate) async fn run(self, token: CancellationToken) -> Result<(), OperationError> {
        simulated_work(self.simulated_delay, &token).await?;
        let plan = self
            .dataplane
            .backup(
                &self.request.datasource,
                self.request.loop_back_context.as_ref(),
            )
            .await?;
        ensure_running(&token)?;

        blocking(move || self.write(plan, &token)).await
    }

    fn write(self, plan: BackupPlan, token: &CancellationToken) -> Result<(), OperationError> {
        let store = self.stores.resolve(self.request.datastore_id())?;
        let mut pit = store.create(
            &self.recovery_point_id,
            self.format,
            self.request.backup_type,
        )?;
        pit.set_tag_info(self.request.tag_info.clone())?;
        pit.set_policy_info(self.request.policy_info.clone())?;
        pit.set_plugin_metadata(plan.plugin_metadata.clone())?;

        let writer = pit.writer();
        let written = write_streams(&writer, plan, self.copy_buffer_size, token);
        match writer.cleanup_storage_units() {
            Ok(removed) if removed > 0 => debug!(removed, "removed partial stream blobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "storage unit cleanup failed"),
        }
        let bytes = written?;

        ensure_running(token)?;
        pit.set_end_time(Utc::now())?;
        let record = pit.commit()?;
        info!(
            recovery_point_id = %record.id,
            datastore = %store.datastore_id(),
            bytes,
            "backup committed"
        );
        Ok(())
    }
}

fn write_streams(
    writer: &PitFormatWriter,
    plan: BackupPlan,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<u64, OperationError> {
    let mut total = 0;
    for unit in plan.units {
        ensure_running(token)?;
        let expected = u32::try_from(unit.streams.len()).map_err(|_| {
            OperationError::Internal(anyhow::anyhow!(
                "storage unit {} has too many streams",
                unit.name
            ))
        })?;
        writer.add_storage_unit(&unit.name, expected)?;

        for mut stream in unit.streams {
            ensure_running(token)?;
            let mut channel = writer.create_stream(&stream.name)?;
            total += copy_chunks(&mut stream.reader, &mut channel, buffer_size, token)?;
            channel.close()?;
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Everything one restore worker needs, moved into its task.
pub(crate) struct RestoreJob {
    pub stores: Arc<PitStoreFactory>,
    pub dataplane: Arc<dyn SourceDataplane>,
    pub request: RestoreRequest,
    pub simulated_delay: Duration,
}

impl RestoreJob {
    pub(crate) async fn run(self, token: CancellationToken) -> Result<(), OperationError> {
        if self.request.restore_to_rp_id.trim().is_empty() {
            return Err(OperationError::validation("restoreToRPId is required"));
        }
        simulated_work(self.simulated_delay, &token).await?;
        blocking(move || self.read(&token)).await
    }

    fn read(self, token: &CancellationToken) -> Result<(), OperationError> {
        let store = self.stores.resolve(self.request.datastore_id())?;
        let mut reader = store.reader(&self.request.restore_to_rp_id)?;

        let restored = self.restore_streams(&reader, token);
        reader.cleanup_storage_units();
        let count = restored?;

        info!(
            recovery_point_id = %self.request.restore_to_rp_id,
            streams = count,
            "restore finished"
        );
        Ok(())
    }

    fn restore_streams(
        &self,
        reader: &PitFormatReader,
        token: &CancellationToken,
    ) -> Result<usize, OperationError> {
        let mut occurrences: HashMap<(String, String), usize> = HashMap::new();
        let mut count = 0;
        for (unit, streams) in reader.stream_info() {
            for name in streams {
                ensure_running(token)?;
                let slot = occurrences.entry((unit.clone(), name.clone())).or_default();
                let index = *slot;
                *slot += 1;

                let mut channel = reader.open_unit_stream(&unit, &name, index)?;
                let item = RestoreItem {
                    storage_unit: unit.clone(),
                    stream: name,
                    index,
                };
                {
                    let mut source = CancellableReader {
                        inner: &mut channel,
                        token,
                    };
                    self.dataplane
                        .restore(&self.request.target_datasource, &item, &mut source)
                        .map_err(|e| {
                            if token.is_cancelled() {
                                OperationError::Cancelled
                            } else {
                                OperationError::DataPlane(e)
                            }
                        })?;
                }
                // Drains whatever the data plane left unread and verifies the stream.
                channel.finish()?;
                count += 1;
            }
        }
        Ok(count)
    }
}
