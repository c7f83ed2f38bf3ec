//! Forward-only stream channels.
//!
//! A [`WritableChannel`] forwards bytes straight into a blob and records the
//! stream in the manifest only when explicitly closed. A channel dropped without
//! `close()` deletes its blob and leaves the manifest untouched, so every exit
//! path releases the storage unit slot. A [`ReadableChannel`] verifies length
//! and digest when it reaches end of stream.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use plugin_core::StreamEntry;
use tracing::debug;

use crate::storage::engine::{BlobStore, BlobWriter};
use crate::storage::error::PitError;
use crate::storage::pit_store::WriteSession;

// ---------------------------------------------------------------------------
// WritableChannel
// ---------------------------------------------------------------------------

/// Sink for one stream of a Pit being written. Implements [`Write`] but not
/// `Seek`.
pub struct WritableChannel {
    session: Arc<Mutex<WriteSession>>,
    engine: Arc<dyn BlobStore>,
    blob: Option<Box<dyn BlobWriter>>,
    key: String,
    name: String,
    unit_index: usize,
    hasher: blake3::Hasher,
    written: u64,
    closed: bool,
}

impl WritableChannel {
    pub(crate) fn new(
        session: Arc<Mutex<WriteSession>>,
        engine: Arc<dyn BlobStore>,
        blob: Box<dyn BlobWriter>,
        key: String,
        name: String,
        unit_index: usize,
    ) -> Self {
        Self {
            session,
            engine,
            blob: Some(blob),
            key,
            name,
            unit_index,
            hasher: blake3::Hasher::new(),
            written: 0,
            closed: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Seals the blob and appends the stream to its storage unit.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the blob cannot be sealed, or
    /// [`PitError::SessionAborted`] if the Pit was dropped meanwhile. In both
    /// cases the blob is deleted and the stream is not recorded.
    pub fn close(mut self) -> Result<StreamEntry, PitError> {
        let Some(blob) = self.blob.take() else {
            return Err(PitError::ChannelOpen);
        };
        blob.seal()?;

        let entry = StreamEntry {
            name: self.name.clone(),
            length: self.written,
            digest: self.hasher.finalize().to_hex().to_string(),
        };

        {
            let mut session = self.session.lock();
            session.ensure_writable("close a stream of")?;
            let unit = session
                .record
                .manifest
                .storage_units
                .get_mut(self.unit_index)
                .ok_or(PitError::NoStorageUnit)?;
            unit.streams.push(entry.clone());
            session.open_channel = None;
        }

        self.closed = true;
        metrics::counter!("pit_bytes_written_total").increment(entry.length);
        debug!(stream = %entry.name, bytes = entry.length, "stream closed");
        Ok(entry)
    }
}

impl Write for WritableChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let blob = self
            .blob
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed"))?;
        let n = blob.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.blob.as_mut() {
            Some(blob) => blob.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WritableChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        drop(self.blob.take());
        if let Err(e) = self.engine.delete(&self.key) {
            debug!(key = %self.key, error = %e, "failed to delete abandoned stream blob");
        }
        let mut session = self.session.lock();
        if session.open_channel.as_deref() == Some(self.key.as_str()) {
            session.open_channel = None;
        }
    }
}

// ---------------------------------------------------------------------------
// ReadableChannel
// ---------------------------------------------------------------------------

/// Source for one committed stream. Implements [`Read`] but not `Seek`.
///
/// At end of stream the byte count and BLAKE3 digest are checked against the
/// manifest; a mismatch surfaces as [`io::ErrorKind::InvalidData`].
pub struct ReadableChannel {
    inner: Box<dyn Read + Send>,
    entry: StreamEntry,
    hasher: blake3::Hasher,
    read: u64,
    verified: bool,
    open_channels: Arc<AtomicUsize>,
}

impl ReadableChannel {
    pub(crate) fn new(
        inner: Box<dyn Read + Send>,
        entry: StreamEntry,
        open_channels: Arc<AtomicUsize>,
    ) -> Self {
        open_channels.fetch_add(1, Ordering::Relaxed);
        Self {
            inner,
            entry,
            hasher: blake3::Hasher::new(),
            read: 0,
            verified: false,
            open_channels,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Length recorded at commit.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.entry.length
    }

    /// Reads whatever is left, verifies the stream and returns its total length.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on read failure or verification mismatch.
    pub fn finish(mut self) -> Result<u64, PitError> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(self.read)
    }

    fn verify(&self) -> io::Result<()> {
        if self.read != self.entry.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "stream {} ended after {} of {} bytes",
                    self.entry.name, self.read, self.entry.length
                ),
            ));
        }
        let digest = self.hasher.finalize().to_hex();
        if digest.as_str() != self.entry.digest {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream {} digest mismatch", self.entry.name),
            ));
        }
        Ok(())
    }
}

impl Read for ReadableChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.verified || buf.is_empty() {
            return Ok(0);
        }

        let n = self.inner.read(buf)?;
        if n == 0 {
            self.verify()?;
            self.verified = true;
            return Ok(0);
        }

        self.read += n as u64;
        if self.read > self.entry.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream {} is longer than recorded", self.entry.name),
            ));
        }
        self.hasher.update(&buf[..n]);
        metrics::counter!("pit_bytes_read_total").increment(n as u64);
        Ok(n)
    }
}

impl Drop for ReadableChannel {
    fn drop(&mut self) {
        self.open_channels.fetch_sub(1, Ordering::Relaxed);
    }
}
