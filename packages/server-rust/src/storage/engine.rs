//! Low-level blob engine trait.
//!
//! Defines [`BlobStore`], the innermost storage layer. Implementations store
//! forward-only byte blobs (stream content) and small atomic objects (catalog
//! entries) under `/`-separated keys. All operations are synchronous and meant
//! to run on blocking threads.

use std::io::{self, Read, Write};

/// Sink for one blob being written.
///
/// The blob becomes readable only after [`seal`](BlobWriter::seal). Dropping an
/// unsealed writer leaves at most a partial blob that callers must delete.
pub trait BlobWriter: Write + Send {
    /// Flushes and durably stores the blob, returning its total length.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the final flush or sync fails.
    fn seal(self: Box<Self>) -> io::Result<u64>;
}

/// Layer 1 of Pit storage: keyed blobs and atomic objects.
///
/// Wrapped in `Arc<dyn BlobStore>` so the catalog layer, writers and readers
/// can share it across threads.
pub trait BlobStore: Send + Sync + 'static {
    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Starts a new blob at `key`, replacing any existing blob there once sealed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the blob cannot be created.
    fn create_blob(&self, key: &str) -> io::Result<Box<dyn BlobWriter>>;

    /// Opens a sealed blob for sequential reading.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] if no blob exists at `key`.
    fn open_blob(&self, key: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Writes a small object so that readers observe either the old content or
    /// the new content, never a partial write.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the object cannot be written.
    fn put_object(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

    /// Reads a whole object, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for failures other than absence.
    fn get_object(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Every key stored under the directory-style `prefix` (no trailing `/`),
    /// sorted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listing fails.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Removes one key. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for failures other than absence.
    fn delete(&self, key: &str) -> io::Result<bool>;

    /// Removes every key under the directory-style `prefix`. Returns the number
    /// of keys removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if removal fails.
    fn delete_prefix(&self, prefix: &str) -> io::Result<usize>;
}

/// Joins key segments with `/`.
#[must_use]
pub fn join_key(segments: &[&str]) -> String {
    segments.join("/")
}
