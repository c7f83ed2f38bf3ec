//! In-memory [`BlobStore`] implementation backed by [`DashMap`].
//!
//! Suitable for development and tests. Blobs are held as [`Bytes`] so readers
//! share the sealed buffer without copying.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::storage::engine::{BlobStore, BlobWriter};

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Arc<DashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, blobs and objects alike.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn under(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

struct MemoryBlobWriter {
    key: String,
    buffer: Vec<u8>,
    entries: Arc<DashMap<String, Bytes>>,
}

impl Write for MemoryBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryBlobWriter {
    fn seal(self: Box<Self>) -> io::Result<u64> {
        let len = self.buffer.len() as u64;
        self.entries.insert(self.key, Bytes::from(self.buffer));
        Ok(len)
    }
}

impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create_blob(&self, key: &str) -> io::Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            key: key.to_string(),
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }

    fn open_blob(&self, key: &str) -> io::Result<Box<dyn Read + Send>> {
        let bytes = self
            .entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no blob at {key}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn put_object(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.entries
            .insert(key.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn get_object(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().to_vec()))
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| under(prefix, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn delete_prefix(&self, prefix: &str) -> io::Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !under(prefix, key));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_blob_is_readable() {
        let store = MemoryBlobStore::new();
        let mut writer = store.create_blob("a/b/0").unwrap();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();

        assert!(store.open_blob("a/b/0").is_err(), "unsealed blob must be invisible");
        assert_eq!(writer.seal().unwrap(), 11);

        let mut out = String::new();
        store
            .open_blob("a/b/0")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn dropped_writer_stores_nothing() {
        let store = MemoryBlobStore::new();
        let mut writer = store.create_blob("k").unwrap();
        writer.write_all(b"partial").unwrap();
        drop(writer);
        assert!(store.is_empty());
    }

    #[test]
    fn missing_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.open_blob("nope").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn prefix_listing_and_deletion() {
        let store = MemoryBlobStore::new();
        store.put_object("sessions/rp1/s1/0/0", b"x").unwrap();
        store.put_object("sessions/rp1/s1/0/1", b"y").unwrap();
        store.put_object("sessions/rp10/s2/0/0", b"z").unwrap();
        store.put_object("catalog/rp1.pit", b"c").unwrap();

        assert_eq!(
            store.list("sessions/rp1").unwrap(),
            vec!["sessions/rp1/s1/0/0", "sessions/rp1/s1/0/1"]
        );
        assert_eq!(store.list("sessions").unwrap().len(), 3);

        assert_eq!(store.delete_prefix("sessions/rp1").unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert!(store.delete("catalog/rp1.pit").unwrap());
        assert!(!store.delete("catalog/rp1.pit").unwrap());
    }

    #[test]
    fn objects_round_trip() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get_object("catalog/x.pit").unwrap(), None);
        store.put_object("catalog/x.pit", b"v1").unwrap();
        store.put_object("catalog/x.pit", b"v2").unwrap();
        assert_eq!(store.get_object("catalog/x.pit").unwrap(), Some(b"v2".to_vec()));
    }
}
