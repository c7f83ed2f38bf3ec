//! Stream-multiplexing writer over one Pit write session.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use plugin_core::{PitState, StorageUnitEntry};
use tracing::debug;

use super::channel::WritableChannel;
use crate::storage::error::PitError;
use crate::storage::pit_store::{PitStore, WriteSession};

/// Writes named streams into named storage units of one Pit.
///
/// Streams go into the most recently added storage unit, strictly one at a
/// time. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct PitFormatWriter {
    store: Arc<PitStore>,
    session: Arc<Mutex<WriteSession>>,
}

impl PitFormatWriter {
    pub(crate) fn new(store: Arc<PitStore>, session: Arc<Mutex<WriteSession>>) -> Self {
        Self { store, session }
    }

    /// Registers a new storage unit that will hold `expected_stream_count` streams.
    ///
    /// # Errors
    ///
    /// - [`PitError::InvalidState`] after commit
    /// - [`PitError::ChannelOpen`] while a stream of the current unit is open
    /// - [`PitError::InvalidName`], [`PitError::DuplicateStorageUnit`] or
    ///   [`PitError::InvalidStreamCount`] for a bad unit
    pub fn add_storage_unit(&self, name: &str, expected_stream_count: u32) -> Result<(), PitError> {
        self.store.validate_name("storage unit", name)?;

        let mut session = self.session.lock();
        session.ensure_writable("add a storage unit to")?;
        if session.open_channel.is_some() {
            return Err(PitError::ChannelOpen);
        }
        if session.record.manifest.unit(name).is_some() {
            return Err(PitError::DuplicateStorageUnit {
                unit: name.to_string(),
            });
        }
        if expected_stream_count == 0 {
            return Err(PitError::InvalidStreamCount {
                unit: name.to_string(),
            });
        }

        session
            .record
            .manifest
            .storage_units
            .push(StorageUnitEntry::new(name, expected_stream_count));
        session.record.state = PitState::Writing;
        debug!(unit = %name, expected_stream_count, "storage unit added");
        Ok(())
    }

    /// Opens a channel for the next stream of the current storage unit.
    ///
    /// The stream only counts once the channel is closed.
    ///
    /// # Errors
    ///
    /// - [`PitError::InvalidState`] after commit
    /// - [`PitError::ChannelOpen`] while another channel is open
    /// - [`PitError::NoStorageUnit`] or [`PitError::StorageUnitFull`] if the
    ///   current unit cannot take another stream
    pub fn create_stream(&self, name: &str) -> Result<WritableChannel, PitError> {
        self.store.validate_name("stream", name)?;

        let mut session = self.session.lock();
        session.ensure_writable("create a stream in")?;
        if session.open_channel.is_some() {
            return Err(PitError::ChannelOpen);
        }

        let unit_index = session
            .record
            .manifest
            .storage_units
            .len()
            .checked_sub(1)
            .ok_or(PitError::NoStorageUnit)?;
        let unit = &session.record.manifest.storage_units[unit_index];
        if unit.is_full() {
            return Err(PitError::StorageUnitFull {
                unit: unit.name.clone(),
                expected: unit.expected_stream_count,
            });
        }

        let key = session.record.stream_key(unit_index, unit.streams.len());
        let engine = self.store.engine();
        let blob = engine.create_blob(&key)?;
        session.open_channel = Some(key.clone());

        Ok(WritableChannel::new(
            Arc::clone(&self.session),
            engine,
            blob,
            key,
            name.to_string(),
            unit_index,
        ))
    }

    /// `(storage unit, stream names)` recorded so far, in write order.
    #[must_use]
    pub fn stream_info(&self) -> Vec<(String, Vec<String>)> {
        self.session.lock().record.manifest.stream_info()
    }

    /// Deletes session blobs that no recorded stream owns, such as leftovers of
    /// streams that failed partway. Safe to call at any point and any number of
    /// times; returns the number of blobs removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the engine cannot list or delete.
    pub fn cleanup_storage_units(&self) -> Result<usize, PitError> {
        let session = self.session.lock();
        if session.aborted {
            return Ok(0);
        }

        let record = &session.record;
        let mut owned: HashSet<String> = record
            .manifest
            .storage_units
            .iter()
            .enumerate()
            .flat_map(|(u, unit)| (0..unit.streams.len()).map(move |o| (u, o)))
            .map(|(u, o)| record.stream_key(u, o))
            .collect();
        if let Some(open) = &session.open_channel {
            owned.insert(open.clone());
        }

        let engine = self.store.engine();
        let mut removed = 0;
        for key in engine.list(&record.session_prefix())? {
            if !owned.contains(&key) && engine.delete(&key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(recovery_point_id = %record.id, removed, "cleaned up storage unit leftovers");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use plugin_core::{BackupType, PitFormatType};

    use super::*;
    use crate::storage::engine::BlobStore;
    use crate::storage::engines::{FsBlobStore, MemoryBlobStore};
    use crate::storage::pit_store::Pit;

    fn new_pit() -> (Arc<MemoryBlobStore>, Arc<PitStore>, Pit) {
        let engine = Arc::new(MemoryBlobStore::new());
        let store = PitStore::new("default", engine.clone()).unwrap();
        let pit = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        (engine, store, pit)
    }

    #[test]
    fn unit_rules() {
        let (_engine, _store, pit) = new_pit();
        let writer = pit.writer();

        assert!(matches!(
            writer.create_stream("S1"),
            Err(PitError::NoStorageUnit)
        ));
        assert!(matches!(
            writer.add_storage_unit("U1", 0),
            Err(PitError::InvalidStreamCount { .. })
        ));
        assert_eq!(pit.state(), PitState::Initializing);

        writer.add_storage_unit("U1", 1).unwrap();
        assert_eq!(pit.state(), PitState::Writing);
        assert!(matches!(
            writer.add_storage_unit("U1", 1),
            Err(PitError::DuplicateStorageUnit { .. })
        ));
    }

    #[test]
    fn full_unit_rejects_streams() {
        let (_engine, _store, pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();
        writer.create_stream("S1").unwrap().close().unwrap();

        assert!(matches!(
            writer.create_stream("S2"),
            Err(PitError::StorageUnitFull { expected: 1, .. })
        ));
    }

    #[test]
    fn one_channel_at_a_time() {
        let (_engine, _store, mut pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 2).unwrap();

        let first = writer.create_stream("S1").unwrap();
        assert!(matches!(writer.create_stream("S2"), Err(PitError::ChannelOpen)));
        assert!(matches!(pit.commit(), Err(PitError::ChannelOpen)));
        first.close().unwrap();

        writer.create_stream("S2").unwrap().close().unwrap();
        pit.commit().unwrap();
    }

    #[test]
    fn dropped_channel_is_not_recorded() {
        let (engine, _store, pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();

        {
            let mut channel = writer.create_stream("S1").unwrap();
            channel.write_all(b"half a stre").unwrap();
        }
        assert_eq!(writer.stream_info(), vec![("U1".to_string(), Vec::new())]);
        assert!(engine.is_empty());

        // The slot is free again.
        let mut channel = writer.create_stream("S1").unwrap();
        channel.write_all(b"whole").unwrap();
        assert_eq!(channel.close().unwrap().length, 5);
    }

    #[test]
    fn writes_after_commit_are_protocol_errors() {
        let (_engine, _store, mut pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();
        writer.create_stream("S1").unwrap().close().unwrap();
        pit.commit().unwrap();

        assert!(matches!(
            writer.add_storage_unit("U2", 1),
            Err(PitError::InvalidState {
                state: PitState::Committed,
                ..
            })
        ));
        assert!(matches!(
            writer.create_stream("S2"),
            Err(PitError::InvalidState { .. })
        ));
    }

    #[test]
    fn cleanup_removes_only_unowned_blobs() {
        let (engine, _store, pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 2).unwrap();
        writer.create_stream("S1").unwrap().close().unwrap();

        let session_prefix = pit.record().session_prefix();
        engine
            .put_object(&format!("{session_prefix}/9/9"), b"stray")
            .unwrap();

        assert_eq!(writer.cleanup_storage_units().unwrap(), 1);
        assert_eq!(writer.cleanup_storage_units().unwrap(), 0);
        assert_eq!(engine.list(&session_prefix).unwrap().len(), 1);
    }

    #[test]
    fn writer_outliving_pit_is_rejected() {
        let (_engine, _store, pit) = new_pit();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();
        drop(pit);

        assert!(matches!(
            writer.create_stream("S1"),
            Err(PitError::SessionAborted { .. })
        ));
        assert_eq!(writer.cleanup_storage_units().unwrap(), 0);
    }

    #[test]
    fn open_stream_survives_unit_switch_attempt_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(dir.path()).unwrap());
        let store = PitStore::new("default", engine).unwrap();
        let mut pit = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();

        let mut first = writer.create_stream("S1").unwrap();
        assert!(matches!(
            writer.add_storage_unit("U2", 1),
            Err(PitError::ChannelOpen)
        ));
        assert_eq!(writer.cleanup_storage_units().unwrap(), 0);
        first.write_all(b"hello").unwrap();
        first.close().unwrap();

        writer.add_storage_unit("U2", 1).unwrap();
        writer.create_stream("S2").unwrap().close().unwrap();
        assert_eq!(writer.cleanup_storage_units().unwrap(), 0);
        pit.commit().unwrap();

        let reader = store.reader("rp1").unwrap();
        assert_eq!(
            reader.stream_info(),
            vec![
                ("U1".to_string(), vec!["S1".to_string()]),
                ("U2".to_string(), vec!["S2".to_string()]),
            ]
        );
        let mut channel = reader.open_stream("S1", 0).unwrap();
        let mut content = String::new();
        channel.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(channel.finish().unwrap(), 5);
    }
}
