//! Layer 2 of Pit storage: the catalog of Pit records and their write sessions.
//!
//! [`PitStore`] creates, commits, opens and garbage-collects Pit records. A
//! record id has at most one write session at a time, and a committed id can
//! never be created again. Commit publishes the catalog entry before the record
//! becomes visible to [`PitStore::open`], so a concurrent reader sees either no
//! record or the complete one.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use plugin_core::{BackupType, PitFormatType, PitState, PolicyInfo, RetentionTagInfo};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::BlobStore;
use super::error::PitError;
use super::format::{PitFormatReader, PitFormatWriter};
use super::record::{
    catalog_key, session_prefix, PitRecord, CATALOG_EXTENSION, CATALOG_PREFIX, SESSIONS_PREFIX,
};

/// Pattern every recovery-point, storage-unit, stream and datastore name must match.
pub const NAME_PATTERN: &str = "^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

// ---------------------------------------------------------------------------
// PitStore
// ---------------------------------------------------------------------------

/// Catalog of Pit records for one datastore.
pub struct PitStore {
    datastore_id: String,
    engine: Arc<dyn BlobStore>,
    names: Regex,
    /// Committed records by recovery-point id.
    catalog: DashMap<String, Arc<PitRecord>>,
    /// Active write sessions: recovery-point id to session id.
    sessions: DashMap<String, String>,
}

impl PitStore {
    /// Creates an empty store over `engine` without reading anything from it.
    ///
    /// # Errors
    ///
    /// Returns [`PitError::InvalidName`] if `datastore_id` is not a valid name.
    pub fn new(
        datastore_id: impl Into<String>,
        engine: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>, PitError> {
        let store = Self {
            datastore_id: datastore_id.into(),
            engine,
            names: Regex::new(NAME_PATTERN)?,
            catalog: DashMap::new(),
            sessions: DashMap::new(),
        };
        store.validate_name("datastore", &store.datastore_id)?;
        Ok(Arc::new(store))
    }

    /// Opens a store over an engine that may already hold data.
    ///
    /// Reloads every committed catalog entry, then deletes session blobs that
    /// no committed record references (leftovers of writers that never
    /// committed, e.g. after a crash). Unreadable catalog entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be listed or read.
    pub fn open_existing(
        datastore_id: impl Into<String>,
        engine: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>, PitError> {
        let store = Self::new(datastore_id, engine)?;

        for key in store.engine.list(CATALOG_PREFIX)? {
            if !key.ends_with(CATALOG_EXTENSION) {
                continue;
            }
            let Some(bytes) = store.engine.get_object(&key)? else {
                continue;
            };
            match PitRecord::decode(&bytes) {
                Ok(record) if record.state == PitState::Committed => {
                    store.catalog.insert(record.id.clone(), Arc::new(record));
                }
                Ok(record) => {
                    warn!(key = %key, state = ?record.state, "skipping uncommitted catalog entry");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable catalog entry");
                }
            }
        }

        let swept = store.sweep_orphans()?;
        info!(
            datastore = %store.datastore_id,
            engine = store.engine.name(),
            records = store.catalog.len(),
            orphan_sessions = swept,
            "Pit store opened"
        );
        Ok(store)
    }

    #[must_use]
    pub fn datastore_id(&self) -> &str {
        &self.datastore_id
    }

    #[must_use]
    pub fn engine(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.engine)
    }

    /// Checks `name` against [`NAME_PATTERN`].
    ///
    /// # Errors
    ///
    /// Returns [`PitError::InvalidName`] naming `what` on mismatch.
    pub fn validate_name(&self, what: &'static str, name: &str) -> Result<(), PitError> {
        if self.names.is_match(name) {
            Ok(())
        } else {
            Err(PitError::InvalidName {
                what,
                name: name.to_string(),
            })
        }
    }

    /// Starts a write session for a new Pit in state `Initializing`.
    ///
    /// # Errors
    ///
    /// - [`PitError::InvalidName`] for a malformed id
    /// - [`PitError::AlreadyCommitted`] if the id is already in the catalog
    /// - [`PitError::SessionActive`] if another writer holds the id
    pub fn create(
        self: &Arc<Self>,
        id: &str,
        format: PitFormatType,
        backup_type: BackupType,
    ) -> Result<Pit, PitError> {
        self.validate_name("recovery point", id)?;
        if self.catalog.contains_key(id) {
            return Err(PitError::AlreadyCommitted { id: id.to_string() });
        }

        let session_id = Uuid::new_v4().simple().to_string();
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(PitError::SessionActive { id: id.to_string() }),
            Entry::Vacant(slot) => {
                slot.insert(session_id.clone());
            }
        }
        // Commit inserts into the catalog before releasing the session, so this
        // catches a commit that raced the check above.
        if self.catalog.contains_key(id) {
            self.sessions.remove(id);
            return Err(PitError::AlreadyCommitted { id: id.to_string() });
        }

        debug!(recovery_point_id = %id, session = %session_id, "Pit session started");
        let record = PitRecord::new(id, session_id, format, backup_type, Utc::now());
        Ok(Pit {
            store: Arc::clone(self),
            session: Arc::new(Mutex::new(WriteSession {
                record,
                open_channel: None,
                aborted: false,
            })),
        })
    }

    /// Returns the committed record with this id.
    ///
    /// # Errors
    ///
    /// Returns [`PitError::NotFound`] if no committed record exists.
    pub fn open(&self, id: &str) -> Result<Arc<PitRecord>, PitError> {
        self.catalog
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PitError::NotFound { id: id.to_string() })
    }

    /// Opens a committed record for reading its streams.
    ///
    /// # Errors
    ///
    /// Returns [`PitError::NotFound`] if no committed record exists.
    pub fn reader(&self, id: &str) -> Result<PitFormatReader, PitError> {
        let record = self.open(id)?;
        Ok(PitFormatReader::new(self.engine(), record))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.catalog.contains_key(id)
    }

    /// Ids of all committed records, sorted.
    #[must_use]
    pub fn committed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.catalog.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Garbage-collects a committed record: its catalog entry and all its blobs.
    /// Returns `false` if no such record exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the engine fails to delete.
    pub fn delete(&self, id: &str) -> Result<bool, PitError> {
        let Some((_, record)) = self.catalog.remove(id) else {
            return Ok(false);
        };
        self.engine.delete(&catalog_key(id))?;
        let blobs = self.engine.delete_prefix(&record.session_prefix())?;
        info!(recovery_point_id = %id, blobs, "Pit deleted");
        Ok(true)
    }

    /// Publishes a finished record. Called with the session lock held.
    fn publish(&self, record: PitRecord) -> Result<Arc<PitRecord>, PitError> {
        let bytes = record.encode().map_err(|e| PitError::Corrupt {
            key: catalog_key(&record.id),
            reason: e.to_string(),
        })?;
        self.engine.put_object(&catalog_key(&record.id), &bytes)?;

        let record = Arc::new(record);
        self.catalog.insert(record.id.clone(), Arc::clone(&record));
        self.sessions
            .remove_if(&record.id, |_, session| *session == record.session_id);
        Ok(record)
    }

    /// Deletes an uncommitted session's blobs and releases its id.
    fn abort_session(&self, id: &str, session_id: &str) {
        match self.engine.delete_prefix(&session_prefix(id, session_id)) {
            Ok(blobs) => debug!(recovery_point_id = %id, blobs, "Pit session aborted"),
            Err(e) => warn!(recovery_point_id = %id, error = %e, "failed to delete aborted session blobs"),
        }
        self.sessions
            .remove_if(id, |_, session| session == session_id);
    }

    fn sweep_orphans(&self) -> Result<usize, PitError> {
        let mut orphans = BTreeSet::new();
        for key in self.engine.list(SESSIONS_PREFIX)? {
            let mut parts = key.split('/').skip(1);
            let (Some(id), Some(session)) = (parts.next(), parts.next()) else {
                continue;
            };
            let live = self
                .catalog
                .get(id)
                .is_some_and(|record| record.session_id == session);
            if !live {
                orphans.insert((id.to_string(), session.to_string()));
            }
        }

        for (id, session) in &orphans {
            self.engine.delete_prefix(&session_prefix(id, session))?;
        }
        Ok(orphans.len())
    }
}

// ---------------------------------------------------------------------------
// Pit (write session handle)
// ---------------------------------------------------------------------------

/// Mutable state shared by a [`Pit`], its writer and its open channel.
pub(crate) struct WriteSession {
    pub(crate) record: PitRecord,
    /// Blob key of the stream whose channel is currently open.
    pub(crate) open_channel: Option<String>,
    pub(crate) aborted: bool,
}

impl WriteSession {
    /// Fails unless the session can still be written to.
    pub(crate) fn ensure_writable(&self, action: &'static str) -> Result<(), PitError> {
        if self.aborted {
            return Err(PitError::SessionAborted {
                id: self.record.id.clone(),
            });
        }
        if self.record.state == PitState::Committed {
            return Err(PitError::InvalidState {
                id: self.record.id.clone(),
                state: self.record.state,
                action,
            });
        }
        Ok(())
    }
}

/// Handle to one Pit being written.
///
/// Dropping a `Pit` that was never committed aborts its session and deletes
/// every blob written in it.
pub struct Pit {
    store: Arc<PitStore>,
    session: Arc<Mutex<WriteSession>>,
}

impl Pit {
    #[must_use]
    pub fn id(&self) -> String {
        self.session.lock().record.id.clone()
    }

    #[must_use]
    pub fn state(&self) -> PitState {
        self.session.lock().record.state
    }

    /// Snapshot of the record as written so far.
    #[must_use]
    pub fn record(&self) -> PitRecord {
        self.session.lock().record.clone()
    }

    /// The stream-multiplexing writer for this Pit.
    #[must_use]
    pub fn writer(&self) -> PitFormatWriter {
        PitFormatWriter::new(Arc::clone(&self.store), Arc::clone(&self.session))
    }

    /// # Errors
    ///
    /// Fails once the Pit is committed.
    pub fn set_tag_info(&self, tag_info: Option<RetentionTagInfo>) -> Result<(), PitError> {
        self.update("set tags on", |record| record.tag_info = tag_info)
    }

    /// # Errors
    ///
    /// Fails once the Pit is committed.
    pub fn set_policy_info(&self, policy_info: Option<PolicyInfo>) -> Result<(), PitError> {
        self.update("set policy on", |record| record.policy_info = policy_info)
    }

    /// # Errors
    ///
    /// Fails once the Pit is committed.
    pub fn set_plugin_metadata(&self, metadata: Option<String>) -> Result<(), PitError> {
        self.update("set metadata on", |record| record.plugin_metadata = metadata)
    }

    /// Sets the end time recorded at commit. Defaults to the commit time.
    ///
    /// # Errors
    ///
    /// Fails once the Pit is committed.
    pub fn set_end_time(&self, end_time: DateTime<Utc>) -> Result<(), PitError> {
        self.update("set end time on", |record| record.end_time = Some(end_time))
    }

    /// Freezes the record and publishes it to the catalog.
    ///
    /// # Errors
    ///
    /// - [`PitError::InvalidState`] if already committed, or if nothing was
    ///   written (still `Initializing`)
    /// - [`PitError::ChannelOpen`] while a stream channel is open
    /// - [`PitError::IncompleteStorageUnit`] if a unit holds fewer streams than it announced
    /// - an engine error if the catalog entry cannot be written; the Pit stays
    ///   uncommitted and may be retried or dropped
    pub fn commit(&mut self) -> Result<Arc<PitRecord>, PitError> {
        let mut session = self.session.lock();
        session.ensure_writable("commit")?;
        if session.open_channel.is_some() {
            return Err(PitError::ChannelOpen);
        }
        if session.record.state == PitState::Initializing {
            return Err(PitError::InvalidState {
                id: session.record.id.clone(),
                state: PitState::Initializing,
                action: "commit",
            });
        }
        if let Some(unit) = session
            .record
            .manifest
            .storage_units
            .iter()
            .find(|unit| !unit.is_full())
        {
            return Err(PitError::IncompleteStorageUnit {
                unit: unit.name.clone(),
                expected: unit.expected_stream_count,
                actual: unit.streams.len(),
            });
        }

        let mut record = session.record.clone();
        record.state = PitState::Committed;
        record.end_time.get_or_insert_with(Utc::now);

        let committed = self.store.publish(record)?;
        session.record = (*committed).clone();

        metrics::counter!("pit_commits_total").increment(1);
        info!(
            recovery_point_id = %committed.id,
            storage_units = committed.manifest.storage_units.len(),
            streams = committed.manifest.stream_count(),
            bytes = committed.manifest.total_bytes(),
            "Pit committed"
        );
        Ok(committed)
    }

    /// Discards the Pit and every blob written in its session.
    pub fn abort(self) {
        drop(self);
    }

    fn update(
        &self,
        action: &'static str,
        apply: impl FnOnce(&mut PitRecord),
    ) -> Result<(), PitError> {
        let mut session = self.session.lock();
        session.ensure_writable(action)?;
        apply(&mut session.record);
        Ok(())
    }
}

impl Drop for Pit {
    fn drop(&mut self) {
        let mut session = self.session.lock();
        if session.record.state == PitState::Committed || session.aborted {
            return;
        }
        session.aborted = true;
        let id = session.record.id.clone();
        let session_id = session.record.session_id.clone();
        drop(session);
        self.store.abort_session(&id, &session_id);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::storage::engines::{FsBlobStore, MemoryBlobStore};

    fn memory_store() -> Arc<PitStore> {
        PitStore::new("default", Arc::new(MemoryBlobStore::new())).unwrap()
    }

    fn write_simple(store: &Arc<PitStore>, id: &str, payload: &[u8]) -> Arc<PitRecord> {
        let mut pit = store
            .create(id, PitFormatType::default(), BackupType::Full)
            .unwrap();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();
        let mut channel = writer.create_stream("S1").unwrap();
        channel.write_all(payload).unwrap();
        channel.close().unwrap();
        pit.commit().unwrap()
    }

    #[test]
    fn create_rejects_committed_id() {
        let store = memory_store();
        write_simple(&store, "rp1", b"hello");

        let err = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .err()
            .unwrap();
        assert!(matches!(err, PitError::AlreadyCommitted { .. }));
        assert!(err.is_conflict());
    }

    #[test]
    fn single_writer_per_id() {
        let store = memory_store();
        let first = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        let second = store.create("rp1", PitFormatType::default(), BackupType::Full);
        assert!(matches!(second, Err(PitError::SessionActive { .. })));

        drop(first);
        assert_eq!(store.active_sessions(), 0);
        assert!(store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .is_ok());
    }

    #[test]
    fn open_requires_commit() {
        let store = memory_store();
        let pit = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        assert!(matches!(store.open("rp1"), Err(PitError::NotFound { .. })));
        drop(pit);

        let committed = write_simple(&store, "rp2", b"x");
        assert_eq!(store.open("rp2").unwrap(), committed);
        assert_eq!(committed.state, PitState::Committed);
        assert!(committed.end_time.is_some());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let store = memory_store();
        for bad in ["", "../etc", ".hidden", "a/b", "with space"] {
            let err = store
                .create(bad, PitFormatType::default(), BackupType::Full)
                .err()
                .unwrap();
            assert!(matches!(err, PitError::InvalidName { .. }), "name {bad:?}");
        }
        assert!(PitStore::new("bad/id", Arc::new(MemoryBlobStore::new())).is_err());
    }

    #[test]
    fn commit_from_initializing_is_rejected() {
        let store = memory_store();
        let mut pit = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        assert!(matches!(
            pit.commit(),
            Err(PitError::InvalidState {
                state: PitState::Initializing,
                ..
            })
        ));
    }

    #[test]
    fn commit_rejects_incomplete_unit() {
        let store = memory_store();
        let mut pit = store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .unwrap();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 2).unwrap();
        writer.create_stream("S1").unwrap().close().unwrap();

        assert!(matches!(
            pit.commit(),
            Err(PitError::IncompleteStorageUnit {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn metadata_is_frozen_by_commit() {
        let store = memory_store();
        let mut pit = store
            .create("rp1", PitFormatType::default(), BackupType::Incremental)
            .unwrap();
        pit.set_tag_info(Some(RetentionTagInfo {
            tag_name: "testTag".to_string(),
            version: "v1".to_string(),
        }))
        .unwrap();
        pit.set_plugin_metadata(Some("{\"Foo\":\"Foo\"}".to_string()))
            .unwrap();
        let writer = pit.writer();
        writer.add_storage_unit("U1", 1).unwrap();
        writer.create_stream("S1").unwrap().close().unwrap();

        let record = pit.commit().unwrap();
        assert_eq!(record.backup_type, BackupType::Incremental);
        assert_eq!(record.tag_info.as_ref().unwrap().tag_name, "testTag");

        assert!(pit.set_plugin_metadata(None).is_err());
        assert!(matches!(
            pit.commit(),
            Err(PitError::InvalidState {
                state: PitState::Committed,
                ..
            })
        ));
        assert_eq!(store.open("rp1").unwrap().plugin_metadata, record.plugin_metadata);
    }

    #[test]
    fn dropped_pit_leaves_no_blobs() {
        let engine = Arc::new(MemoryBlobStore::new());
        let store = PitStore::new("default", engine.clone()).unwrap();
        {
            let pit = store
                .create("rp1", PitFormatType::default(), BackupType::Full)
                .unwrap();
            let writer = pit.writer();
            writer.add_storage_unit("U1", 2).unwrap();
            let mut channel = writer.create_stream("S1").unwrap();
            channel.write_all(b"data").unwrap();
            channel.close().unwrap();
            assert_eq!(engine.len(), 1);
        }
        assert!(engine.is_empty());
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn delete_removes_record_and_blobs() {
        let engine = Arc::new(MemoryBlobStore::new());
        let store = PitStore::new("default", engine.clone()).unwrap();
        write_simple(&store, "rp1", b"hello");
        assert_eq!(engine.len(), 2);

        assert!(store.delete("rp1").unwrap());
        assert!(engine.is_empty());
        assert!(!store.delete("rp1").unwrap());
        assert!(store
            .create("rp1", PitFormatType::default(), BackupType::Full)
            .is_ok());
    }

    #[test]
    fn reopen_restores_catalog_and_sweeps_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(dir.path()).unwrap());

        let store = PitStore::new("default", Arc::clone(&engine)).unwrap();
        write_simple(&store, "rp1", b"Just a small random backup content");

        // Simulate a writer that crashed mid-session.
        let mut orphan = engine.create_blob("sessions/rp2/deadbeef/0/0").unwrap();
        orphan.write_all(b"partial").unwrap();
        orphan.seal().unwrap();
        drop(store);

        let reopened = PitStore::open_existing("default", Arc::clone(&engine)).unwrap();
        assert_eq!(reopened.committed_ids(), vec!["rp1"]);
        assert_eq!(engine.list("sessions/rp2").unwrap(), Vec::<String>::new());

        let reader = reopened.reader("rp1").unwrap();
        let mut content = String::new();
        reader
            .open_stream("S1", 0)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "Just a small random backup content");
    }
}
