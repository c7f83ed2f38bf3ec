//! Factory for per-datastore [`PitStore`] instances.
//!
//! [`PitStoreFactory`] is the dependency injection point between the request
//! surface and storage: it maps the `DatastoreId` carried in initialize
//! params to a [`PitStore`] over the configured [`BlobStore`] backend, and
//! caches it so every operation on one datastore shares one catalog.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use tracing::info;

use crate::storage::engine::BlobStore;
use crate::storage::engines::{FsBlobStore, MemoryBlobStore};
use crate::storage::error::PitError;
use crate::storage::pit_store::{PitStore, NAME_PATTERN};

/// Datastore used when a request names none.
pub const DEFAULT_DATASTORE: &str = "default";

/// Where Pit blobs live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Process-local; everything is lost on exit.
    #[default]
    Memory,
    /// One directory per datastore under `root`.
    Filesystem { root: PathBuf },
}

/// Creates and caches one [`PitStore`] per datastore id.
pub struct PitStoreFactory {
    backend: StorageBackend,
    names: Regex,
    stores: DashMap<String, Arc<PitStore>>,
}

impl PitStoreFactory {
    /// # Errors
    ///
    /// Returns [`PitError::Pattern`] if the name pattern fails to compile.
    pub fn new(backend: StorageBackend) -> Result<Self, PitError> {
        Ok(Self {
            backend,
            names: Regex::new(NAME_PATTERN)?,
            stores: DashMap::new(),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Returns the store for `datastore_id`, opening it on first use.
    ///
    /// A filesystem store is opened with [`PitStore::open_existing`], so
    /// records committed by an earlier process are visible again.
    ///
    /// # Errors
    ///
    /// Returns [`PitError::InvalidName`] for a malformed id, or an I/O error if
    /// the backend cannot be opened.
    pub fn resolve(&self, datastore_id: Option<&str>) -> Result<Arc<PitStore>, PitError> {
        let datastore_id = datastore_id.unwrap_or(DEFAULT_DATASTORE);
        if let Some(store) = self.stores.get(datastore_id) {
            return Ok(Arc::clone(store.value()));
        }

        match self.stores.entry(datastore_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let store = self.open(datastore_id)?;
                slot.insert(Arc::clone(&store));
                Ok(store)
            }
        }
    }

    /// Ids of the datastores opened so far, sorted.
    #[must_use]
    pub fn datastores(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn open(&self, datastore_id: &str) -> Result<Arc<PitStore>, PitError> {
        match &self.backend {
            StorageBackend::Memory => {
                let engine: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
                let store = PitStore::new(datastore_id, engine)?;
                info!(datastore = %datastore_id, "in-memory Pit store created");
                Ok(store)
            }
            StorageBackend::Filesystem { root } => {
                if !self.names.is_match(datastore_id) {
                    return Err(PitError::InvalidName {
                        what: "datastore",
                        name: datastore_id.to_string(),
                    });
                }
                let engine: Arc<dyn BlobStore> =
                    Arc::new(FsBlobStore::open(root.join(datastore_id))?);
                PitStore::open_existing(datastore_id, engine)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use plugin_core::{BackupType, PitFormatType};

    use super::*;

    #[test]
    fn resolve_caches_per_datastore() {
        let factory = PitStoreFactory::new(StorageBackend::Memory).unwrap();
        let a = factory.resolve(None).unwrap();
        let b = factory.resolve(Some(DEFAULT_DATASTORE)).unwrap();
        let other = factory.resolve(Some("ds2")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(factory.datastores(), vec!["default", "ds2"]);
    }

    #[test]
    fn malformed_datastore_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let factory = PitStoreFactory::new(StorageBackend::Filesystem {
            root: dir.path().to_path_buf(),
        })
        .unwrap();
        let err = factory.resolve(Some("../escape")).err().unwrap();
        assert!(matches!(err, PitError::InvalidName { .. }));
        assert!(factory.datastores().is_empty());
    }

    #[test]
    fn filesystem_backend_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StorageBackend::Filesystem {
            root: dir.path().to_path_buf(),
        };

        {
            let factory = PitStoreFactory::new(backend.clone()).unwrap();
            let store = factory.resolve(Some("ds1")).unwrap();
            let mut pit = store
                .create("rp1", PitFormatType::default(), BackupType::Full)
                .unwrap();
            let writer = pit.writer();
            writer.add_storage_unit("TestStorageUnit", 1).unwrap();
            let mut channel = writer.create_stream("testStream").unwrap();
            channel.write_all(b"persisted").unwrap();
            channel.close().unwrap();
            pit.commit().unwrap();
        }

        let factory = PitStoreFactory::new(backend).unwrap();
        let store = factory.resolve(Some("ds1")).unwrap();
        let reader = store.reader("rp1").unwrap();
        let mut content = String::new();
        reader
            .open_stream("testStream", 0)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "persisted");
    }
}
