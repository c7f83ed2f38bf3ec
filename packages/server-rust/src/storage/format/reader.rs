//! Reader over one committed Pit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use plugin_core::pit::StreamPosition;
use tracing::{debug, warn};

use super::channel::ReadableChannel;
use crate::storage::engine::BlobStore;
use crate::storage::error::PitError;
use crate::storage::record::PitRecord;

/// Reopens the streams of a committed Pit, stream for stream.
pub struct PitFormatReader {
    engine: Arc<dyn BlobStore>,
    record: Arc<PitRecord>,
    open_channels: Arc<AtomicUsize>,
    released: bool,
}

impl PitFormatReader {
    pub(crate) fn new(engine: Arc<dyn BlobStore>, record: Arc<PitRecord>) -> Self {
        Self {
            engine,
            record,
            open_channels: Arc::new(AtomicUsize::new(0)),
            released: false,
        }
    }

    #[must_use]
    pub fn record(&self) -> &PitRecord {
        &self.record
    }

    /// `(storage unit, stream names)` exactly as recorded at commit.
    #[must_use]
    pub fn stream_info(&self) -> Vec<(String, Vec<String>)> {
        self.record.manifest.stream_info()
    }

    /// Opens the `index`-th stream named `name`, counting occurrences across all
    /// storage units in manifest order.
    ///
    /// # Errors
    ///
    /// Returns [`PitError::StreamNotFound`] if there is no such occurrence, or
    /// [`PitError::ReaderReleased`] after cleanup.
    pub fn open_stream(&self, name: &str, index: usize) -> Result<ReadableChannel, PitError> {
        let position = self
            .record
            .manifest
            .find_stream(name, index)
            .ok_or_else(|| PitError::StreamNotFound {
                name: name.to_string(),
                index,
            })?;
        self.open_at(position)
    }

    /// Opens the `index`-th stream named `name` within storage unit `unit`.
    ///
    /// # Errors
    ///
    /// Same as [`open_stream`](Self::open_stream).
    pub fn open_unit_stream(
        &self,
        unit: &str,
        name: &str,
        index: usize,
    ) -> Result<ReadableChannel, PitError> {
        let position = self
            .record
            .manifest
            .find_unit_stream(unit, name, index)
            .ok_or_else(|| PitError::StreamNotFound {
                name: format!("{unit}/{name}"),
                index,
            })?;
        self.open_at(position)
    }

    /// Number of channels opened by this reader and not yet dropped.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::Relaxed)
    }

    /// Releases the reader. Further opens fail; calling again is a no-op.
    pub fn cleanup_storage_units(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let open = self.open_channels();
        if open > 0 {
            warn!(recovery_point_id = %self.record.id, open, "reader released with open channels");
        }
        debug!(recovery_point_id = %self.record.id, "reader released");
    }

    fn open_at(&self, position: StreamPosition) -> Result<ReadableChannel, PitError> {
        if self.released {
            return Err(PitError::ReaderReleased {
                id: self.record.id.clone(),
            });
        }
        let entry = self
            .record
            .manifest
            .stream(position)
            .cloned()
            .ok_or(PitError::NoStorageUnit)?;
        let blob = self
            .engine
            .open_blob(&self.record.stream_key(position.0, position.1))?;
        Ok(ReadableChannel::new(
            blob,
            entry,
            Arc::clone(&self.open_channels),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use plugin_core::{BackupType, PitFormatType};
    use proptest::prelude::*;

    use super::*;
    use crate::storage::engines::MemoryBlobStore;
    use crate::storage::pit_store::PitStore;

    type Layout = Vec<(String, Vec<(String, Vec<u8>)>)>;

    fn write_layout(store: &Arc<PitStore>, id: &str, layout: &Layout) {
        let mut pit = store
            .create(id, PitFormatType::default(), BackupType::Full)
            .unwrap();
        let writer = pit.writer();
        for (unit, streams) in layout {
            writer
                .add_storage_unit(unit, u32::try_from(streams.len()).unwrap())
                .unwrap();
            for (name, bytes) in streams {
                let mut channel = writer.create_stream(name).unwrap();
                channel.write_all(bytes).unwrap();
                channel.close().unwrap();
            }
        }
        pit.commit().unwrap();
    }

    fn store() -> Arc<PitStore> {
        PitStore::new("default", Arc::new(MemoryBlobStore::new())).unwrap()
    }

    #[test]
    fn single_stream_round_trip() {
        let store = store();
        let layout = vec![(
            "U1".to_string(),
            vec![("S1".to_string(), b"hello".to_vec())],
        )];
        write_layout(&store, "rp1", &layout);

        let reader = store.reader("rp1").unwrap();
        assert_eq!(
            reader.stream_info(),
            vec![("U1".to_string(), vec!["S1".to_string()])]
        );
        let mut out = Vec::new();
        reader
            .open_stream("S1", 0)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn duplicate_names_resolve_by_occurrence() {
        let store = store();
        let layout = vec![
            (
                "U1".to_string(),
                vec![
                    ("data".to_string(), b"first".to_vec()),
                    ("data".to_string(), b"second".to_vec()),
                ],
            ),
            ("U2".to_string(), vec![("data".to_string(), b"third".to_vec())]),
        ];
        write_layout(&store, "rp1", &layout);
        let reader = store.reader("rp1").unwrap();

        let read = |ch: ReadableChannel| {
            let mut s = String::new();
            let mut ch = ch;
            ch.read_to_string(&mut s).unwrap();
            s
        };
        assert_eq!(read(reader.open_stream("data", 1).unwrap()), "second");
        assert_eq!(read(reader.open_stream("data", 2).unwrap()), "third");
        assert_eq!(
            read(reader.open_unit_stream("U2", "data", 0).unwrap()),
            "third"
        );
        assert!(matches!(
            reader.open_stream("data", 3),
            Err(PitError::StreamNotFound { index: 3, .. })
        ));
    }

    #[test]
    fn cleanup_is_idempotent_and_final() {
        let store = store();
        write_layout(
            &store,
            "rp1",
            &vec![("U1".to_string(), vec![("S1".to_string(), b"x".to_vec())])],
        );
        let mut reader = store.reader("rp1").unwrap();
        let channel = reader.open_stream("S1", 0).unwrap();
        assert_eq!(reader.open_channels(), 1);
        drop(channel);

        reader.cleanup_storage_units();
        reader.cleanup_storage_units();
        assert!(matches!(
            reader.open_stream("S1", 0),
            Err(PitError::ReaderReleased { .. })
        ));
    }

    #[test]
    fn missing_record_is_not_found() {
        let store = store();
        assert!(matches!(
            store.reader("nope"),
            Err(PitError::NotFound { .. })
        ));
    }

    fn layout_strategy() -> impl Strategy<Value = Layout> {
        prop::collection::vec(
            prop::collection::vec(
                ("[a-c]{1,2}", prop::collection::vec(any::<u8>(), 0..256)),
                1..4,
            ),
            1..4,
        )
        .prop_map(|units| {
            units
                .into_iter()
                .enumerate()
                .map(|(i, streams)| (format!("unit{i}"), streams))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn committed_streams_read_back_identically(layout in layout_strategy()) {
            let store = store();
            write_layout(&store, "rp-prop", &layout);
            let reader = store.reader("rp-prop").unwrap();

            let expected_info: Vec<(String, Vec<String>)> = layout
                .iter()
                .map(|(unit, streams)| {
                    (unit.clone(), streams.iter().map(|(n, _)| n.clone()).collect())
                })
                .collect();
            prop_assert_eq!(reader.stream_info(), expected_info);

            for (unit, streams) in &layout {
                for (ordinal, (name, bytes)) in streams.iter().enumerate() {
                    let occurrence = streams[..ordinal].iter().filter(|(n, _)| n == name).count();
                    let mut channel = reader.open_unit_stream(unit, name, occurrence).unwrap();
                    let mut out = Vec::new();
                    channel.read_to_end(&mut out).unwrap();
                    prop_assert_eq!(&out, bytes);
                }
            }
        }
    }
}
