//! Point-in-time (Pit) record types.
//!
//! A Pit is an immutable snapshot of a data source, identified by its recovery-point
//! id. Its [`PitManifest`] lists storage units in write order, each holding the
//! streams written into it, again in write order.

use serde::{Deserialize, Serialize};

/// Lifecycle of a Pit record. Only forward: `Initializing -> Writing -> Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitState {
    Initializing,
    Writing,
    Committed,
}

/// On-store layout of the streams inside a Pit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitFormatType {
    /// Forward-only byte streams, one blob per stream, no random access.
    #[default]
    BlockBlobUnseekableStream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionTagInfo {
    pub tag_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub policy_name: String,
    pub policy_version: String,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One completed stream inside a storage unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub name: String,
    /// Total bytes written.
    pub length: u64,
    /// Hex-encoded BLAKE3 digest of the stream content.
    pub digest: String,
}

/// A named container of ordered streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnitEntry {
    pub name: String,
    pub expected_stream_count: u32,
    pub streams: Vec<StreamEntry>,
}

impl StorageUnitEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, expected_stream_count: u32) -> Self {
        Self {
            name: name.into(),
            expected_stream_count,
            streams: Vec::new(),
        }
    }

    /// Whether the unit already holds as many streams as it announced.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.streams.len() >= self.expected_stream_count as usize
    }
}

/// Position of a stream inside a manifest: `(unit index, stream ordinal)`.
pub type StreamPosition = (usize, usize);

/// Ordered mapping from storage-unit name to its ordered streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitManifest {
    pub storage_units: Vec<StorageUnitEntry>,
}

impl PitManifest {
    /// `(storage unit, stream names)` pairs in write order.
    #[must_use]
    pub fn stream_info(&self) -> Vec<(String, Vec<String>)> {
        self.storage_units
            .iter()
            .map(|unit| {
                (
                    unit.name.clone(),
                    unit.streams.iter().map(|s| s.name.clone()).collect(),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&StorageUnitEntry> {
        self.storage_units.iter().find(|u| u.name == name)
    }

    #[must_use]
    pub fn stream(&self, position: StreamPosition) -> Option<&StreamEntry> {
        self.storage_units
            .get(position.0)
            .and_then(|unit| unit.streams.get(position.1))
    }

    /// The `index`-th occurrence (0-based, manifest order) of a stream named `name`
    /// across all storage units.
    #[must_use]
    pub fn find_stream(&self, name: &str, index: usize) -> Option<StreamPosition> {
        self.storage_units
            .iter()
            .enumerate()
            .flat_map(|(u, unit)| {
                unit.streams
                    .iter()
                    .enumerate()
                    .filter(move |(_, s)| s.name == name)
                    .map(move |(o, _)| (u, o))
            })
            .nth(index)
    }

    /// The `index`-th occurrence of `name` within the storage unit `unit`.
    #[must_use]
    pub fn find_unit_stream(&self, unit: &str, name: &str, index: usize) -> Option<StreamPosition> {
        let (u, entry) = self
            .storage_units
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.name == unit)?;
        entry
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.name == name)
            .map(|(o, _)| (u, o))
            .nth(index)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.storage_units.iter().map(|u| u.streams.len()).sum()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.storage_units
            .iter()
            .flat_map(|u| u.streams.iter())
            .map(|s| s.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str, length: u64) -> StreamEntry {
        StreamEntry {
            name: name.to_string(),
            length,
            digest: String::new(),
        }
    }

    fn sample() -> PitManifest {
        let mut u1 = StorageUnitEntry::new("U1", 3);
        u1.streams = vec![stream("data", 5), stream("log", 2), stream("data", 7)];
        let mut u2 = StorageUnitEntry::new("U2", 1);
        u2.streams = vec![stream("data", 11)];
        PitManifest {
            storage_units: vec![u1, u2],
        }
    }

    #[test]
    fn stream_info_preserves_write_order() {
        assert_eq!(
            sample().stream_info(),
            vec![
                (
                    "U1".to_string(),
                    vec!["data".to_string(), "log".to_string(), "data".to_string()]
                ),
                ("U2".to_string(), vec!["data".to_string()]),
            ]
        );
    }

    #[test]
    fn find_stream_counts_occurrences_across_units() {
        let manifest = sample();
        assert_eq!(manifest.find_stream("data", 0), Some((0, 0)));
        assert_eq!(manifest.find_stream("data", 1), Some((0, 2)));
        assert_eq!(manifest.find_stream("data", 2), Some((1, 0)));
        assert_eq!(manifest.find_stream("data", 3), None);
        assert_eq!(manifest.find_stream("missing", 0), None);
    }

    #[test]
    fn find_unit_stream_is_scoped() {
        let manifest = sample();
        assert_eq!(manifest.find_unit_stream("U2", "data", 0), Some((1, 0)));
        assert_eq!(manifest.find_unit_stream("U1", "data", 1), Some((0, 2)));
        assert_eq!(manifest.find_unit_stream("U2", "log", 0), None);
        assert_eq!(manifest.find_unit_stream("U9", "data", 0), None);
    }

    #[test]
    fn totals() {
        let manifest = sample();
        assert_eq!(manifest.stream_count(), 4);
        assert_eq!(manifest.total_bytes(), 25);
        assert!(manifest.unit("U1").unwrap().is_full());
        assert_eq!(manifest.stream((1, 0)).unwrap().length, 11);
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        fn manifest_strategy() -> impl Strategy<Value = PitManifest> {
            let names = prop::sample::select(vec!["a", "b", "c"]);
            prop::collection::vec(prop::collection::vec(names, 0..5), 1..4).prop_map(|units| {
                PitManifest {
                    storage_units: units
                        .into_iter()
                        .enumerate()
                        .map(|(i, streams)| {
                            let mut unit = StorageUnitEntry::new(format!("U{i}"), 4);
                            unit.streams = streams.into_iter().map(|n| stream(n, 1)).collect();
                            unit
                        })
                        .collect(),
                }
            })
        }

        proptest! {
            #[test]
            fn every_stream_is_reachable_by_its_occurrence(manifest in manifest_strategy()) {
                let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
                for (u, unit) in manifest.storage_units.iter().enumerate() {
                    for (o, entry) in unit.streams.iter().enumerate() {
                        let index = seen.entry(entry.name.clone()).or_insert(0);
                        prop_assert_eq!(manifest.find_stream(&entry.name, *index), Some((u, o)));
                        *index += 1;
                    }
                }
                for (name, count) in seen {
                    prop_assert_eq!(manifest.find_stream(&name, count), None);
                }
            }
        }
    }
}
