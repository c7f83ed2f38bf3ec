//! The catalog record of one Pit and its storage layout.

use chrono::{DateTime, Utc};
use plugin_core::{
    BackupType, PitFormatType, PitManifest, PitState, PolicyInfo, RetentionTagInfo,
};
use serde::{Deserialize, Serialize};

use super::engine::join_key;

/// Root of all in-progress and committed stream blobs.
pub const SESSIONS_PREFIX: &str = "sessions";

/// Root of committed catalog entries.
pub const CATALOG_PREFIX: &str = "catalog";

/// Catalog extension for MessagePack-encoded records.
pub const CATALOG_EXTENSION: &str = ".pit";

/// A Pit record. Frozen once `state` is [`PitState::Committed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitRecord {
    /// Recovery-point id.
    pub id: String,
    pub state: PitState,
    pub format: PitFormatType,
    pub backup_type: BackupType,
    /// Write session whose blobs hold this record's streams.
    pub session_id: String,
    pub tag_info: Option<RetentionTagInfo>,
    pub policy_info: Option<PolicyInfo>,
    pub plugin_metadata: Option<String>,
    pub created_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub manifest: PitManifest,
}

impl PitRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        format: PitFormatType,
        backup_type: BackupType,
        created_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            state: PitState::Initializing,
            format,
            backup_type,
            session_id: session_id.into(),
            tag_info: None,
            policy_info: None,
            plugin_metadata: None,
            created_time,
            end_time: None,
            manifest: PitManifest::default(),
        }
    }

    /// Key of the blob holding stream `ordinal` of storage unit `unit_index`.
    #[must_use]
    pub fn stream_key(&self, unit_index: usize, ordinal: usize) -> String {
        stream_key(&self.id, &self.session_id, unit_index, ordinal)
    }

    #[must_use]
    pub fn session_prefix(&self) -> String {
        session_prefix(&self.id, &self.session_id)
    }

    /// Encodes the record for the catalog.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a catalog entry.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the bytes are not a valid record.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[must_use]
pub fn stream_key(id: &str, session_id: &str, unit_index: usize, ordinal: usize) -> String {
    join_key(&[
        SESSIONS_PREFIX,
        id,
        session_id,
        &unit_index.to_string(),
        &ordinal.to_string(),
    ])
}

#[must_use]
pub fn session_prefix(id: &str, session_id: &str) -> String {
    join_key(&[SESSIONS_PREFIX, id, session_id])
}

#[must_use]
pub fn catalog_key(id: &str) -> String {
    format!("{CATALOG_PREFIX}/{id}{CATALOG_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use plugin_core::{StorageUnitEntry, StreamEntry};

    use super::*;

    fn record_with(units: Vec<(String, Vec<(String, u64)>)>) -> PitRecord {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut record = PitRecord::new(
            "rp-1",
            "sess",
            PitFormatType::BlockBlobUnseekableStream,
            BackupType::Full,
            created,
        );
        for (unit, streams) in units {
            let mut entry = StorageUnitEntry::new(unit, u32::try_from(streams.len()).unwrap());
            entry.streams = streams
                .into_iter()
                .map(|(name, length)| StreamEntry {
                    name,
                    length,
                    digest: "00".repeat(32),
                })
                .collect();
            record.manifest.storage_units.push(entry);
        }
        record.state = PitState::Committed;
        record
    }

    #[test]
    fn keys_follow_layout() {
        let record = record_with(Vec::new());
        assert_eq!(record.stream_key(2, 5), "sessions/rp-1/sess/2/5");
        assert_eq!(record.session_prefix(), "sessions/rp-1/sess");
        assert_eq!(catalog_key("rp-1"), "catalog/rp-1.pit");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PitRecord::decode(b"\xc1not msgpack").is_err());
    }

    #[test]
    fn catalog_encoding_keeps_manifest_order() {
        let record = record_with(vec![
            ("U2".to_string(), vec![("b".to_string(), 3), ("a".to_string(), 1)]),
            ("U1".to_string(), vec![("a".to_string(), 7)]),
        ]);
        let back = PitRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(back.manifest.stream_info(), record.manifest.stream_info());
        assert_eq!(back, record);
    }
}
