//! Pit snapshot storage.
//!
//! Three layers:
//!
//! - **Layer 1** ([`BlobStore`]): flat key/blob storage, in memory or on disk
//! - **Layer 2** ([`PitStore`]): catalog of Pit records, write sessions and commit
//! - **Layer 3** ([`format`]): [`PitFormatWriter`] / [`PitFormatReader`], which
//!   multiplex named streams into storage units of one Pit
//!
//! [`PitStoreFactory`] hands out one [`PitStore`] per datastore.

pub mod engine;
pub mod engines;
pub mod error;
pub mod factory;
pub mod format;
pub mod pit_store;
pub mod record;

pub use engine::{join_key, BlobStore, BlobWriter};
pub use error::PitError;
pub use factory::{PitStoreFactory, StorageBackend, DEFAULT_DATASTORE};
pub use format::{PitFormatReader, PitFormatWriter, ReadableChannel, WritableChannel};
pub use pit_store::{Pit, PitStore, NAME_PATTERN};
pub use record::PitRecord;
