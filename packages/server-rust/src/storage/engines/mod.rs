//! Concrete [`BlobStore`](super::engine::BlobStore) implementations.

pub mod fs;
pub mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
