//! Backup plugin server: LRO registry and dispatcher, Pit snapshot storage
//! and the axum verb surface.

pub mod dataplane;
pub mod network;
pub mod service;
pub mod storage;
pub mod traits;

pub use traits::SourceDataplane;
