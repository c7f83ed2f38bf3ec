//! JSON wire schemas for the plugin verb surface.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` to match the field names the
//! backup orchestrator sends and expects.

pub mod base;
pub mod requests;
pub mod response;

pub use base::*;
pub use requests::*;
pub use response::*;
