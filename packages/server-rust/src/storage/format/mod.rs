//! Unseekable stream format for Pit records.
//!
//! Every stream is one forward-only blob. Framing of multiple logical files
//! inside a stream is the caller's business.

pub mod channel;
pub mod reader;
pub mod writer;

pub use channel::{ReadableChannel, WritableChannel};
pub use reader::PitFormatReader;
pub use writer::PitFormatWriter;
