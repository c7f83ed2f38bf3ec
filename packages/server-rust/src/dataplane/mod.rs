//! [`SourceDataplane`](crate::traits::SourceDataplane) implementations.

pub mod sample;

pub use sample::SampleDataplane;
