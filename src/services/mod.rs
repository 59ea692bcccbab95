//! Service layer for the advisory engine.
//!
//! - Source adapters (`SourceAdapter`, `AdapterRegistry`)
//! - Content normalization shared by all adapters (`normalizer`)

pub mod adapters;
pub mod normalizer;

pub use adapters::{AdapterRegistry, SourceAdapter};
