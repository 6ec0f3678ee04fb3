//! `rill-core`: foundation building blocks for the event store.
//!
//! This crate contains **pure primitives** (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::NameError;
pub use id::{ProjectionName, StreamId};
pub use version::ExpectedVersion;
