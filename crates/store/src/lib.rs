//! `rill-store`: append-only event log, stream index, and truncation.
//!
//! Two interchangeable [`EventLog`] implementations live here: the in-memory
//! log for tests and ephemeral use, and the file-backed log for durable
//! single-node deployments. Both share the stream index and the global
//! sequencer, so their visible semantics are identical.

pub mod error;
pub mod file;
pub mod in_memory;
mod index;
pub mod log;
pub mod query;
pub mod record;
mod seq;
pub mod source;
mod truncation;

pub use error::{StoreError, StoreResult};
pub use file::FileEventLog;
pub use in_memory::InMemoryEventLog;
pub use log::{EventLog, StreamReader};
pub use query::{EventFilter, EventQuery, EventQueryResult, Pagination};
pub use record::{AppendReceipt, ProposedEvent, RecordedEvent, StreamMetadata};
pub use source::SourceSelector;
