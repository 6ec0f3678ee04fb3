//! Continuous projections over the event log.
//!
//! A projection is a named, deterministic fold over a selection of streams.
//! The [`ProjectionEngine`] registers folds, runs them on worker threads or
//! step by step, persists their progress through a [`CheckpointStore`], and
//! reacts to source truncation according to each projection's policy.

pub mod checkpoint;
pub mod engine;
pub mod fold;
pub mod rebuild;
mod worker;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use engine::{
    EngineConfig, EngineError, ProjectionEngine, ProjectionHandle, ProjectionOptions,
    ProjectionStats, ProjectionStatus, TruncationPolicy,
};
pub use fold::{CountByType, CountState, Fold};
pub use rebuild::{RebuildError, RebuildHandle, RebuildPhase, RebuildProgress, rebuild_projection};
