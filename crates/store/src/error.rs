//! Store error model.

use rill_core::{ExpectedVersion, StreamId};
use thiserror::Error;

/// Result type used across the store layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Event log operation error.
///
/// These are **storage-layer** failures (concurrency, truncation rules,
/// durability) as opposed to name validation errors, which are rejected
/// before a request ever reaches the log.
///
/// ## Error Categories
///
/// - **WrongExpectedVersion**: optimistic concurrency check failed; the
///   stream was left untouched
/// - **InvalidTruncation**: the truncate-before marker may only move forward
/// - **StreamNotFound**: metadata was requested for a stream that has never
///   had an event appended
/// - **InvalidAppend**: the append call itself was malformed
/// - **Storage**: the durability layer failed; the operation had no effect
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("wrong expected version on stream '{stream}': expected {expected:?}, current {current:?}")]
    WrongExpectedVersion {
        stream: StreamId,
        expected: ExpectedVersion,
        current: Option<u64>,
    },

    #[error("invalid truncation on stream '{stream}': requested marker {requested} is below current {current}")]
    InvalidTruncation {
        stream: StreamId,
        current: u64,
        requested: u64,
    },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn invalid_append(msg: impl Into<String>) -> Self {
        Self::InvalidAppend(msg.into())
    }

    pub fn storage(err: impl core::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
