//! Logical front-truncation rules.
//!
//! Truncation never rewrites the log. Moving the `truncate_before` marker
//! only narrows what reads return; the records below it stay in place until
//! a compaction step that lives outside this crate. Projections that already
//! consumed the hidden prefix are **not** corrected retroactively; a caller
//! that wants a consistent view resets and replays.

use rill_core::{ExpectedVersion, StreamId};

use crate::error::{StoreError, StoreResult};
use crate::record::StreamMetadata;

/// Validate a marker move against the current metadata record.
///
/// Two checks, in order:
///
/// 1. optimistic concurrency on `metadata_version` (`NoStream` matches a
///    metadata record that has never been written)
/// 2. the marker is monotonic: it may stay put or move forward, never back
pub fn check_marker_move(
    stream_id: &StreamId,
    metadata: &StreamMetadata,
    expected: ExpectedVersion,
    requested: u64,
) -> StoreResult<()> {
    let current_version = match metadata.metadata_version {
        0 => None,
        v => Some(v),
    };
    if !expected.matches(current_version) {
        return Err(StoreError::WrongExpectedVersion {
            stream: stream_id.clone(),
            expected,
            current: current_version,
        });
    }
    if let Some(current) = metadata.truncate_before
        && requested < current
    {
        return Err(StoreError::InvalidTruncation {
            stream: stream_id.clone(),
            current,
            requested,
        });
    }
    Ok(())
}

/// Metadata record after a validated marker move.
pub fn apply_marker_move(metadata: StreamMetadata, requested: u64) -> StreamMetadata {
    StreamMetadata {
        truncate_before: Some(requested),
        metadata_version: metadata.metadata_version + 1,
    }
}
