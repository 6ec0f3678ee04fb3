//! Append-only event log boundary.

use std::collections::VecDeque;
use std::sync::Arc;

use rill_core::{ExpectedVersion, StreamId};

use crate::error::StoreResult;
use crate::record::{AppendReceipt, ProposedEvent, RecordedEvent, StreamMetadata};
use crate::source::SourceSelector;

/// Append-only event log with per-stream versioning and a store-wide total
/// order.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory implementation
///   (tests/dev) and the file-backed one (durable single-node deployments)
/// - **Append-only**: committed events are never modified; truncation only
///   narrows visibility
/// - **Optimistic locking**: via [`ExpectedVersion`], on appends and metadata
///   writes alike
/// - **Total order**: every committed event carries a `global_position`
///   fixing one order across all streams
///
/// ## Append Semantics
///
/// `append()`:
/// - checks optimistic concurrency against the stream's last event number
/// - drops events whose `event_id` is already present (idempotent retries);
///   a non-empty batch that is dropped entirely succeeds without the
///   version check
/// - assigns contiguous per-stream event numbers starting at 0
/// - assigns global positions from the store-wide sequencer
/// - persists the batch atomically (all surviving events or none)
///
/// ## Read Semantics
///
/// `read()` returns a contiguous run of a single stream, `read_merged()` the
/// global-order interleaving of every selected stream. Both omit events below
/// a stream's `truncate_before` marker, and both treat unknown streams as
/// empty. Merged reads only surface events below the committed horizon so
/// that an in-flight append can never make an earlier read inconsistent.
pub trait EventLog: Send + Sync {
    /// Append a batch to a stream.
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> StoreResult<AppendReceipt>;

    /// Read one stream in event-number order, starting at
    /// `from_event_number`, at most `max_count` events.
    fn read(
        &self,
        stream_id: &StreamId,
        from_event_number: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>>;

    /// Read the selected streams merged into global-position order, starting
    /// at `from_global_position`, at most `max_count` events.
    fn read_merged(
        &self,
        selector: &SourceSelector,
        from_global_position: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>>;

    /// Last event number of the stream, `None` if it does not exist.
    fn current_version(&self, stream_id: &StreamId) -> StoreResult<Option<u64>>;

    /// Metadata record of an existing stream.
    fn stream_metadata(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata>;

    /// Move the stream's truncate-before marker forward. `expected` is
    /// checked against the metadata version (`NoStream` = never written).
    /// Returns the new metadata version.
    fn set_truncate_before(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        truncate_before: u64,
    ) -> StoreResult<u64>;

    /// Names of all existing streams, sorted.
    fn stream_names(&self) -> StoreResult<Vec<StreamId>>;

    /// Lowest global position that may still change. Events below it are
    /// final: committed or permanently skipped.
    fn horizon(&self) -> u64;

    /// Counter bumped by every metadata write. Lets pollers notice marker
    /// movement without rescanning every stream.
    fn truncation_stamp(&self) -> u64;
}

impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> StoreResult<AppendReceipt> {
        (**self).append(stream_id, expected, events)
    }

    fn read(
        &self,
        stream_id: &StreamId,
        from_event_number: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        (**self).read(stream_id, from_event_number, max_count)
    }

    fn read_merged(
        &self,
        selector: &SourceSelector,
        from_global_position: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        (**self).read_merged(selector, from_global_position, max_count)
    }

    fn current_version(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        (**self).current_version(stream_id)
    }

    fn stream_metadata(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata> {
        (**self).stream_metadata(stream_id)
    }

    fn set_truncate_before(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        truncate_before: u64,
    ) -> StoreResult<u64> {
        (**self).set_truncate_before(stream_id, expected, truncate_before)
    }

    fn stream_names(&self) -> StoreResult<Vec<StreamId>> {
        (**self).stream_names()
    }

    fn horizon(&self) -> u64 {
        (**self).horizon()
    }

    fn truncation_stamp(&self) -> u64 {
        (**self).truncation_stamp()
    }
}

const READER_PAGE_SIZE: usize = 512;

/// Lazy page-at-a-time reader over one stream.
///
/// Pulls pages on demand, so the caller can stop (drop the reader) at any
/// point; it ends once a fetch comes back empty. Restart from any event
/// number with `new`.
pub struct StreamReader<L> {
    log: L,
    stream_id: StreamId,
    next_event_number: u64,
    page_size: usize,
    buffer: VecDeque<RecordedEvent>,
    done: bool,
}

impl<L: EventLog> StreamReader<L> {
    pub fn new(log: L, stream_id: StreamId, from_event_number: u64) -> Self {
        Self {
            log,
            stream_id,
            next_event_number: from_event_number,
            page_size: READER_PAGE_SIZE,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl<L: EventLog> Iterator for StreamReader<L> {
    type Item = StoreResult<RecordedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.buffer.pop_front() {
            return Some(Ok(event));
        }
        if self.done {
            return None;
        }
        let page = match self
            .log
            .read(&self.stream_id, self.next_event_number, self.page_size)
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let Some(last_number) = page.last().map(|r| r.event_number) else {
            self.done = true;
            return None;
        };
        self.next_event_number = last_number + 1;
        self.buffer.extend(page);
        self.buffer.pop_front().map(Ok)
    }
}
