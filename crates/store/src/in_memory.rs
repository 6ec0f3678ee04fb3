//! In-memory event log (tests, development, callers without durability
//! needs).

use std::sync::atomic::{AtomicU64, Ordering};

use rill_core::{ExpectedVersion, StreamId};

use crate::error::{StoreError, StoreResult};
use crate::index::{self, AppendPlan, StreamIndex};
use crate::log::EventLog;
use crate::record::{AppendReceipt, ProposedEvent, RecordedEvent, StreamMetadata};
use crate::seq::GlobalSequencer;
use crate::source::SourceSelector;
use crate::truncation;

/// Non-durable [`EventLog`] holding everything in process memory.
///
/// Semantics match the file-backed log exactly, minus durability, so tests
/// written against this implementation transfer.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    index: StreamIndex,
    seq: GlobalSequencer,
    truncation_stamp: AtomicU64,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn index(&self) -> &StreamIndex {
        &self.index
    }

    pub(crate) fn sequencer(&self) -> &GlobalSequencer {
        &self.seq
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> StoreResult<AppendReceipt> {
        let slot = self.index.get_or_create(stream_id)?;
        let mut state = slot.lock()?;
        match index::plan_append(&state, stream_id, expected, events)? {
            AppendPlan::AlreadyCommitted {
                current_version,
                deduplicated,
            } => Ok(AppendReceipt {
                stream_id: stream_id.clone(),
                new_version: current_version,
                last_global_position: None,
                appended: 0,
                deduplicated,
            }),
            AppendPlan::Commit(prepared) => {
                let deduplicated = prepared.deduplicated;
                let reservation = self.seq.reserve(prepared.fresh.len() as u64);
                let records = index::build_records(
                    stream_id,
                    prepared.fresh,
                    prepared.first_event_number,
                    &reservation,
                );
                let receipt = AppendReceipt {
                    stream_id: stream_id.clone(),
                    new_version: records
                        .last()
                        .map(|r| r.event_number)
                        .or_else(|| state.current_version()),
                    last_global_position: records.last().map(|r| r.global_position),
                    appended: records.len(),
                    deduplicated,
                };
                state.commit(records);
                self.seq.release(reservation);
                Ok(receipt)
            }
        }
    }

    fn read(
        &self,
        stream_id: &StreamId,
        from_event_number: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        match self.index.get(stream_id)? {
            None => Ok(Vec::new()),
            Some(slot) => {
                let state = slot.lock()?;
                Ok(state.read_page(from_event_number, max_count))
            }
        }
    }

    fn read_merged(
        &self,
        selector: &SourceSelector,
        from_global_position: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        index::read_merged(&self.index, &self.seq, selector, from_global_position, max_count)
    }

    fn current_version(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        match self.index.get(stream_id)? {
            None => Ok(None),
            Some(slot) => Ok(slot.lock()?.current_version()),
        }
    }

    fn stream_metadata(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata> {
        let slot = self
            .index
            .get(stream_id)?
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
        let state = slot.lock()?;
        if !state.exists() {
            return Err(StoreError::StreamNotFound(stream_id.clone()));
        }
        Ok(state.metadata())
    }

    fn set_truncate_before(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        truncate_before: u64,
    ) -> StoreResult<u64> {
        let slot = self
            .index
            .get(stream_id)?
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
        let mut state = slot.lock()?;
        if !state.exists() {
            return Err(StoreError::StreamNotFound(stream_id.clone()));
        }
        let metadata = state.metadata();
        truncation::check_marker_move(stream_id, &metadata, expected, truncate_before)?;
        let updated = truncation::apply_marker_move(metadata, truncate_before);
        state.set_metadata(updated);
        self.truncation_stamp.fetch_add(1, Ordering::SeqCst);
        Ok(updated.metadata_version)
    }

    fn stream_names(&self) -> StoreResult<Vec<StreamId>> {
        self.index.names()
    }

    fn horizon(&self) -> u64 {
        self.seq.horizon()
    }

    fn truncation_stamp(&self) -> u64 {
        self.truncation_stamp.load(Ordering::SeqCst)
    }
}
