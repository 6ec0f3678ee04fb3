//! In-memory stream index shared by the log implementations.
//!
//! Maps each stream to its committed records and its metadata. The index
//! never deletes records: a truncation marker only narrows visibility, so
//! within a stream `records[n].event_number == n` always holds and event
//! number lookups are direct indexing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use uuid::Uuid;

use rill_core::{ExpectedVersion, StreamId};

use crate::error::{StoreError, StoreResult};
use crate::record::{ProposedEvent, RecordedEvent, StreamMetadata};
use crate::seq::{GlobalSequencer, Reservation};
use crate::source::SourceSelector;

/// Records and metadata of a single stream.
///
/// Guarded by the owning slot's mutex; one writer per stream at a time.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    records: Vec<RecordedEvent>,
    metadata: StreamMetadata,
    event_ids: HashSet<Uuid>,
}

impl StreamState {
    /// A stream exists once an event has been committed to it. Slots created
    /// by failed appends do not count.
    pub fn exists(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.records.last().map(|r| r.event_number)
    }

    pub fn next_event_number(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn metadata(&self) -> StreamMetadata {
        self.metadata
    }

    pub fn set_metadata(&mut self, metadata: StreamMetadata) {
        self.metadata = metadata;
    }

    pub fn contains_event(&self, event_id: &Uuid) -> bool {
        self.event_ids.contains(event_id)
    }

    /// Append committed records. Callers must have numbered them with
    /// `build_records` under the same slot lock.
    pub fn commit(&mut self, records: Vec<RecordedEvent>) {
        for record in records {
            self.event_ids.insert(record.event_id);
            self.records.push(record);
        }
    }

    /// Visible page of the stream, `from` clamped up to the truncation floor.
    pub fn read_page(&self, from: u64, max_count: usize) -> Vec<RecordedEvent> {
        let from = from.max(self.metadata.visible_floor());
        if from >= self.next_event_number() {
            return Vec::new();
        }
        let start = from as usize;
        let end = start.saturating_add(max_count).min(self.records.len());
        self.records[start..end].to_vec()
    }

    /// Collect up to `max_count` visible records with a global position in
    /// `[from_global, horizon)` into `out`.
    pub fn collect_merged(
        &self,
        from_global: u64,
        horizon: u64,
        max_count: usize,
        out: &mut Vec<RecordedEvent>,
    ) {
        let floor = self.metadata.visible_floor();
        let start = self
            .records
            .partition_point(|r| r.global_position < from_global);
        out.extend(
            self.records[start..]
                .iter()
                .take_while(|r| r.global_position < horizon)
                .filter(|r| r.event_number >= floor)
                .take(max_count)
                .cloned(),
        );
    }

    /// Walk every visible record below `horizon` without cloning, in
    /// event-number order.
    pub fn visit_visible(&self, horizon: u64, f: &mut dyn FnMut(&RecordedEvent)) {
        let floor = self.metadata.visible_floor();
        for record in self
            .records
            .iter()
            .take_while(|r| r.global_position < horizon)
            .filter(|r| r.event_number >= floor)
        {
            f(record);
        }
    }

    /// Highest global position committed to this stream.
    pub fn last_global_position(&self) -> Option<u64> {
        self.records.last().map(|r| r.global_position)
    }

    /// Look an event up by id, honoring the truncation floor.
    pub fn find_visible(&self, event_id: &Uuid) -> Option<RecordedEvent> {
        if !self.contains_event(event_id) {
            return None;
        }
        let floor = self.metadata.visible_floor();
        self.records
            .iter()
            .find(|r| r.event_id == *event_id && r.event_number >= floor)
            .cloned()
    }
}

/// One stream's slot in the index. Appends and metadata writes to the same
/// stream serialize on `state`; different streams proceed in parallel.
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    state: Mutex<StreamState>,
}

impl StreamSlot {
    pub fn lock(&self) -> StoreResult<MutexGuard<'_, StreamState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::storage("stream state lock poisoned"))
    }
}

/// The stream map itself. The outer lock is held only to look slots up,
/// never while a slot is locked.
#[derive(Debug, Default)]
pub(crate) struct StreamIndex {
    streams: RwLock<HashMap<StreamId, Arc<StreamSlot>>>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: &StreamId) -> StoreResult<Option<Arc<StreamSlot>>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StoreError::storage("stream index lock poisoned"))?;
        Ok(streams.get(stream_id).cloned())
    }

    pub fn get_or_create(&self, stream_id: &StreamId) -> StoreResult<Arc<StreamSlot>> {
        if let Some(slot) = self.get(stream_id)? {
            return Ok(slot);
        }
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StoreError::storage("stream index lock poisoned"))?;
        Ok(streams.entry(stream_id.clone()).or_default().clone())
    }

    /// Slots matching `selector`, ordered by stream name for deterministic
    /// scans.
    pub fn matching(&self, selector: &SourceSelector) -> StoreResult<Vec<(StreamId, Arc<StreamSlot>)>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StoreError::storage("stream index lock poisoned"))?;
        let mut slots: Vec<(StreamId, Arc<StreamSlot>)> = streams
            .iter()
            .filter(|(id, _)| selector.matches(id))
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        drop(streams);
        slots.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(slots)
    }

    /// Names of streams that exist (have at least one committed event).
    pub fn names(&self) -> StoreResult<Vec<StreamId>> {
        let mut names = Vec::new();
        for (id, slot) in self.matching(&SourceSelector::all())? {
            if slot.lock()?.exists() {
                names.push(id);
            }
        }
        Ok(names)
    }
}

/// What an append will do once the per-stream lock is held.
#[derive(Debug)]
pub(crate) enum AppendPlan {
    /// Every event in a non-empty batch is already committed: a retry of an
    /// earlier append. Nothing to write, no version check.
    AlreadyCommitted {
        current_version: Option<u64>,
        deduplicated: usize,
    },
    /// Write `fresh` (possibly empty for an empty batch) after the version
    /// check passed.
    Commit(PreparedAppend),
}

#[derive(Debug)]
pub(crate) struct PreparedAppend {
    pub fresh: Vec<ProposedEvent>,
    pub deduplicated: usize,
    pub first_event_number: u64,
}

/// Validate a batch against the locked stream state and decide what to write.
///
/// Duplicate `event_id`s (against the stream or within the batch itself)
/// are dropped, keeping the first occurrence. A non-empty batch whose events
/// are all already present short-circuits as an idempotent retry before the
/// version check, so retrying with a stale expectation still succeeds.
pub(crate) fn plan_append(
    state: &StreamState,
    stream_id: &StreamId,
    expected: ExpectedVersion,
    events: Vec<ProposedEvent>,
) -> StoreResult<AppendPlan> {
    for event in &events {
        if event.event_type.is_empty() {
            return Err(StoreError::invalid_append("event_type must not be empty"));
        }
    }

    let batch_len = events.len();
    let mut seen = HashSet::with_capacity(batch_len);
    let mut fresh = Vec::with_capacity(batch_len);
    for event in events {
        if !seen.insert(event.event_id) || state.contains_event(&event.event_id) {
            continue;
        }
        fresh.push(event);
    }
    let deduplicated = batch_len - fresh.len();

    if fresh.is_empty() && deduplicated > 0 {
        return Ok(AppendPlan::AlreadyCommitted {
            current_version: state.current_version(),
            deduplicated,
        });
    }

    let current = state.current_version();
    if !expected.matches(current) {
        return Err(StoreError::WrongExpectedVersion {
            stream: stream_id.clone(),
            expected,
            current,
        });
    }

    Ok(AppendPlan::Commit(PreparedAppend {
        fresh,
        deduplicated,
        first_event_number: state.next_event_number(),
    }))
}

/// Number a prepared batch: contiguous event numbers from
/// `first_event_number`, global positions from the reservation, one shared
/// timestamp.
pub(crate) fn build_records(
    stream_id: &StreamId,
    fresh: Vec<ProposedEvent>,
    first_event_number: u64,
    reservation: &Reservation,
) -> Vec<RecordedEvent> {
    let recorded_at = Utc::now();
    fresh
        .into_iter()
        .zip(reservation.positions())
        .enumerate()
        .map(|(offset, (event, global_position))| RecordedEvent {
            stream_id: stream_id.clone(),
            event_number: first_event_number + offset as u64,
            global_position,
            event_id: event.event_id,
            event_type: event.event_type,
            recorded_at,
            payload: event.payload,
        })
        .collect()
}

/// Merge visible records from every matching stream into global order.
///
/// The horizon is snapshotted first: positions below it can no longer be
/// reserved, so a concurrent append can only add records this scan was never
/// going to return. Slots are locked one at a time.
pub(crate) fn read_merged(
    index: &StreamIndex,
    seq: &GlobalSequencer,
    selector: &SourceSelector,
    from_global: u64,
    max_count: usize,
) -> StoreResult<Vec<RecordedEvent>> {
    if max_count == 0 {
        return Ok(Vec::new());
    }
    let horizon = seq.horizon();
    let mut merged = Vec::new();
    for (_, slot) in index.matching(selector)? {
        slot.lock()?
            .collect_merged(from_global, horizon, max_count, &mut merged);
    }
    merged.sort_unstable_by_key(|r| r.global_position);
    merged.truncate(max_count);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::new("orders-1").expect("valid stream id")
    }

    fn committed_state(count: usize) -> StreamState {
        let mut state = StreamState::default();
        let seq = GlobalSequencer::new();
        let batch: Vec<ProposedEvent> = (0..count)
            .map(|i| ProposedEvent::new("Placed", vec![i as u8]))
            .collect();
        let reservation = seq.reserve(batch.len() as u64);
        let records = build_records(&stream(), batch, 0, &reservation);
        state.commit(records);
        seq.release(reservation);
        state
    }

    #[test]
    fn plan_rejects_empty_event_types() {
        let state = StreamState::default();
        let err = plan_append(
            &state,
            &stream(),
            ExpectedVersion::Any,
            vec![ProposedEvent::new("", vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidAppend(_)));
    }

    #[test]
    fn plan_short_circuits_full_retries_before_the_version_check() {
        let state = committed_state(3);
        let replay: Vec<ProposedEvent> = state
            .read_page(0, 3)
            .into_iter()
            .map(|r| ProposedEvent {
                event_id: r.event_id,
                event_type: r.event_type,
                payload: r.payload,
            })
            .collect();
        // Stale expectation on purpose: the retry must still be accepted.
        let plan = plan_append(&state, &stream(), ExpectedVersion::Exact(0), replay)
            .expect("retry accepted");
        assert!(matches!(
            plan,
            AppendPlan::AlreadyCommitted {
                current_version: Some(2),
                deduplicated: 3,
            }
        ));
    }

    #[test]
    fn plan_drops_intra_batch_duplicates() {
        let state = StreamState::default();
        let event = ProposedEvent::new("Placed", vec![1]);
        let batch = vec![event.clone(), event, ProposedEvent::new("Placed", vec![2])];
        match plan_append(&state, &stream(), ExpectedVersion::NoStream, batch).expect("planned") {
            AppendPlan::Commit(prepared) => {
                assert_eq!(prepared.fresh.len(), 2);
                assert_eq!(prepared.deduplicated, 1);
                assert_eq!(prepared.first_event_number, 0);
            }
            AppendPlan::AlreadyCommitted { .. } => panic!("expected a commit plan"),
        }
    }

    #[test]
    fn plan_enforces_the_version_check_for_partial_batches() {
        let state = committed_state(2);
        let mut batch: Vec<ProposedEvent> = state
            .read_page(0, 1)
            .into_iter()
            .map(|r| ProposedEvent {
                event_id: r.event_id,
                event_type: r.event_type,
                payload: r.payload,
            })
            .collect();
        batch.push(ProposedEvent::new("Placed", vec![9]));
        let err = plan_append(&state, &stream(), ExpectedVersion::Exact(0), batch).unwrap_err();
        assert!(matches!(
            err,
            StoreError::WrongExpectedVersion {
                current: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn read_page_clamps_to_the_truncation_floor() {
        let mut state = committed_state(5);
        state.set_metadata(StreamMetadata {
            truncate_before: Some(3),
            metadata_version: 1,
        });
        let visible = state.read_page(0, 10);
        assert_eq!(
            visible.iter().map(|r| r.event_number).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(state.current_version(), Some(4));
    }
}
