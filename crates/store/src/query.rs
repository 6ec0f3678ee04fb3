//! Event query interface for inspection and debugging.
//!
//! This module provides read-only query capabilities over the committed
//! events of a log. Queries see the merged view: global-position order,
//! truncation markers applied, bounded by the committed horizon.

use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rill_core::StreamId;

use crate::error::StoreResult;
use crate::file::FileEventLog;
use crate::in_memory::InMemoryEventLog;
use crate::index::StreamIndex;
use crate::record::RecordedEvent;
use crate::seq::GlobalSequencer;
use crate::source::SourceSelector;

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50, // Safe default
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000), // Cap at 1000 for safety
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for event queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Filter by stream (optional).
    pub stream_id: Option<StreamId>,
    /// Filter by event type (optional, e.g. `AddedEvent`).
    pub event_type: Option<String>,
    /// Filter events recorded after this time (optional).
    pub recorded_after: Option<DateTime<Utc>>,
    /// Filter events recorded before this time (optional).
    pub recorded_before: Option<DateTime<Utc>>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            stream_id: None,
            event_type: None,
            recorded_after: None,
            recorded_before: None,
        }
    }
}

impl EventFilter {
    fn matches(&self, event: &RecordedEvent) -> bool {
        if let Some(stream_id) = &self.stream_id
            && event.stream_id != *stream_id
        {
            return false;
        }
        if let Some(event_type) = &self.event_type
            && event.event_type != *event_type
        {
            return false;
        }
        if let Some(after) = self.recorded_after
            && event.recorded_at <= after
        {
            return false;
        }
        if let Some(before) = self.recorded_before
            && event.recorded_at >= before
        {
            return false;
        }
        true
    }
}

/// Paginated event query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueryResult {
    /// The events matching the query, in global-position order.
    pub events: Vec<RecordedEvent>,
    /// Total number of events matching the filter (across all pages).
    pub total: u64,
    /// Pagination parameters used.
    pub pagination: Pagination,
    /// Whether there are more events available.
    pub has_more: bool,
}

/// Query interface for event inspection.
pub trait EventQuery: Send + Sync {
    /// Query events with optional filters and pagination, ordered by global
    /// position (ascending).
    fn query_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> StoreResult<EventQueryResult>;

    /// Get events of a single stream through the query interface.
    fn get_stream_events(
        &self,
        stream_id: StreamId,
        pagination: Option<Pagination>,
    ) -> StoreResult<EventQueryResult> {
        let filter = EventFilter {
            stream_id: Some(stream_id),
            ..Default::default()
        };
        self.query_events(&filter, pagination.unwrap_or_default())
    }

    /// Get a single visible event by its id.
    fn get_event_by_id(&self, event_id: Uuid) -> StoreResult<Option<RecordedEvent>>;
}

/// Heap entry ordered by global position, so the heap root is always the
/// highest-positioned event kept so far.
struct ByPosition(RecordedEvent);

impl PartialEq for ByPosition {
    fn eq(&self, other: &Self) -> bool {
        self.0.global_position == other.0.global_position
    }
}

impl Eq for ByPosition {}

impl PartialOrd for ByPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.global_position.cmp(&other.0.global_position)
    }
}

pub(crate) fn run_query(
    index: &StreamIndex,
    seq: &GlobalSequencer,
    filter: &EventFilter,
    pagination: Pagination,
) -> StoreResult<EventQueryResult> {
    let selector = match &filter.stream_id {
        Some(stream_id) => SourceSelector::stream(stream_id.clone()),
        None => SourceSelector::all(),
    };
    let horizon = seq.horizon();
    let take = (pagination.offset as usize).saturating_add(pagination.limit as usize);

    // Only the `offset + limit` lowest-positioned matches can end up on the
    // page, so keep a bounded max-heap of candidates while counting every
    // match, instead of materializing the whole visible log.
    let mut total = 0u64;
    let mut keep: BinaryHeap<ByPosition> = BinaryHeap::with_capacity(take.min(1024));
    for (_, slot) in index.matching(&selector)? {
        slot.lock()?.visit_visible(horizon, &mut |event| {
            if !filter.matches(event) {
                return;
            }
            total += 1;
            if take == 0 {
                return;
            }
            let full = keep.len() == take;
            if full
                && keep
                    .peek()
                    .is_some_and(|worst| worst.0.global_position <= event.global_position)
            {
                return;
            }
            keep.push(ByPosition(event.clone()));
            if full {
                keep.pop();
            }
        });
    }

    let mut page: Vec<RecordedEvent> = keep.into_sorted_vec().into_iter().map(|b| b.0).collect();
    let start = (pagination.offset as usize).min(page.len());
    let events = page.split_off(start);
    let has_more = total > (start + events.len()) as u64;
    Ok(EventQueryResult {
        events,
        total,
        pagination,
        has_more,
    })
}

pub(crate) fn find_event(
    index: &StreamIndex,
    event_id: Uuid,
) -> StoreResult<Option<RecordedEvent>> {
    for (_, slot) in index.matching(&SourceSelector::all())? {
        if let Some(event) = slot.lock()?.find_visible(&event_id) {
            return Ok(Some(event));
        }
    }
    Ok(None)
}

impl EventQuery for InMemoryEventLog {
    fn query_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> StoreResult<EventQueryResult> {
        run_query(self.index(), self.sequencer(), filter, pagination)
    }

    fn get_event_by_id(&self, event_id: Uuid) -> StoreResult<Option<RecordedEvent>> {
        find_event(self.index(), event_id)
    }
}

impl EventQuery for FileEventLog {
    fn query_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> StoreResult<EventQueryResult> {
        run_query(self.index(), self.sequencer(), filter, pagination)
    }

    fn get_event_by_id(&self, event_id: Uuid) -> StoreResult<Option<RecordedEvent>> {
        find_event(self.index(), event_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::log::EventLog;
    use crate::record::ProposedEvent;
    use rill_core::ExpectedVersion;

    fn sid(name: &str) -> StreamId {
        StreamId::new(name).expect("valid stream id")
    }

    fn seeded_log() -> InMemoryEventLog {
        let log = InMemoryEventLog::new();
        for round in 0..4 {
            log.append(
                &sid("orders-1"),
                ExpectedVersion::Any,
                vec![ProposedEvent::new("Placed", vec![round])],
            )
            .expect("orders");
            log.append(
                &sid("shipments-1"),
                ExpectedVersion::Any,
                vec![ProposedEvent::new("Shipped", vec![round])],
            )
            .expect("shipments");
        }
        log
    }

    #[test]
    fn unfiltered_query_returns_global_order() {
        let log = seeded_log();
        let result = log
            .query_events(&EventFilter::default(), Pagination::default())
            .expect("query");
        assert_eq!(result.total, 8);
        assert!(!result.has_more);
        assert!(
            result
                .events
                .windows(2)
                .all(|w| w[0].global_position < w[1].global_position)
        );
    }

    #[test]
    fn filters_compose() {
        let log = seeded_log();
        let filter = EventFilter {
            stream_id: Some(sid("orders-1")),
            event_type: Some("Placed".into()),
            ..Default::default()
        };
        let result = log
            .query_events(&filter, Pagination::default())
            .expect("query");
        assert_eq!(result.total, 4);

        let none = EventFilter {
            stream_id: Some(sid("orders-1")),
            event_type: Some("Shipped".into()),
            ..Default::default()
        };
        assert_eq!(
            log.query_events(&none, Pagination::default())
                .expect("query")
                .total,
            0
        );
    }

    #[test]
    fn time_window_filters_apply() {
        let log = seeded_log();
        let now = chrono::Utc::now();
        let recent = EventFilter {
            recorded_after: Some(now - Duration::hours(1)),
            recorded_before: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(
            log.query_events(&recent, Pagination::default())
                .expect("query")
                .total,
            8
        );
        let future = EventFilter {
            recorded_after: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(
            log.query_events(&future, Pagination::default())
                .expect("query")
                .total,
            0
        );
    }

    #[test]
    fn pagination_reports_remaining_pages() {
        let log = seeded_log();
        let first = log
            .query_events(
                &EventFilter::default(),
                Pagination::new(Some(3), None),
            )
            .expect("first page");
        assert_eq!(first.events.len(), 3);
        assert_eq!(first.total, 8);
        assert!(first.has_more);

        let last = log
            .query_events(
                &EventFilter::default(),
                Pagination::new(Some(3), Some(6)),
            )
            .expect("last page");
        assert_eq!(last.events.len(), 2);
        assert!(!last.has_more);
    }

    #[test]
    fn offset_past_the_last_match_yields_an_empty_page() {
        let log = seeded_log();
        let result = log
            .query_events(&EventFilter::default(), Pagination::new(Some(3), Some(20)))
            .expect("query");
        assert!(result.events.is_empty());
        assert_eq!(result.total, 8);
        assert!(!result.has_more);
    }

    #[test]
    fn bounded_page_matches_the_full_scan_slice() {
        let log = seeded_log();
        let everything = log
            .query_events(&EventFilter::default(), Pagination::new(Some(1000), None))
            .expect("full scan");

        let page = log
            .query_events(&EventFilter::default(), Pagination::new(Some(2), Some(3)))
            .expect("page");
        assert_eq!(page.total, 8);
        assert!(page.has_more);
        assert_eq!(
            page.events
                .iter()
                .map(|e| e.global_position)
                .collect::<Vec<_>>(),
            everything.events[3..5]
                .iter()
                .map(|e| e.global_position)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn event_lookup_honors_truncation() {
        let log = seeded_log();
        let hidden = log.read(&sid("orders-1"), 0, 1).expect("read")[0].clone();
        log.set_truncate_before(&sid("orders-1"), ExpectedVersion::Any, 2)
            .expect("truncate");

        assert_eq!(log.get_event_by_id(hidden.event_id).expect("lookup"), None);
        let visible = log.read(&sid("orders-1"), 2, 1).expect("read")[0].clone();
        assert_eq!(
            log.get_event_by_id(visible.event_id).expect("lookup"),
            Some(visible)
        );
        assert_eq!(log.get_event_by_id(Uuid::now_v7()).expect("lookup"), None);
    }
}
