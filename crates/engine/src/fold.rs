//! Fold functions: deterministic reducers over recorded events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use rill_store::RecordedEvent;

/// A deterministic reducer building projection state from events.
///
/// ## Contract
///
/// - `State::default()` is the state of a fresh (or freshly reset) projection
/// - `apply` must be deterministic: the same events in the same order always
///   produce the same state
/// - unknown event types should be ignored, so sources can grow new event
///   types without breaking existing projections
///
/// The engine snapshots state through serde for checkpoints and for
/// `get_state`, so `State` must round-trip through JSON unchanged.
pub trait Fold: Send + Sync + 'static {
    type State: Default + Clone + Send + Serialize + DeserializeOwned + 'static;

    fn apply(&self, state: &mut Self::State, event: &RecordedEvent);
}

/// Object-safe pairing of a fold with its live state, so the engine can hold
/// projections of different state types in one registry.
pub(crate) trait ErasedFold: Send {
    fn apply(&mut self, event: &RecordedEvent);
    fn snapshot(&self) -> Result<JsonValue, serde_json::Error>;
    fn restore(&mut self, snapshot: JsonValue) -> Result<(), serde_json::Error>;
    fn reset(&mut self);
}

pub(crate) struct FoldRunner<F: Fold> {
    fold: F,
    state: F::State,
}

impl<F: Fold> FoldRunner<F> {
    pub fn new(fold: F) -> Self {
        Self {
            state: F::State::default(),
            fold,
        }
    }
}

impl<F: Fold> ErasedFold for FoldRunner<F> {
    fn apply(&mut self, event: &RecordedEvent) {
        self.fold.apply(&mut self.state, event);
    }

    fn snapshot(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(&self.state)
    }

    fn restore(&mut self, snapshot: JsonValue) -> Result<(), serde_json::Error> {
        self.state = serde_json::from_value(snapshot)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = F::State::default();
    }
}

/// Counts events of a single type.
///
/// The smallest useful fold; its `{"count": n}` state shape is what the
/// integration tests assert against.
pub struct CountByType {
    event_type: String,
}

impl CountByType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
        }
    }
}

/// State of [`CountByType`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountState {
    pub count: u64,
}

impl Fold for CountByType {
    type State = CountState;

    fn apply(&self, state: &mut CountState, event: &RecordedEvent) {
        if event.event_type == self.event_type {
            state.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rill_core::StreamId;
    use uuid::Uuid;

    use super::*;

    fn event(event_type: &str) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::new("orders-1").expect("valid stream id"),
            event_number: 0,
            global_position: 0,
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            recorded_at: Utc::now(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn count_by_type_ignores_other_event_types() {
        let fold = CountByType::new("AddedEvent");
        let mut state = CountState::default();
        fold.apply(&mut state, &event("AddedEvent"));
        fold.apply(&mut state, &event("RemovedEvent"));
        fold.apply(&mut state, &event("AddedEvent"));
        assert_eq!(state.count, 2);
    }

    #[test]
    fn runner_round_trips_state_through_snapshots() {
        let mut runner = FoldRunner::new(CountByType::new("AddedEvent"));
        runner.apply(&event("AddedEvent"));
        runner.apply(&event("AddedEvent"));

        let snapshot = runner.snapshot().expect("snapshot");
        assert_eq!(snapshot, serde_json::json!({"count": 2}));

        let mut restored = FoldRunner::new(CountByType::new("AddedEvent"));
        restored.restore(snapshot).expect("restore");
        restored.apply(&event("AddedEvent"));
        assert_eq!(
            restored.snapshot().expect("snapshot"),
            serde_json::json!({"count": 3})
        );

        restored.reset();
        assert_eq!(
            restored.snapshot().expect("snapshot"),
            serde_json::json!({"count": 0})
        );
    }
}
