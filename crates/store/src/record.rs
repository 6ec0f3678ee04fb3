//! Event records: proposed (client-side) and recorded (committed) forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rill_core::StreamId;

use crate::error::{StoreError, StoreResult};

/// An event ready to be appended to a stream (not yet assigned any numbers).
///
/// `ProposedEvent` is what clients hand to `EventLog::append`. The log
/// assigns the per-stream event number and the global position during commit.
///
/// ## Idempotency
///
/// `event_id` is chosen by the client. Retrying an append with the same
/// `event_id`s is safe: events whose id is already present in the stream are
/// skipped instead of being written twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl ProposedEvent {
    /// Create an event with a fresh UUIDv7 `event_id` and an opaque payload.
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Convenience constructor serializing a typed payload to JSON bytes.
    pub fn json<E>(event_type: impl Into<String>, payload: &E) -> StoreResult<Self>
    where
        E: Serialize,
    {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| StoreError::invalid_append(format!("payload serialization failed: {e}")))?;
        Ok(Self::new(event_type, payload))
    }

    /// Replace the generated `event_id` (retries, deterministic tests).
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

/// A committed event in an append-only stream.
///
/// `RecordedEvent` is what reads return. Both numbers are assigned by the log
/// during commit and never change afterwards:
///
/// - `event_number` is the position within the stream, contiguous from 0
/// - `global_position` fixes the event's place in the store-wide total order;
///   it is strictly increasing across all streams but **not** contiguous
///   (aborted appends leave permanent holes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: StreamId,
    /// Position within the stream, starting at 0.
    pub event_number: u64,
    /// Position in the store-wide total order.
    pub global_position: u64,

    pub event_id: Uuid,
    pub event_type: String,
    pub recorded_at: DateTime<Utc>,

    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl RecordedEvent {
    /// Deserialize the payload as JSON into a typed value.
    pub fn payload_json<E>(&self) -> Result<E, serde_json::Error>
    where
        E: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.payload)
    }
}

/// Per-stream metadata record.
///
/// `metadata_version` counts metadata writes (0 = never written) and is the
/// value checked by `ExpectedVersion` on metadata updates.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Events with `event_number` below this marker are logically deleted.
    pub truncate_before: Option<u64>,
    pub metadata_version: u64,
}

impl StreamMetadata {
    /// First event number still visible under the truncation marker.
    pub fn visible_floor(&self) -> u64 {
        self.truncate_before.unwrap_or(0)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub stream_id: StreamId,
    /// Stream version after the call (last event number); `None` when the
    /// stream is still empty.
    pub new_version: Option<u64>,
    /// Global position of the last event committed **by this call**; `None`
    /// when the call wrote nothing (empty batch or fully deduplicated retry).
    pub last_global_position: Option<u64>,
    /// Events written by this call.
    pub appended: usize,
    /// Events skipped because their `event_id` was already present.
    pub deduplicated: usize,
}

mod payload_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
