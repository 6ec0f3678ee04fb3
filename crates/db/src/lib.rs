//! Embedded event-stream store with continuous projections.
//!
//! [`Rill`] bundles an append-only event log, a query surface, and a
//! projection engine behind one handle. Events are appended to named streams
//! with optimistic concurrency, read back per stream or merged across
//! streams in global order, and folded into projection states that survive
//! restarts through checkpoints.
//!
//! ```no_run
//! use rill::{
//!     ExpectedVersion, ProjectionName, ProposedEvent, Rill, SourceSelector, StreamId,
//!     CountByType, ProjectionOptions,
//! };
//!
//! # fn main() -> Result<(), rill::RillError> {
//! let db = Rill::in_memory();
//! let stream = StreamId::new("orders-1001")?;
//! db.append(
//!     &stream,
//!     ExpectedVersion::NoStream,
//!     vec![ProposedEvent::new("OrderPlaced", b"{\"total\":42}".to_vec())],
//! )?;
//!
//! let totals = ProjectionName::new("order_totals")?;
//! db.create_projection(
//!     totals.clone(),
//!     CountByType::new("OrderPlaced"),
//!     SourceSelector::category("orders-"),
//!     ProjectionOptions::default(),
//! )?;
//! db.run_projection_step(&totals)?;
//! # Ok(())
//! # }
//! ```

mod config;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

pub use config::RillConfig;
pub use rill_core::{ExpectedVersion, NameError, ProjectionName, StreamId};
pub use rill_engine::{
    Checkpoint, CheckpointError, CheckpointStore, CountByType, CountState, EngineConfig,
    EngineError, FileCheckpointStore, Fold, InMemoryCheckpointStore, ProjectionEngine,
    ProjectionHandle, ProjectionOptions, ProjectionStats, ProjectionStatus, RebuildError,
    RebuildHandle, RebuildPhase, RebuildProgress, TruncationPolicy, rebuild_projection,
};
pub use rill_observability::{init as init_tracing, init_with_default as init_tracing_with};
pub use rill_store::{
    AppendReceipt, EventFilter, EventLog, EventQuery, EventQueryResult, FileEventLog,
    InMemoryEventLog, Pagination, ProposedEvent, RecordedEvent, SourceSelector, StoreError,
    StreamMetadata, StreamReader,
};

const JOURNAL_FILE: &str = "events.jsonl";
const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Debug, thiserror::Error)]
pub enum RillError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Rebuild(#[from] RebuildError),

    #[error(transparent)]
    Name(#[from] NameError),
}

/// Handle over one event store instance: log, queries, and projections.
pub struct Rill {
    log: Arc<dyn EventLog>,
    query: Arc<dyn EventQuery>,
    checkpoints: Arc<dyn CheckpointStore>,
    engine: ProjectionEngine<Arc<dyn EventLog>, Arc<dyn CheckpointStore>>,
}

impl Rill {
    /// Open an in-memory store with default settings. Nothing survives the
    /// process.
    pub fn in_memory() -> Self {
        Self::build_in_memory(EngineConfig::default())
    }

    /// Open a store per `config`: file-backed under `data_dir` when set,
    /// in-memory otherwise.
    pub fn open(config: RillConfig) -> Result<Self, RillError> {
        let Some(dir) = config.data_dir else {
            return Ok(Self::build_in_memory(config.engine));
        };
        std::fs::create_dir_all(&dir).map_err(StoreError::storage)?;
        let log = Arc::new(FileEventLog::open(dir.join(JOURNAL_FILE))?);
        let query: Arc<dyn EventQuery> = log.clone();
        let log: Arc<dyn EventLog> = log;
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::open(dir.join(CHECKPOINT_DIR))?);
        let engine = ProjectionEngine::with_config(log.clone(), checkpoints.clone(), config.engine);
        info!(data_dir = %dir.display(), "opened file-backed event store");
        Ok(Self {
            log,
            query,
            checkpoints,
            engine,
        })
    }

    fn build_in_memory(engine_config: EngineConfig) -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let query: Arc<dyn EventQuery> = log.clone();
        let log: Arc<dyn EventLog> = log;
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let engine =
            ProjectionEngine::with_config(log.clone(), checkpoints.clone(), engine_config);
        info!("opened in-memory event store");
        Self {
            log,
            query,
            checkpoints,
            engine,
        }
    }

    /// Append a batch of events to a stream, atomically and in order.
    pub fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendReceipt, RillError> {
        Ok(self.log.append(stream_id, expected, events)?)
    }

    /// Read a stream in event-number order, starting at `from_event_number`.
    pub fn read(
        &self,
        stream_id: &StreamId,
        from_event_number: u64,
        max_count: usize,
    ) -> Result<Vec<RecordedEvent>, RillError> {
        Ok(self.log.read(stream_id, from_event_number, max_count)?)
    }

    /// Read the selected streams merged in global-position order.
    pub fn read_merged(
        &self,
        selector: &SourceSelector,
        from_global_position: u64,
        max_count: usize,
    ) -> Result<Vec<RecordedEvent>, RillError> {
        Ok(self
            .log
            .read_merged(selector, from_global_position, max_count)?)
    }

    /// Iterator over one stream, paging lazily.
    pub fn stream_reader(
        &self,
        stream_id: StreamId,
        from_event_number: u64,
    ) -> StreamReader<Arc<dyn EventLog>> {
        StreamReader::new(self.log.clone(), stream_id, from_event_number)
    }

    pub fn current_version(&self, stream_id: &StreamId) -> Result<Option<u64>, RillError> {
        Ok(self.log.current_version(stream_id)?)
    }

    pub fn stream_metadata(&self, stream_id: &StreamId) -> Result<StreamMetadata, RillError> {
        Ok(self.log.stream_metadata(stream_id)?)
    }

    /// Move a stream's truncate-before marker forward, hiding events below
    /// it from reads. Returns the new metadata version.
    pub fn set_truncate_before(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        truncate_before: u64,
    ) -> Result<u64, RillError> {
        Ok(self
            .log
            .set_truncate_before(stream_id, expected, truncate_before)?)
    }

    pub fn stream_names(&self) -> Result<Vec<StreamId>, RillError> {
        Ok(self.log.stream_names()?)
    }

    /// Query events across streams with filters and pagination.
    pub fn query_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, RillError> {
        Ok(self.query.query_events(filter, pagination)?)
    }

    pub fn get_event_by_id(&self, event_id: Uuid) -> Result<Option<RecordedEvent>, RillError> {
        Ok(self.query.get_event_by_id(event_id)?)
    }

    /// Register a projection folding the selected streams.
    pub fn create_projection<F: Fold>(
        &self,
        name: ProjectionName,
        fold: F,
        selector: SourceSelector,
        options: ProjectionOptions,
    ) -> Result<ProjectionHandle, RillError> {
        Ok(self.engine.create(name, fold, selector, options)?)
    }

    pub fn start_projection(&self, name: &ProjectionName) -> Result<(), RillError> {
        Ok(self.engine.start(name)?)
    }

    pub fn stop_projection(&self, name: &ProjectionName) -> Result<(), RillError> {
        Ok(self.engine.stop(name)?)
    }

    pub fn reset_projection(&self, name: &ProjectionName) -> Result<(), RillError> {
        Ok(self.engine.reset(name)?)
    }

    pub fn delete_projection(&self, name: &ProjectionName) -> Result<(), RillError> {
        Ok(self.engine.delete(name)?)
    }

    /// Fold at most one batch of pending events through a projection that has
    /// no running worker. Returns the number of events processed.
    pub fn run_projection_step(&self, name: &ProjectionName) -> Result<usize, RillError> {
        Ok(self.engine.run_step(name)?)
    }

    pub fn projection_state(&self, name: &ProjectionName) -> Result<JsonValue, RillError> {
        Ok(self.engine.get_state(name)?)
    }

    pub fn projection_status(&self, name: &ProjectionName) -> Result<ProjectionStatus, RillError> {
        Ok(self.engine.status(name)?)
    }

    pub fn projection_stats(&self, name: &ProjectionName) -> Result<ProjectionStats, RillError> {
        Ok(self.engine.stats(name)?)
    }

    pub fn projection_names(&self) -> Vec<ProjectionName> {
        self.engine.projection_names()
    }

    /// Rebuild a projection's checkpoint offline. The projection must not be
    /// registered and running while the rebuild is in flight. Must be called
    /// from within a Tokio runtime.
    pub async fn rebuild_projection<F: Fold>(
        &self,
        name: ProjectionName,
        fold: F,
        selector: SourceSelector,
    ) -> Result<RebuildHandle, RillError> {
        Ok(rebuild_projection(
            self.log.clone(),
            self.checkpoints.clone(),
            name,
            fold,
            selector,
        )
        .await?)
    }

    /// Stop all projection workers. Registrations and the log are kept.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trips_events() {
        let db = Rill::in_memory();
        let stream = StreamId::new("orders-1").expect("valid stream id");
        db.append(
            &stream,
            ExpectedVersion::NoStream,
            vec![
                ProposedEvent::new("OrderPlaced", b"{}".to_vec()),
                ProposedEvent::new("OrderShipped", b"{}".to_vec()),
            ],
        )
        .expect("append");

        let events = db.read(&stream, 0, 10).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "OrderPlaced");
        assert_eq!(db.current_version(&stream).expect("version"), Some(1));
    }

    #[test]
    fn open_without_data_dir_is_in_memory() {
        let db = Rill::open(RillConfig::new()).expect("open");
        let stream = StreamId::new("orders-1").expect("valid stream id");
        db.append(
            &stream,
            ExpectedVersion::Any,
            vec![ProposedEvent::new("OrderPlaced", Vec::new())],
        )
        .expect("append");
        assert_eq!(db.stream_names().expect("names").len(), 1);
    }
}
