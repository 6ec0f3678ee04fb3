//! Projection engine: registry, lifecycle, and the per-event stepping core.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info};

use rill_core::{ProjectionName, StreamId};
use rill_store::{EventLog, RecordedEvent, SourceSelector, StoreError};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::fold::{ErasedFold, Fold, FoldRunner};
use crate::worker::{self, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("projection already exists: {0}")]
    DuplicateName(ProjectionName),

    #[error("projection not found: {0}")]
    NotFound(ProjectionName),

    #[error("projection {name} faulted: {reason}")]
    Faulted {
        name: ProjectionName,
        reason: String,
    },

    #[error("projection is running: {0}")]
    Running(ProjectionName),

    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("projection state error: {0}")]
    State(String),
}

/// Where a projection sits in its lifecycle.
///
/// `Created` -> `Running` -> (`Stopped` | `Faulted`); `reset` returns any
/// state to `Created`. A faulted projection refuses to start or step until
/// it is reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProjectionStatus {
    Created,
    Running,
    Stopped,
    Faulted { reason: String },
}

/// How a projection reacts when a source stream's truncate-before marker
/// moves while the projection is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Keep the accumulated state; already-folded events stay folded even
    /// though reads no longer return them.
    #[default]
    Ignore,
    /// Discard state and checkpoint, then replay the still-visible events.
    ResetAndReplay,
}

/// Per-projection settings supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct ProjectionOptions {
    pub start_running: bool,
    pub truncation_policy: TruncationPolicy,
}

impl ProjectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_running(mut self, start_running: bool) -> Self {
        self.start_running = start_running;
        self
    }

    pub fn with_truncation_policy(mut self, policy: TruncationPolicy) -> Self {
        self.truncation_policy = policy;
        self
    }
}

/// Engine-wide tuning knobs shared by all projection workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle wait before re-polling an exhausted source.
    pub poll_interval: Duration,
    /// Upper bound the idle wait backs off towards.
    pub max_poll_interval: Duration,
    /// Events fetched per step.
    pub batch_size: usize,
    /// Checkpoint after this many events since the last checkpoint.
    pub checkpoint_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_millis(500),
            batch_size: 256,
            checkpoint_every: 1000,
        }
    }
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_poll_interval(mut self, max_poll_interval: Duration) -> Self {
        self.max_poll_interval = max_poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        // a zero batch would never make progress
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_checkpoint_every(mut self, checkpoint_every: u64) -> Self {
        self.checkpoint_every = checkpoint_every.max(1);
        self
    }
}

/// Counters snapshot for one projection.
///
/// `events_processed` counts the events folded into the current state; both
/// deliberate resets and truncation-triggered resets clear it along with
/// `last_processed`. `checkpoints_written` and `resets` are lifetime totals
/// for the registration.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectionStats {
    pub name: ProjectionName,
    pub status: ProjectionStatus,
    pub last_processed: Option<u64>,
    pub events_processed: u64,
    pub checkpoints_written: u64,
    pub resets: u64,
}

/// Truncation bookkeeping: the stamp last seen and the visible floor of each
/// matched stream at that point.
#[derive(Debug, Default)]
struct TruncationWatch {
    observed_stamp: Option<u64>,
    markers: HashMap<StreamId, u64>,
}

/// Mutable half of a projection: the fold plus its progress counters.
/// Exactly one stepper (worker thread or manual `run_step`) drives it at a
/// time; the mutex also guards state snapshots taken by readers.
pub(crate) struct ProjectionCore {
    fold: Box<dyn ErasedFold>,
    last_processed: Option<u64>,
    events_processed: u64,
    checkpoints_written: u64,
    events_since_checkpoint: u64,
    resets: u64,
    truncation: TruncationWatch,
}

pub(crate) struct ProjectionEntry {
    pub(crate) name: ProjectionName,
    pub(crate) selector: SourceSelector,
    pub(crate) policy: TruncationPolicy,
    core: Mutex<ProjectionCore>,
    status: Mutex<ProjectionStatus>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ProjectionEntry {
    fn new(
        name: ProjectionName,
        selector: SourceSelector,
        policy: TruncationPolicy,
        fold: Box<dyn ErasedFold>,
    ) -> Self {
        Self {
            name,
            selector,
            policy,
            core: Mutex::new(ProjectionCore {
                fold,
                last_processed: None,
                events_processed: 0,
                checkpoints_written: 0,
                events_since_checkpoint: 0,
                resets: 0,
                truncation: TruncationWatch::default(),
            }),
            status: Mutex::new(ProjectionStatus::Created),
            worker: Mutex::new(None),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, ProjectionCore> {
        self.core.lock().unwrap()
    }

    pub(crate) fn status(&self) -> ProjectionStatus {
        self.status.lock().unwrap().clone()
    }

    pub(crate) fn set_status(&self, status: ProjectionStatus) {
        *self.status.lock().unwrap() = status;
    }
}

/// Handle returned by [`ProjectionEngine::create`]; a cheap reference to the
/// registered projection.
#[derive(Clone)]
pub struct ProjectionHandle {
    entry: Arc<ProjectionEntry>,
}

impl ProjectionHandle {
    pub fn name(&self) -> &ProjectionName {
        &self.entry.name
    }

    pub fn status(&self) -> ProjectionStatus {
        self.entry.status()
    }
}

// The entry holds boxed folds and worker handles, so derive is out.
impl std::fmt::Debug for ProjectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandle")
            .field("name", &self.entry.name)
            .field("status", &self.entry.status())
            .finish_non_exhaustive()
    }
}

/// Runs registered folds over the event log, continuously or step by step.
///
/// ## Lifecycle
///
/// Projections are registered with [`create`](Self::create) and start in
/// `Created`. [`start`](Self::start) spawns a dedicated worker thread that
/// polls the source and folds new events; [`stop`](Self::stop) joins it and
/// leaves the projection `Stopped`, resumable later. A panicking fold or a
/// failing worker moves the projection to `Faulted`, where it stays until
/// [`reset`](Self::reset) returns it to `Created` with empty state.
///
/// ## Checkpointing
///
/// Progress is persisted to the [`CheckpointStore`] every
/// `checkpoint_every` events and once more when a worker shuts down. A
/// projection registered as `Created` with no local progress adopts its
/// stored checkpoint on first start or step, so restarts resume instead of
/// replaying.
///
/// ## Truncation
///
/// Each step first compares the log's truncation stamp against the last one
/// observed. Under [`TruncationPolicy::ResetAndReplay`], a truncate-before
/// marker that moved on any matched stream discards state and checkpoint and
/// replays the still-visible events; under the default
/// [`TruncationPolicy::Ignore`] the marker move is noted and state is kept.
pub struct ProjectionEngine<L, C> {
    log: L,
    checkpoints: C,
    config: EngineConfig,
    registry: RwLock<HashMap<ProjectionName, Arc<ProjectionEntry>>>,
}

impl<L, C> ProjectionEngine<L, C>
where
    L: EventLog + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    pub fn new(log: L, checkpoints: C) -> Self {
        Self::with_config(log, checkpoints, EngineConfig::default())
    }

    pub fn with_config(log: L, checkpoints: C, config: EngineConfig) -> Self {
        Self {
            log,
            checkpoints,
            config,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a new projection. Fails with [`EngineError::DuplicateName`]
    /// if the name is taken; the existing projection is left untouched.
    pub fn create<F: Fold>(
        &self,
        name: ProjectionName,
        fold: F,
        selector: SourceSelector,
        options: ProjectionOptions,
    ) -> Result<ProjectionHandle, EngineError> {
        let entry = {
            let mut registry = self.registry.write().unwrap();
            if registry.contains_key(&name) {
                return Err(EngineError::DuplicateName(name));
            }
            let entry = Arc::new(ProjectionEntry::new(
                name.clone(),
                selector,
                options.truncation_policy,
                Box::new(FoldRunner::new(fold)),
            ));
            registry.insert(name, Arc::clone(&entry));
            entry
        };
        info!(projection = %entry.name, policy = ?entry.policy, "projection created");
        if options.start_running {
            self.start(&entry.name)?;
        }
        Ok(ProjectionHandle { entry })
    }

    /// Spawn the worker for a projection. Starting an already-running
    /// projection is a no-op; starting a faulted one fails.
    pub fn start(&self, name: &ProjectionName) -> Result<(), EngineError> {
        let entry = self.entry(name)?;
        if let ProjectionStatus::Faulted { reason } = entry.status() {
            return Err(EngineError::Faulted {
                name: entry.name.clone(),
                reason,
            });
        }
        let mut worker_slot = entry.worker.lock().unwrap();
        if worker_slot.is_some() {
            return Ok(());
        }
        self.prepare(&entry)?;
        entry.set_status(ProjectionStatus::Running);
        let handle = worker::spawn(
            self.log.clone(),
            self.checkpoints.clone(),
            self.config.clone(),
            Arc::clone(&entry),
        );
        *worker_slot = Some(handle);
        drop(worker_slot);
        info!(projection = %entry.name, "projection started");
        Ok(())
    }

    /// Stop the worker and wait for it to finish its current step. The
    /// projection keeps its state and can be started again. Stopping a
    /// projection with no worker is a no-op.
    pub fn stop(&self, name: &ProjectionName) -> Result<(), EngineError> {
        let entry = self.entry(name)?;
        let handle = entry.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!(projection = %entry.name, "projection stopped");
        }
        Ok(())
    }

    /// Discard state, progress, and checkpoint, returning the projection to
    /// `Created`. A running worker is stopped first.
    pub fn reset(&self, name: &ProjectionName) -> Result<(), EngineError> {
        let entry = self.entry(name)?;
        let handle = entry.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        {
            let mut core = entry.lock_core();
            core.fold.reset();
            core.last_processed = None;
            core.events_processed = 0;
            core.events_since_checkpoint = 0;
            core.resets += 1;
            core.truncation = TruncationWatch::default();
        }
        self.checkpoints.delete(&entry.name)?;
        entry.set_status(ProjectionStatus::Created);
        info!(projection = %entry.name, "projection reset");
        Ok(())
    }

    /// Unregister a projection, stopping its worker and deleting its
    /// checkpoint.
    pub fn delete(&self, name: &ProjectionName) -> Result<(), EngineError> {
        let entry = {
            let mut registry = self.registry.write().unwrap();
            registry
                .remove(name)
                .ok_or_else(|| EngineError::NotFound(name.clone()))?
        };
        let handle = entry.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        self.checkpoints.delete(&entry.name)?;
        info!(projection = %entry.name, "projection deleted");
        Ok(())
    }

    /// Fold at most one batch of pending events and return how many were
    /// processed. Rejected while a worker owns the projection. The status is
    /// left as-is on success, so manually stepped projections stay `Created`
    /// (or `Stopped`); a panicking fold still moves them to `Faulted`.
    pub fn run_step(&self, name: &ProjectionName) -> Result<usize, EngineError> {
        let entry = self.entry(name)?;
        if entry.worker.lock().unwrap().is_some() {
            return Err(EngineError::Running(entry.name.clone()));
        }
        if let ProjectionStatus::Faulted { reason } = entry.status() {
            return Err(EngineError::Faulted {
                name: entry.name.clone(),
                reason,
            });
        }
        self.prepare(&entry)?;
        match step_projection(&self.log, &self.checkpoints, &self.config, &entry, None) {
            Ok(report) => Ok(report.processed),
            Err(err) => {
                if let EngineError::Faulted { reason, .. } = &err {
                    entry.set_status(ProjectionStatus::Faulted {
                        reason: reason.clone(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Snapshot of the projection's current state as JSON.
    pub fn get_state(&self, name: &ProjectionName) -> Result<JsonValue, EngineError> {
        let entry = self.entry(name)?;
        let core = entry.lock_core();
        core.fold.snapshot().map_err(|err| {
            EngineError::State(format!("failed to snapshot state of {}: {err}", entry.name))
        })
    }

    pub fn status(&self, name: &ProjectionName) -> Result<ProjectionStatus, EngineError> {
        Ok(self.entry(name)?.status())
    }

    pub fn stats(&self, name: &ProjectionName) -> Result<ProjectionStats, EngineError> {
        let entry = self.entry(name)?;
        let core = entry.lock_core();
        Ok(ProjectionStats {
            name: entry.name.clone(),
            status: entry.status(),
            last_processed: core.last_processed,
            events_processed: core.events_processed,
            checkpoints_written: core.checkpoints_written,
            resets: core.resets,
        })
    }

    /// Names of all registered projections, sorted.
    pub fn projection_names(&self) -> Vec<ProjectionName> {
        let registry = self.registry.read().unwrap();
        let mut names: Vec<_> = registry.keys().cloned().collect();
        names.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    /// Stop every worker. Registrations and state are kept.
    pub fn shutdown(&self) {
        let entries: Vec<_> = {
            let registry = self.registry.read().unwrap();
            registry.values().cloned().collect()
        };
        for entry in entries {
            let handle = entry.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                handle.shutdown();
            }
        }
        info!("projection engine shut down");
    }

    fn entry(&self, name: &ProjectionName) -> Result<Arc<ProjectionEntry>, EngineError> {
        let registry = self.registry.read().unwrap();
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(name.clone()))
    }

    /// Adopt the stored checkpoint when the projection is fresh: `Created`
    /// with no local progress. Restarts after `stop` keep their in-memory
    /// state, which is never older than the checkpoint.
    ///
    /// Under [`TruncationPolicy::ResetAndReplay`] a checkpoint taken before a
    /// truncate-before marker moved is stale: the events it folded are no
    /// longer all visible. Such a checkpoint is deleted instead of adopted,
    /// so the projection replays the still-visible events from scratch.
    fn prepare(&self, entry: &ProjectionEntry) -> Result<(), EngineError> {
        let mut core = entry.lock_core();
        if core.last_processed.is_none()
            && core.events_processed == 0
            && entry.status() == ProjectionStatus::Created
            && let Some(checkpoint) = self.checkpoints.load(&entry.name)?
        {
            if entry.policy == TruncationPolicy::ResetAndReplay
                && self.truncated_since(entry, &checkpoint)?
            {
                info!(
                    projection = %entry.name,
                    "source truncated since last checkpoint, replaying instead of resuming"
                );
                self.checkpoints.delete(&entry.name)?;
                return Ok(());
            }
            core.fold.restore(checkpoint.state).map_err(|err| {
                EngineError::State(format!(
                    "failed to restore checkpoint for {}: {err}",
                    entry.name
                ))
            })?;
            core.last_processed = checkpoint.last_processed;
            debug!(
                projection = %entry.name,
                last_processed = ?core.last_processed,
                "resumed from checkpoint"
            );
        }
        Ok(())
    }

    /// True when any matched stream's visible floor sits above the marker the
    /// checkpoint recorded for it.
    fn truncated_since(
        &self,
        entry: &ProjectionEntry,
        checkpoint: &Checkpoint,
    ) -> Result<bool, EngineError> {
        for stream_id in self.log.stream_names()? {
            if !entry.selector.matches(&stream_id) {
                continue;
            }
            let floor = self.log.stream_metadata(&stream_id)?.visible_floor();
            let recorded = checkpoint
                .truncation_markers
                .get(&stream_id)
                .copied()
                .unwrap_or(0);
            if floor > recorded {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub(crate) struct StepReport {
    pub(crate) processed: usize,
    pub(crate) interrupted: bool,
}

/// One stepping iteration: react to truncation, then fold at most one batch.
///
/// `shutdown` lets a worker abandon the batch mid-way; a consumed shutdown
/// message is reported through `interrupted` so the caller knows to exit.
pub(crate) fn step_projection<L, C>(
    log: &L,
    checkpoints: &C,
    config: &EngineConfig,
    entry: &ProjectionEntry,
    shutdown: Option<&Receiver<()>>,
) -> Result<StepReport, EngineError>
where
    L: EventLog,
    C: CheckpointStore,
{
    maybe_reset_for_truncation(log, checkpoints, entry)?;

    let from = entry.lock_core().last_processed.map_or(0, |p| p + 1);
    let page = log.read_merged(&entry.selector, from, config.batch_size)?;

    let mut report = StepReport {
        processed: 0,
        interrupted: false,
    };
    for event in &page {
        if let Some(rx) = shutdown
            && rx.try_recv().is_ok()
        {
            report.interrupted = true;
            break;
        }
        apply_one(checkpoints, config, entry, event)?;
        report.processed += 1;
    }
    Ok(report)
}

fn apply_one<C: CheckpointStore>(
    checkpoints: &C,
    config: &EngineConfig,
    entry: &ProjectionEntry,
    event: &RecordedEvent,
) -> Result<(), EngineError> {
    let mut core = entry.lock_core();
    // The guard lives outside catch_unwind, so a panicking fold does not
    // poison the mutex; it leaves possibly half-applied state behind, which
    // is why the projection faults and demands a reset.
    let outcome = catch_unwind(AssertUnwindSafe(|| core.fold.apply(event)));
    if let Err(panic) = outcome {
        let reason = panic_reason(panic.as_ref());
        error!(
            projection = %entry.name,
            global_position = event.global_position,
            reason = %reason,
            "fold panicked"
        );
        return Err(EngineError::Faulted {
            name: entry.name.clone(),
            reason,
        });
    }
    core.last_processed = Some(event.global_position);
    core.events_processed += 1;
    core.events_since_checkpoint += 1;
    if core.events_since_checkpoint >= config.checkpoint_every {
        write_checkpoint(checkpoints, &entry.name, &mut core)?;
    }
    Ok(())
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fold panicked".to_owned()
    }
}

pub(crate) fn write_checkpoint<C: CheckpointStore>(
    checkpoints: &C,
    name: &ProjectionName,
    core: &mut ProjectionCore,
) -> Result<(), EngineError> {
    let state = core
        .fold
        .snapshot()
        .map_err(|err| EngineError::State(format!("failed to snapshot state of {name}: {err}")))?;
    checkpoints.save(&Checkpoint {
        projection: name.clone(),
        last_processed: core.last_processed,
        state,
        truncation_markers: core.truncation.markers.clone(),
        saved_at: Utc::now(),
    })?;
    core.checkpoints_written += 1;
    core.events_since_checkpoint = 0;
    debug!(projection = %name, last_processed = ?core.last_processed, "checkpoint written");
    Ok(())
}

/// Flush any progress made since the last checkpoint. Used by workers on the
/// way out.
pub(crate) fn flush_checkpoint<C: CheckpointStore>(
    checkpoints: &C,
    entry: &ProjectionEntry,
) -> Result<(), EngineError> {
    let mut core = entry.lock_core();
    if core.events_since_checkpoint > 0 {
        write_checkpoint(checkpoints, &entry.name, &mut core)?;
    }
    Ok(())
}

/// React to marker movement. The first observation only records a baseline,
/// so projections registered against an already-truncated log do not reset
/// on their first step.
fn maybe_reset_for_truncation<L, C>(
    log: &L,
    checkpoints: &C,
    entry: &ProjectionEntry,
) -> Result<(), EngineError>
where
    L: EventLog,
    C: CheckpointStore,
{
    let stamp = log.truncation_stamp();
    {
        let core = entry.lock_core();
        if core.truncation.observed_stamp == Some(stamp) {
            return Ok(());
        }
    }
    if entry.policy == TruncationPolicy::Ignore {
        entry.lock_core().truncation.observed_stamp = Some(stamp);
        return Ok(());
    }

    // The stamp moved (or was never seen): collect the visible floor of
    // every matched stream before taking the core lock again.
    let mut floors = HashMap::new();
    for stream_id in log.stream_names()? {
        if !entry.selector.matches(&stream_id) {
            continue;
        }
        let floor = log.stream_metadata(&stream_id)?.visible_floor();
        if floor > 0 {
            floors.insert(stream_id, floor);
        }
    }

    let mut core = entry.lock_core();
    let seeded = core.truncation.observed_stamp.is_some();
    let moved = seeded
        && floors.iter().any(|(stream_id, floor)| {
            *floor > core.truncation.markers.get(stream_id).copied().unwrap_or(0)
        });
    core.truncation.observed_stamp = Some(stamp);
    core.truncation.markers = floors;

    if moved && core.last_processed.is_some() {
        info!(projection = %entry.name, "source truncated, resetting projection for replay");
        core.fold.reset();
        core.last_processed = None;
        core.events_processed = 0;
        core.events_since_checkpoint = 0;
        core.resets += 1;
        drop(core);
        checkpoints.delete(&entry.name)?;
    }
    Ok(())
}
