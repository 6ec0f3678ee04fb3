//! Offline projection rebuilds.
//!
//! Rebuilding folds every visible event into a fresh state and replaces the
//! stored checkpoint, without registering the projection in an engine. Useful
//! after changing a fold's logic or to repair a checkpoint by hand. The
//! projection must not be running while it is rebuilt.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use rill_core::ProjectionName;
use rill_store::{EventLog, SourceSelector, StoreError};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::fold::{ErasedFold, Fold, FoldRunner};

const REBUILD_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("rebuild cancelled")]
    Cancelled,

    #[error("rebuild failed: {0}")]
    State(String),
}

/// Progress information for a running rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildProgress {
    /// Visible events counted when the rebuild began. Events appended while
    /// it runs are folded too but not counted here.
    pub total_events: u64,
    pub processed_events: u64,
    pub phase: RebuildPhase,
    pub is_complete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    /// Counting the visible events.
    Loading,
    /// Deleting the old checkpoint.
    Clearing,
    /// Folding events.
    Replaying,
    /// Finished, checkpoint written.
    Complete,
    /// Failed or cancelled.
    Failed,
}

/// Handle for monitoring and controlling a rebuild.
#[derive(Clone)]
pub struct RebuildHandle {
    progress: Arc<RwLock<RebuildProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl RebuildHandle {
    pub async fn progress(&self) -> RebuildProgress {
        self.progress.read().await.clone()
    }

    /// Request cancellation. A cancelled rebuild never writes a new
    /// checkpoint; if the old one was already cleared, the next engine start
    /// replays from scratch.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    /// Wait for the rebuild to finish and return its final progress.
    pub async fn wait_for_completion(&self) -> Result<RebuildProgress, RebuildError> {
        loop {
            let progress = self.progress.read().await.clone();
            if progress.is_complete {
                if let Some(error) = progress.error {
                    return Err(RebuildError::State(error));
                }
                if progress.phase == RebuildPhase::Failed {
                    return Err(RebuildError::Cancelled);
                }
                return Ok(progress);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Rebuild one projection's checkpoint from the log.
///
/// Spawns the rebuild as a background task and returns immediately; use the
/// handle to watch progress or cancel. Must be called from within a Tokio
/// runtime.
pub async fn rebuild_projection<L, C, F>(
    log: L,
    checkpoints: C,
    name: ProjectionName,
    fold: F,
    selector: SourceSelector,
) -> Result<RebuildHandle, RebuildError>
where
    L: EventLog + 'static,
    C: CheckpointStore + 'static,
    F: Fold,
{
    let progress = Arc::new(RwLock::new(RebuildProgress {
        total_events: 0,
        processed_events: 0,
        phase: RebuildPhase::Loading,
        is_complete: false,
        error: None,
    }));
    let cancellation = Arc::new(AtomicBool::new(false));

    let handle = RebuildHandle {
        progress: progress.clone(),
        cancellation: cancellation.clone(),
    };

    let runner = Box::new(FoldRunner::new(fold));
    tokio::spawn(async move {
        let result = run_rebuild(
            log,
            checkpoints,
            name,
            runner,
            selector,
            progress.clone(),
            cancellation,
        )
        .await;

        let mut prog = progress.write().await;
        match result {
            Ok(()) => {
                prog.phase = RebuildPhase::Complete;
                prog.is_complete = true;
            }
            Err(RebuildError::Cancelled) => {
                prog.phase = RebuildPhase::Failed;
                prog.is_complete = true;
            }
            Err(err) => {
                prog.phase = RebuildPhase::Failed;
                prog.error = Some(err.to_string());
                prog.is_complete = true;
            }
        }
    });

    Ok(handle)
}

async fn run_rebuild<L, C>(
    log: L,
    checkpoints: C,
    name: ProjectionName,
    mut fold: Box<dyn ErasedFold>,
    selector: SourceSelector,
    progress: Arc<RwLock<RebuildProgress>>,
    cancellation: Arc<AtomicBool>,
) -> Result<(), RebuildError>
where
    L: EventLog,
    C: CheckpointStore,
{
    // Phase 1: count what is visible right now
    {
        let mut prog = progress.write().await;
        prog.phase = RebuildPhase::Loading;
    }
    let mut total = 0u64;
    let mut from = 0u64;
    loop {
        if cancellation.load(Ordering::Relaxed) {
            return Err(RebuildError::Cancelled);
        }
        let page = log.read_merged(&selector, from, REBUILD_PAGE_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        total += page.len() as u64;
        from = last.global_position + 1;
        tokio::task::yield_now().await;
    }
    {
        let mut prog = progress.write().await;
        prog.total_events = total;
    }

    // Phase 2: drop the old checkpoint
    {
        let mut prog = progress.write().await;
        prog.phase = RebuildPhase::Clearing;
    }
    checkpoints.delete(&name)?;

    if cancellation.load(Ordering::Relaxed) {
        return Err(RebuildError::Cancelled);
    }

    // Phase 3: fold everything; merged pages arrive already ordered by
    // global position
    {
        let mut prog = progress.write().await;
        prog.phase = RebuildPhase::Replaying;
    }
    let mut last_processed = None;
    let mut processed = 0u64;
    let mut from = 0u64;
    loop {
        let page = log.read_merged(&selector, from, REBUILD_PAGE_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        from = last.global_position + 1;
        for event in &page {
            if cancellation.load(Ordering::Relaxed) {
                return Err(RebuildError::Cancelled);
            }
            fold.apply(event);
            last_processed = Some(event.global_position);
            processed += 1;
            let mut prog = progress.write().await;
            prog.processed_events = processed;
        }
    }

    let state = fold
        .snapshot()
        .map_err(|err| RebuildError::State(format!("failed to snapshot state of {name}: {err}")))?;
    // Record where each source's truncate-before marker sits, so a restart
    // can tell whether the checkpoint predates a later truncation.
    let mut truncation_markers = HashMap::new();
    for stream_id in log.stream_names()? {
        if !selector.matches(&stream_id) {
            continue;
        }
        let floor = log.stream_metadata(&stream_id)?.visible_floor();
        if floor > 0 {
            truncation_markers.insert(stream_id, floor);
        }
    }
    checkpoints.save(&Checkpoint {
        projection: name.clone(),
        last_processed,
        state,
        truncation_markers,
        saved_at: Utc::now(),
    })?;
    info!(projection = %name, events = processed, "projection rebuilt");
    Ok(())
}
