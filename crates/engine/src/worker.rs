//! Dedicated worker threads driving continuous projections.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;

use tracing::{debug, error, info, warn};

use rill_store::EventLog;

use crate::checkpoint::CheckpointStore;
use crate::engine::{
    EngineConfig, EngineError, ProjectionEntry, ProjectionStatus, flush_checkpoint,
    step_projection,
};

/// Owns a worker thread; dropping it without [`shutdown`](Self::shutdown)
/// detaches the thread, which exits on its own once the channel closes.
pub(crate) struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal the worker and wait for it to finish its current step.
    pub(crate) fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            warn!("projection worker exited with a panic");
        }
    }
}

pub(crate) fn spawn<L, C>(
    log: L,
    checkpoints: C,
    config: EngineConfig,
    entry: Arc<ProjectionEntry>,
) -> WorkerHandle
where
    L: EventLog + 'static,
    C: CheckpointStore + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let thread_name = format!("projection-{}", entry.name);
    let join = thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_loop(log, checkpoints, config, entry, shutdown_rx))
        .expect("failed to spawn projection worker thread");
    WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    }
}

/// Poll-fold loop. Busy sources are drained batch by batch; idle sources are
/// re-polled with a doubling wait capped at `max_poll_interval`. Any step
/// error faults the projection and ends the worker.
fn worker_loop<L, C>(
    log: L,
    checkpoints: C,
    config: EngineConfig,
    entry: Arc<ProjectionEntry>,
    shutdown: mpsc::Receiver<()>,
) where
    L: EventLog,
    C: CheckpointStore,
{
    info!(projection = %entry.name, "projection worker started");
    let mut idle_wait = config.poll_interval;
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match step_projection(&log, &checkpoints, &config, &entry, Some(&shutdown)) {
            Ok(report) if report.interrupted => break,
            Ok(report) if report.processed == 0 => {
                match shutdown.recv_timeout(idle_wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                idle_wait = (idle_wait * 2).min(config.max_poll_interval);
            }
            Ok(report) => {
                debug!(projection = %entry.name, processed = report.processed, "projection advanced");
                idle_wait = config.poll_interval;
            }
            Err(err) => {
                let reason = match &err {
                    EngineError::Faulted { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                error!(projection = %entry.name, error = %err, "projection worker faulted");
                entry.set_status(ProjectionStatus::Faulted { reason });
                return;
            }
        }
    }

    // flush progress so a restart resumes close to where we stopped
    if let Err(err) = flush_checkpoint(&checkpoints, &entry) {
        warn!(projection = %entry.name, error = %err, "failed to write final checkpoint");
    }
    entry.set_status(ProjectionStatus::Stopped);
    info!(projection = %entry.name, "projection worker stopped");
}
