//! Checkpoint persistence for projections.
//!
//! A checkpoint pairs a projection's folded state with the global position of
//! the last event folded into it, so a restarted engine can resume from where
//! the projection left off instead of replaying from the beginning.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use rill_core::{ProjectionName, StreamId};

/// Durable snapshot of one projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub projection: ProjectionName,
    /// Global position of the last event folded into `state`, or `None` when
    /// the snapshot was taken before any event was processed.
    pub last_processed: Option<u64>,
    pub state: JsonValue,
    /// Truncate-before markers of the source streams at snapshot time, so a
    /// restarted engine can tell whether a stream was truncated while it was
    /// down. Streams without a marker are omitted.
    #[serde(default)]
    pub truncation_markers: HashMap<StreamId, u64>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint store lock poisoned")]
    Poisoned,
}

/// Storage backend for projection checkpoints.
///
/// ## Semantics
///
/// - `save` replaces any previous checkpoint for the same projection
/// - `load` returns `None` for projections never checkpointed (or deleted)
/// - `delete` is idempotent
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn load(&self, projection: &ProjectionName) -> Result<Option<Checkpoint>, CheckpointError>;

    fn delete(&self, projection: &ProjectionName) -> Result<(), CheckpointError>;

    fn list(&self) -> Result<Vec<ProjectionName>, CheckpointError>;
}

impl<C> CheckpointStore for Arc<C>
where
    C: CheckpointStore + ?Sized,
{
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        (**self).save(checkpoint)
    }

    fn load(&self, projection: &ProjectionName) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load(projection)
    }

    fn delete(&self, projection: &ProjectionName) -> Result<(), CheckpointError> {
        (**self).delete(projection)
    }

    fn list(&self) -> Result<Vec<ProjectionName>, CheckpointError> {
        (**self).list()
    }
}

/// Keeps checkpoints in a process-local map. Suited for tests and for
/// deployments that accept replaying projections from scratch on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<ProjectionName, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::Poisoned)?;
        checkpoints.insert(checkpoint.projection.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, projection: &ProjectionName) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::Poisoned)?;
        Ok(checkpoints.get(projection).cloned())
    }

    fn delete(&self, projection: &ProjectionName) -> Result<(), CheckpointError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::Poisoned)?;
        checkpoints.remove(projection);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ProjectionName>, CheckpointError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::Poisoned)?;
        let mut names: Vec<_> = checkpoints.keys().cloned().collect();
        names.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(names)
    }
}

/// Stores each checkpoint as `<dir>/<projection>.json`.
///
/// Writes go through a temp file plus rename so a crash mid-save leaves the
/// previous checkpoint intact rather than a truncated file.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, projection: &ProjectionName) -> PathBuf {
        self.dir.join(format!("{}.json", projection.as_str()))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.projection);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        debug!(
            projection = %checkpoint.projection,
            last_processed = ?checkpoint.last_processed,
            "checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, projection: &ProjectionName) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(projection);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn delete(&self, projection: &ProjectionName) -> Result<(), CheckpointError> {
        let path = self.path_for(projection);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<ProjectionName>, CheckpointError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(name) = ProjectionName::new(stem)
            {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(name: &str, last_processed: Option<u64>, count: u64) -> Checkpoint {
        Checkpoint {
            projection: ProjectionName::new(name).expect("valid projection name"),
            last_processed,
            state: serde_json::json!({"count": count}),
            truncation_markers: HashMap::new(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn in_memory_store_saves_loads_and_deletes() {
        let store = InMemoryCheckpointStore::new();
        let name = ProjectionName::new("order_totals").expect("valid projection name");

        assert!(store.load(&name).expect("load").is_none());

        store
            .save(&checkpoint("order_totals", Some(41), 7))
            .expect("save");
        let loaded = store.load(&name).expect("load").expect("checkpoint");
        assert_eq!(loaded.last_processed, Some(41));
        assert_eq!(loaded.state, serde_json::json!({"count": 7}));

        // save replaces, not appends
        store
            .save(&checkpoint("order_totals", Some(99), 12))
            .expect("save");
        let loaded = store.load(&name).expect("load").expect("checkpoint");
        assert_eq!(loaded.last_processed, Some(99));

        store.delete(&name).expect("delete");
        assert!(store.load(&name).expect("load").is_none());
        // deleting again is fine
        store.delete(&name).expect("delete");
    }

    #[test]
    fn file_store_round_trips_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).expect("open");
        let name = ProjectionName::new("order_totals").expect("valid projection name");

        store
            .save(&checkpoint("order_totals", Some(41), 7))
            .expect("save");

        // a fresh handle over the same directory sees the same data
        let reopened = FileCheckpointStore::open(dir.path()).expect("open");
        let loaded = reopened.load(&name).expect("load").expect("checkpoint");
        assert_eq!(loaded.projection, name);
        assert_eq!(loaded.last_processed, Some(41));
        assert_eq!(loaded.state, serde_json::json!({"count": 7}));
    }

    #[test]
    fn file_store_lists_only_json_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).expect("open");

        store
            .save(&checkpoint("order_totals", Some(1), 1))
            .expect("save");
        store
            .save(&checkpoint("daily_rollup", None, 0))
            .expect("save");
        std::fs::write(dir.path().join("notes.txt"), b"not a checkpoint").expect("write");

        let names: Vec<_> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|n| n.as_str().to_owned())
            .collect();
        assert_eq!(names, vec!["daily_rollup", "order_totals"]);
    }

    #[test]
    fn file_store_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).expect("open");
        let name = ProjectionName::new("order_totals").expect("valid projection name");

        store
            .save(&checkpoint("order_totals", Some(3), 3))
            .expect("save");
        store.delete(&name).expect("delete");
        store.delete(&name).expect("delete");
        assert!(store.load(&name).expect("load").is_none());
    }
}
