//! Store configuration.

use std::path::PathBuf;

use rill_engine::EngineConfig;

/// Settings for [`Rill::open`](crate::Rill::open).
///
/// The default configuration keeps everything in memory; pointing
/// `data_dir` at a directory makes the journal and the checkpoints durable
/// under it.
#[derive(Debug, Clone, Default)]
pub struct RillConfig {
    /// Directory for the event journal and checkpoint files. `None` selects
    /// the in-memory backend.
    pub data_dir: Option<PathBuf>,
    /// Tuning for projection workers.
    pub engine: EngineConfig,
}

impl RillConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}
