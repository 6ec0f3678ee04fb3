//! Optimistic concurrency expectations for stream writes.

/// Caller expectation about a stream's current version.
///
/// Carried by appends (against the last event number) and by stream metadata
/// writes (against the metadata version). The write is rejected without side
/// effects when the expectation does not hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for idempotent writers, migrations, etc.).
    Any,
    /// Require that the stream does not exist yet.
    NoStream,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Check the expectation against the observed version.
    ///
    /// `current` is `None` for a stream (or metadata record) that has never
    /// been written.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::Exact(v) => current == Some(v),
        }
    }
}
