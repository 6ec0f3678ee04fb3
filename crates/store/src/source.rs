//! Source selection: which streams feed a merged read.

use serde::{Deserialize, Serialize};

use rill_core::StreamId;

/// The streams behind a merged read or a projection.
///
/// A **category** is a stream-name prefix: category `Stream` covers both
/// `Stream1-1` and `Stream2-1`. Selectors are re-evaluated on every read, so
/// streams created after a projection started are picked up as soon as they
/// receive events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSelector {
    /// A fixed set of streams.
    Streams(Vec<StreamId>),
    /// Every stream whose name starts with one of these prefixes. An empty
    /// prefix matches every stream.
    Categories(Vec<String>),
}

impl SourceSelector {
    /// Selector over a single stream.
    pub fn stream(stream_id: StreamId) -> Self {
        Self::Streams(vec![stream_id])
    }

    /// Selector over a single category prefix.
    pub fn category(prefix: impl Into<String>) -> Self {
        Self::Categories(vec![prefix.into()])
    }

    /// Selector over every stream in the store.
    pub fn all() -> Self {
        Self::Categories(vec![String::new()])
    }

    pub fn matches(&self, stream_id: &StreamId) -> bool {
        match self {
            SourceSelector::Streams(streams) => streams.iter().any(|s| s == stream_id),
            SourceSelector::Categories(prefixes) => prefixes
                .iter()
                .any(|prefix| stream_id.as_str().starts_with(prefix.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> StreamId {
        StreamId::new(name).expect("valid stream id")
    }

    #[test]
    fn explicit_streams_match_exactly() {
        let selector = SourceSelector::Streams(vec![id("a-1"), id("b-1")]);
        assert!(selector.matches(&id("a-1")));
        assert!(!selector.matches(&id("a-10")));
    }

    #[test]
    fn categories_match_by_prefix() {
        let selector = SourceSelector::category("Stream");
        assert!(selector.matches(&id("Stream1-1")));
        assert!(selector.matches(&id("Stream2-1")));
        assert!(!selector.matches(&id("Other-1")));
    }

    #[test]
    fn all_matches_everything() {
        assert!(SourceSelector::all().matches(&id("anything")));
    }
}
