//! Validation error model for core primitives.

use thiserror::Error;

/// Why a stream or projection name was rejected.
///
/// Keep this focused on deterministic validation failures. Storage and
/// runtime concerns belong to the layers above.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name is empty.
    #[error("name is empty")]
    Empty,

    /// The name exceeds the byte limit for its kind.
    #[error("name is {len} bytes, above the {max}-byte limit")]
    TooLong { len: usize, max: usize },

    /// The name starts with the reserved `$` prefix.
    #[error("name starts with the reserved '$' prefix")]
    Reserved,

    /// The name contains a character outside the allowed set.
    #[error("name contains illegal character {0:?}")]
    IllegalChar(char),
}
