//! Strongly-typed names used across the store.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::NameError;

/// Name of an event stream (append-only, independently versioned).
///
/// Stream names are free-form UTF-8 up to 255 bytes. Control characters are
/// rejected, and the `$` prefix is reserved for system streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

/// Name of a registered projection.
///
/// Restricted to `[A-Za-z0-9_.-]` and at most 128 bytes so the name can be
/// embedded verbatim in checkpoint file names and worker thread names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectionName(String);

macro_rules! impl_name_newtype {
    ($t:ty, $validate:path) => {
        impl $t {
            /// Create a validated name.
            pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
                let name = name.into();
                $validate(&name)?;
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_name_newtype!(StreamId, validate_stream_id);
impl_name_newtype!(ProjectionName, validate_projection_name);

const STREAM_ID_MAX_BYTES: usize = 255;
const PROJECTION_NAME_MAX_BYTES: usize = 128;

fn validate_stream_id(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > STREAM_ID_MAX_BYTES {
        return Err(NameError::TooLong {
            len: name.len(),
            max: STREAM_ID_MAX_BYTES,
        });
    }
    if name.starts_with('$') {
        return Err(NameError::Reserved);
    }
    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(NameError::IllegalChar(c));
    }
    Ok(())
}

fn validate_projection_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > PROJECTION_NAME_MAX_BYTES {
        return Err(NameError::TooLong {
            len: name.len(),
            max: PROJECTION_NAME_MAX_BYTES,
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(NameError::IllegalChar(c));
    }
    Ok(())
}
