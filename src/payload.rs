//! Opaque, codec-produced payloads

use serde::{Deserialize, Serialize};

/// An opaque codec-produced string paired with the type it was produced for
///
/// Payloads round-trip through history untouched by the engine — only the
/// codec (§ [`crate::codec`]) ever inspects their contents. A `None` payload
/// represents a null value and must round-trip as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    data: Option<String>,
}

impl Payload {
    /// Wrap an already-serialized string
    pub fn from_raw(data: Option<String>) -> Self {
        Self { data }
    }

    /// The null payload
    pub fn null() -> Self {
        Self { data: None }
    }

    /// Whether this payload is null
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    /// Borrow the raw serialized string, if any
    pub fn as_raw(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Consume into the raw serialized string, if any
    pub fn into_raw(self) -> Option<String> {
        self.data
    }
}

impl From<Option<String>> for Payload {
    fn from(data: Option<String>) -> Self {
        Self { data }
    }
}

impl Default for Payload {
    /// The null payload
    fn default() -> Self {
        Self::null()
    }
}
