//! Task names: case-insensitive identifiers for orchestrators and activities

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A case-insensitive identifier for a registered orchestrator or activity
///
/// Two `TaskName`s are equal iff their `name` fields compare equal under a
/// stable case-insensitive rule (ASCII case-folding). `version` participates
/// in equality and hashing as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskName {
    name: String,
    version: Option<String>,
}

impl TaskName {
    /// Create a task name with no version
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Create a versioned task name
    pub fn versioned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// The task's name, as originally provided (not case-folded)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The task's version, if any
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn normalized_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

impl PartialEq for TaskName {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.version == other.version
    }
}

impl Eq for TaskName {}

impl Hash for TaskName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized_name().hash(state);
        self.version.hash(state);
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for TaskName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
