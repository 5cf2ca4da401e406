//! Typed identifiers shared across worker components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable query identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw id value, format owned by the coordinator.
    pub String,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique task identifier assigned by the coordinator.
///
/// The id encodes query, stage, and partition in a dot-separated form the
/// coordinator owns. The worker treats it as an opaque key, except for
/// [`TaskId::query_id`], which recovers the query grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(
    /// Raw id value, format owned by the coordinator.
    pub String,
);

impl TaskId {
    /// Query id prefix of this task id (leading dot-separated segment, or
    /// the whole id when undotted).
    pub fn query_id(&self) -> QueryId {
        match self.0.split_once('.') {
            Some((query, _)) => QueryId(query.to_string()),
            None => QueryId(self.0.clone()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        TaskId(raw.to_string())
    }
}
