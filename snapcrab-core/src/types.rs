use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since epoch.
pub type EventTime = i64;

/// Unique, monotonically increasing identifier of a checkpoint within a job.
pub type CheckpointId = u64;

/// Unique identifier for a JobVertex (after chaining).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u32);

impl VertexId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Unique identifier for a parallel task instance.
///
/// Format: `vertex_{vertex_id}_{subtask_index}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub vertex_id: VertexId,
    pub subtask_index: usize,
}

impl TaskId {
    pub fn new(vertex_id: VertexId, subtask_index: usize) -> Self {
        Self {
            vertex_id,
            subtask_index,
        }
    }

    /// Parses the `vertex_{v}_{i}` display form back into a task id.
    pub fn parse(raw: &str) -> Option<Self> {
        let suffix = raw.strip_prefix("vertex_")?;
        let (vertex_id, subtask_index) = suffix.rsplit_once('_')?;
        let vertex_id: u32 = vertex_id.parse().ok()?;
        let subtask_index: usize = subtask_index.parse().ok()?;
        Some(Self::new(VertexId::new(vertex_id), subtask_index))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex_{}_{}", self.vertex_id.0, self.subtask_index)
    }
}

/// Opaque pointer to a task's snapshot, produced by the task's state backend.
///
/// The coordinator never interprets these bytes; it only records them in the
/// completed checkpoint metadata and hands them back on recovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle(pub Vec<u8>);

impl SnapshotHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SnapshotHandle {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

pub fn current_unix_millis() -> EventTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as EventTime)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
