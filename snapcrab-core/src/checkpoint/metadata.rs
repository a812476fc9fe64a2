use super::*;

/// Immutable record of a completed checkpoint, as written to the recovery
/// store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedCheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub trigger_timestamp: EventTime,
    pub completion_timestamp: EventTime,
    pub task_snapshots: BTreeMap<TaskId, SnapshotHandle>,
    /// Captured master hook state, keyed by hook identifier.
    pub hook_states: BTreeMap<String, Vec<u8>>,
}

impl CompletedCheckpointMetadata {
    pub fn task_snapshot(&self, task_id: &TaskId) -> Option<&SnapshotHandle> {
        self.task_snapshots.get(task_id)
    }

    pub fn hook_state(&self, identifier: &str) -> Option<&[u8]> {
        self.hook_states.get(identifier).map(Vec::as_slice)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
