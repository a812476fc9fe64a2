use super::*;

/// Task-level checkpoint acknowledgement payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCheckpointAck {
    pub checkpoint_id: CheckpointId,
    pub task_id: TaskId,
    pub handle: SnapshotHandle,
}

/// Task-level refusal to take part in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCheckpointDecline {
    pub checkpoint_id: CheckpointId,
    pub task_id: TaskId,
    pub reason: String,
}

/// Task -> coordinator checkpoint control event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskCheckpointEvent {
    Ack(TaskCheckpointAck),
    Declined(TaskCheckpointDecline),
}

impl TaskCheckpointEvent {
    pub fn checkpoint_id(&self) -> CheckpointId {
        match self {
            Self::Ack(ack) => ack.checkpoint_id,
            Self::Declined(decline) => decline.checkpoint_id,
        }
    }
}

/// Coordinator -> observer notification about checkpoint lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointEvent {
    Triggered {
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
    },
    /// Emitted only after the metadata has been persisted.
    Completed(CompletedCheckpointMetadata),
    Discarded {
        checkpoint_id: CheckpointId,
        reason: AbortReason,
    },
    /// Persisting checkpoints keeps failing; the hosting environment decides
    /// what to do about it.
    HealthDegraded { consecutive_persist_failures: u32 },
}

impl CheckpointEvent {
    pub fn checkpoint_id(&self) -> Option<CheckpointId> {
        match self {
            Self::Triggered { checkpoint_id, .. } | Self::Discarded { checkpoint_id, .. } => {
                Some(*checkpoint_id)
            }
            Self::Completed(metadata) => Some(metadata.checkpoint_id),
            Self::HealthDegraded { .. } => None,
        }
    }
}
