//! Coordinator -> task messaging.
//!
//! The coordinator never waits on tasks: every call here is fire-and-forget
//! and must not block. Acknowledgments travel back through
//! [`CheckpointCoordinator::acknowledge`](crate::coordinator::CheckpointCoordinator::acknowledge).

use crate::config::CheckpointMode;
use crate::types::{CheckpointId, EventTime, TaskId};
use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};

/// Transport towards the tasks of a job.
pub trait TaskGateway: Send + Sync {
    fn trigger_checkpoint(
        &self,
        task_id: TaskId,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
        mode: CheckpointMode,
    ) -> Result<()>;

    /// Durability reached: the task may commit side effects gated on
    /// `checkpoint_id`.
    fn notify_checkpoint_complete(&self, task_id: TaskId, checkpoint_id: CheckpointId)
    -> Result<()>;

    fn notify_checkpoint_aborted(&self, task_id: TaskId, checkpoint_id: CheckpointId) -> Result<()>;
}

/// Message delivered to a task by [`ChannelTaskGateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMessage {
    TriggerCheckpoint {
        task_id: TaskId,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
        mode: CheckpointMode,
    },
    NotifyCheckpointComplete {
        task_id: TaskId,
        checkpoint_id: CheckpointId,
    },
    NotifyCheckpointAborted {
        task_id: TaskId,
        checkpoint_id: CheckpointId,
    },
}

impl TaskMessage {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TriggerCheckpoint { task_id, .. }
            | Self::NotifyCheckpointComplete { task_id, .. }
            | Self::NotifyCheckpointAborted { task_id, .. } => *task_id,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        match self {
            Self::TriggerCheckpoint { checkpoint_id, .. }
            | Self::NotifyCheckpointComplete { checkpoint_id, .. }
            | Self::NotifyCheckpointAborted { checkpoint_id, .. } => *checkpoint_id,
        }
    }
}

/// In-process gateway over a crossbeam channel.
///
/// A bounded gateway drops messages when full instead of blocking the
/// coordinator; the send error is reported to the caller.
#[derive(Clone)]
pub struct ChannelTaskGateway {
    sender: Sender<TaskMessage>,
}

impl ChannelTaskGateway {
    pub fn unbounded() -> (Self, Receiver<TaskMessage>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<TaskMessage>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }

    fn send(&self, message: TaskMessage) -> Result<()> {
        self.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => anyhow!(
                "task channel full, dropped message for task {}",
                message.task_id()
            ),
            TrySendError::Disconnected(_) => anyhow!("task channel closed: receiver dropped"),
        })
    }
}

impl TaskGateway for ChannelTaskGateway {
    fn trigger_checkpoint(
        &self,
        task_id: TaskId,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
        mode: CheckpointMode,
    ) -> Result<()> {
        self.send(TaskMessage::TriggerCheckpoint {
            task_id,
            checkpoint_id,
            timestamp,
            mode,
        })
    }

    fn notify_checkpoint_complete(
        &self,
        task_id: TaskId,
        checkpoint_id: CheckpointId,
    ) -> Result<()> {
        self.send(TaskMessage::NotifyCheckpointComplete {
            task_id,
            checkpoint_id,
        })
    }

    fn notify_checkpoint_aborted(&self, task_id: TaskId, checkpoint_id: CheckpointId) -> Result<()> {
        self.send(TaskMessage::NotifyCheckpointAborted {
            task_id,
            checkpoint_id,
        })
    }
}
