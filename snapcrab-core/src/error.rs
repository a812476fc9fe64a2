//! Error taxonomy of the checkpoint coordinator.
//!
//! Per-checkpoint failures are expressed as an [`AbortReason`] attached to the
//! discarded checkpoint; they never escalate into a [`CheckpointError`] that
//! fails the job. `CheckpointError` covers everything a caller of the
//! coordinator can observe directly.

use crate::types::{CheckpointId, TaskId};
use serde::{Deserialize, Serialize};

/// Why a trigger request was refused. Callers should retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerRejection {
    /// The coordinator is shutting down or already shut down.
    NotRunning,
    /// `max_concurrent` checkpoints are already in flight.
    TooManyConcurrentCheckpoints,
    /// The minimum pause since the previous trigger has not elapsed.
    MinPauseNotElapsed,
    /// The job has no task to acknowledge a checkpoint.
    NoTasks,
}

impl std::fmt::Display for TriggerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "coordinator is not running"),
            Self::TooManyConcurrentCheckpoints => {
                write!(f, "maximum number of concurrent checkpoints reached")
            }
            Self::MinPauseNotElapsed => write!(f, "minimum pause between checkpoints not elapsed"),
            Self::NoTasks => write!(f, "no tasks to acknowledge"),
        }
    }
}

/// Terminal reason attached to a discarded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Timeout,
    PersistFailure(String),
    TaskDeclined { task_id: TaskId, reason: String },
    HookFailed { identifier: String, message: String },
    /// A strictly newer checkpoint completed first.
    Subsumed,
    JobCancelled,
    CoordinatorShutdown,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "checkpoint expired before completing"),
            Self::PersistFailure(msg) => write!(f, "persisting checkpoint failed: {msg}"),
            Self::TaskDeclined { task_id, reason } => {
                write!(f, "task {task_id} declined checkpoint: {reason}")
            }
            Self::HookFailed {
                identifier,
                message,
            } => write!(f, "master hook '{identifier}' failed: {message}"),
            Self::Subsumed => write!(f, "checkpoint subsumed by a newer completed checkpoint"),
            Self::JobCancelled => write!(f, "job cancelled"),
            Self::CoordinatorShutdown => write!(f, "checkpoint coordinator shut down"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint trigger rejected: {0}")]
    TriggerRejected(TriggerRejection),

    #[error("master hook with identifier '{0}' is already registered")]
    DuplicateIdentifier(String),

    #[error("failed to instantiate master hook from factory '{factory}': {message}")]
    HookInstantiation { factory: String, message: String },

    #[error("checkpoint {checkpoint_id} carries state for unknown master hook '{identifier}'")]
    OrphanedHookState {
        checkpoint_id: CheckpointId,
        identifier: String,
    },

    #[error("task {task_id} is not an expected acknowledger of checkpoint {checkpoint_id}")]
    UnknownAcknowledger {
        checkpoint_id: CheckpointId,
        task_id: TaskId,
    },

    #[error("master hook '{identifier}' is not part of checkpoint {checkpoint_id}")]
    UnknownHook {
        checkpoint_id: CheckpointId,
        identifier: String,
    },

    #[error("failed to persist checkpoint {checkpoint_id}: {source}")]
    PersistFailure {
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },

    /// The recovery store could not be reached at coordinator start.
    #[error("checkpoint recovery store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("master hook '{identifier}' failed to restore checkpoint {checkpoint_id}: {source}")]
    HookRestore {
        identifier: String,
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid checkpoint configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint coordinator has shut down")]
    ShutDown,
}

impl CheckpointError {
    /// Rate or concurrency limits; the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TriggerRejected(
                TriggerRejection::TooManyConcurrentCheckpoints | TriggerRejection::MinPauseNotElapsed
            )
        )
    }
}
