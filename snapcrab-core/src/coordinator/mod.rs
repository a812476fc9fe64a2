//! The checkpoint coordinator.
//!
//! [`CheckpointCoordinator`] is a cheap, cloneable handle. Every decision
//! (trigger, acknowledgment folding, completion, abort, shutdown) is made by
//! one decision loop task that exclusively owns the pending checkpoints and
//! the retained history; the handle only sends commands to it. Hook calls,
//! store writes and deadline timers run on their own tasks and report back
//! into the loop as commands.

use crate::checkpoint::{
    AckOutcome, CheckpointEvent, CompletedCheckpointMetadata, HookResult, PendingCheckpoint,
    TaskCheckpointAck, TaskCheckpointDecline, TaskCheckpointEvent,
};
use crate::config::{CheckpointConfig, JobCheckpointingSettings, RetentionPolicy};
use crate::error::{AbortReason, CheckpointError, TriggerRejection};
use crate::gateway::TaskGateway;
use crate::hooks::{HookResolver, MasterHook, MasterHookRegistry};
use crate::store::CheckpointRecoveryStore;
use crate::types::{CheckpointId, EventTime, TaskId, current_unix_millis};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

mod recovery;
mod scheduler;
mod state;

pub use recovery::*;
use scheduler::*;
use state::*;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Global lifecycle of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    /// Rejects new triggers; checkpoints already being persisted finish.
    ShuttingDown,
    ShutDown,
}

/// How the job ended, as reported by the hosting environment at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTermination {
    Finished,
    Cancelled,
    Failed,
    /// The job will be resumed by another coordinator.
    Suspended,
}

impl JobTermination {
    /// Finished and cancelled jobs are never resumed.
    pub fn is_globally_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Last known status of one master hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Idle,
    Triggering {
        checkpoint_id: CheckpointId,
    },
    Captured {
        checkpoint_id: CheckpointId,
        has_state: bool,
    },
    Failed {
        checkpoint_id: CheckpointId,
        message: String,
    },
    Restored {
        checkpoint_id: CheckpointId,
    },
    RestoreFailed {
        checkpoint_id: CheckpointId,
        message: String,
    },
}

/// Snapshot of the coordinator, published after every decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub pending_checkpoints: usize,
    pub last_completed_checkpoint: Option<CheckpointId>,
    pub last_completion_time: Option<EventTime>,
    /// Ids in the retained history, oldest first.
    pub retained_checkpoints: Vec<CheckpointId>,
    pub hooks: BTreeMap<String, HookStatus>,
    pub consecutive_persist_failures: u32,
    pub registered_hooks: usize,
    pub next_checkpoint_id: CheckpointId,
}

/// Tasks taking part in checkpointing, by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTasks {
    pub to_trigger: Vec<TaskId>,
    pub to_acknowledge: Vec<TaskId>,
    pub to_commit: Vec<TaskId>,
}

impl CheckpointTasks {
    /// Every task is triggered, acknowledges and commits.
    pub fn all(tasks: Vec<TaskId>) -> Self {
        Self {
            to_trigger: tasks.clone(),
            to_acknowledge: tasks.clone(),
            to_commit: tasks,
        }
    }
}

impl From<&JobCheckpointingSettings> for CheckpointTasks {
    fn from(settings: &JobCheckpointingSettings) -> Self {
        Self {
            to_trigger: settings.tasks_to_trigger.clone(),
            to_acknowledge: settings.tasks_to_acknowledge.clone(),
            to_commit: settings.tasks_to_commit.clone(),
        }
    }
}

/// Handle to a running checkpoint coordinator.
#[derive(Clone)]
pub struct CheckpointCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CheckpointEvent>,
    status: watch::Receiver<CoordinatorStatus>,
    config: Arc<CheckpointConfig>,
    recovery: Arc<RecoveryReport>,
}

impl CheckpointCoordinator {
    /// Recovers from `store`, restores the hooks and starts the decision
    /// loop. The periodic scheduler is not started.
    ///
    /// Fails if the configuration is invalid, the store cannot be read, or a
    /// mandatory hook fails to restore.
    pub async fn start(
        config: CheckpointConfig,
        tasks: CheckpointTasks,
        hooks: MasterHookRegistry,
        store: Arc<dyn CheckpointRecoveryStore>,
        gateway: Arc<dyn TaskGateway>,
    ) -> Result<Self, CheckpointError> {
        Self::start_inner(config, tasks, hooks, store, gateway, Vec::new()).await
    }

    /// Like [`start`](Self::start), instantiating the master hooks from the
    /// job's serialized factories. Factories that fail to instantiate are
    /// logged and listed in the recovery report; the coordinator runs with
    /// the remaining hooks.
    pub async fn start_with_settings(
        settings: &JobCheckpointingSettings,
        resolver: &dyn HookResolver,
        store: Arc<dyn CheckpointRecoveryStore>,
        gateway: Arc<dyn TaskGateway>,
    ) -> Result<Self, CheckpointError> {
        settings.validate()?;
        let (hooks, failures) = settings.build_hook_registry(resolver);
        let failures = failures.iter().map(ToString::to_string).collect();
        Self::start_inner(
            settings.config.clone(),
            CheckpointTasks::from(settings),
            hooks,
            store,
            gateway,
            failures,
        )
        .await
    }

    async fn start_inner(
        config: CheckpointConfig,
        tasks: CheckpointTasks,
        hooks: MasterHookRegistry,
        store: Arc<dyn CheckpointRecoveryStore>,
        gateway: Arc<dyn TaskGateway>,
        instantiation_failures: Vec<String>,
    ) -> Result<Self, CheckpointError> {
        config.validate()?;

        let (recovered, mut report) = recover(Arc::clone(&store), &hooks).await?;
        report.hook_instantiation_failures = instantiation_failures;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let decision_loop = DecisionLoop::new(
            config.clone(),
            tasks,
            hooks,
            store,
            gateway,
            events.clone(),
            commands.downgrade(),
            recovered,
            &report,
        );
        let (status_tx, status) = watch::channel(decision_loop.snapshot());
        tokio::spawn(decision_loop.run(command_rx, status_tx));

        info!(
            "checkpoint coordinator started, next checkpoint id {}",
            status.borrow().next_checkpoint_id
        );
        Ok(Self {
            commands,
            events,
            status,
            config: Arc::new(config),
            recovery: Arc::new(report),
        })
    }

    /// Triggers a checkpoint now, returning its id.
    ///
    /// The returned id only means the checkpoint was started; its outcome is
    /// published as a [`CheckpointEvent`].
    pub async fn trigger_checkpoint(&self) -> Result<CheckpointId, CheckpointError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Trigger { reply }).is_err() {
            return Err(CheckpointError::TriggerRejected(TriggerRejection::NotRunning));
        }
        rx.await
            .unwrap_or(Err(CheckpointError::TriggerRejected(TriggerRejection::NotRunning)))
    }

    /// Folds a task acknowledgment into its pending checkpoint.
    ///
    /// Acks for unknown, finished or aborted checkpoints are accepted as
    /// no-ops; an ack from a task that is not an expected acknowledger is
    /// reported as [`CheckpointError::UnknownAcknowledger`].
    pub async fn acknowledge(&self, ack: TaskCheckpointAck) -> Result<AckOutcome, CheckpointError> {
        self.request(|reply| Command::Acknowledge { ack, reply })
            .await?
    }

    /// Aborts the checkpoint the task declined.
    pub async fn decline(
        &self,
        decline: TaskCheckpointDecline,
    ) -> Result<AckOutcome, CheckpointError> {
        self.request(|reply| Command::Decline { decline, reply })
            .await?
    }

    pub async fn handle_task_event(
        &self,
        event: TaskCheckpointEvent,
    ) -> Result<AckOutcome, CheckpointError> {
        match event {
            TaskCheckpointEvent::Ack(ack) => self.acknowledge(ack).await,
            TaskCheckpointEvent::Declined(decline) => self.decline(decline).await,
        }
    }

    /// Aborts every in-flight checkpoint that is not already being
    /// persisted, e.g. with [`AbortReason::JobCancelled`]. Returns how many
    /// were aborted.
    pub async fn abort_pending_checkpoints(
        &self,
        reason: AbortReason,
    ) -> Result<usize, CheckpointError> {
        self.request(|reply| Command::AbortAll { reason, reply })
            .await
    }

    /// Starts periodic triggering at the configured interval. Starting an
    /// already running scheduler does nothing.
    pub async fn start_scheduler(&self) -> Result<(), CheckpointError> {
        self.request(|reply| Command::StartScheduler { reply })
            .await?
    }

    pub async fn stop_scheduler(&self) -> Result<(), CheckpointError> {
        self.request(|reply| Command::StopScheduler { reply })
            .await
    }

    /// Stops the coordinator. Waits for checkpoints that are being persisted,
    /// aborts all others, closes the hooks and applies the retention policy.
    /// Calling it again after the coordinator shut down is a no-op.
    pub async fn shutdown(&self, termination: JobTermination) -> Result<(), CheckpointError> {
        match self.request(|reply| Command::Shutdown { termination, reply }).await {
            Ok(result) => result,
            Err(CheckpointError::ShutDown) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointEvent> {
        self.events.subscribe()
    }

    /// Snapshot copy of the coordinator's state.
    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CheckpointError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| CheckpointError::ShutDown)?;
        rx.await.map_err(|_| CheckpointError::ShutDown)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
