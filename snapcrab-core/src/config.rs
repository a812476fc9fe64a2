use crate::error::CheckpointError;
use crate::hooks::{HookResolver, MasterHookRegistry, SerializedHookFactory};
use crate::types::TaskId;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to retained checkpoints once the job reaches a globally
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Discard retained checkpoints when the job finishes or is cancelled.
    #[default]
    DeleteOnCancellation,
    /// Keep the retained checkpoints so a new job can be started from them.
    RetainOnCancellation,
}

/// Consistency guarantee requested from the tasks for each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckpointMode {
    /// Tasks align barriers before snapshotting.
    #[default]
    ExactlyOnce,
    /// Tasks may snapshot without alignment.
    AtLeastOnce,
}

/// Cadence, limits and retention of the checkpoint coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Interval between periodic triggers.
    pub interval: Duration,
    /// A checkpoint still in progress after this long is aborted.
    pub timeout: Duration,
    /// Minimum time between two consecutive triggers.
    pub min_pause: Duration,
    /// Maximum number of checkpoints in flight at the same time.
    pub max_concurrent: usize,
    /// Number of completed checkpoints kept before older ones are subsumed.
    pub max_retained: usize,
    /// Consecutive persist failures after which the coordinator reports
    /// degraded health.
    pub tolerable_persist_failures: u32,
    pub retention: RetentionPolicy,
    pub mode: CheckpointMode,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(600),
            min_pause: Duration::ZERO,
            max_concurrent: 1,
            max_retained: 1,
            tolerable_persist_failures: 3,
            retention: RetentionPolicy::default(),
            mode: CheckpointMode::default(),
        }
    }
}

impl CheckpointConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_min_pause(mut self, min_pause: Duration) -> Self {
        self.min_pause = min_pause;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_retained(mut self, max_retained: usize) -> Self {
        self.max_retained = max_retained;
        self
    }

    pub fn with_tolerable_persist_failures(mut self, failures: u32) -> Self {
        self.tolerable_persist_failures = failures;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_mode(mut self, mode: CheckpointMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.interval < Duration::from_millis(1) {
            return Err(CheckpointError::InvalidConfig(
                "checkpoint interval must be at least 1ms".to_string(),
            ));
        }
        if self.timeout < Duration::from_millis(1) {
            return Err(CheckpointError::InvalidConfig(
                "checkpoint timeout must be at least 1ms".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.max_retained == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_retained must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checkpointing settings attached to a job graph.
///
/// These travel with the job graph from the client to the coordinator
/// process, so they are serialized with bincode and carry master hooks only
/// in their serialized factory form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpointingSettings {
    /// Tasks that receive trigger requests (usually the sources).
    pub tasks_to_trigger: Vec<TaskId>,
    /// Tasks whose acknowledgment completes a checkpoint.
    pub tasks_to_acknowledge: Vec<TaskId>,
    /// Tasks notified when a checkpoint completes or is aborted.
    pub tasks_to_commit: Vec<TaskId>,
    pub config: CheckpointConfig,
    pub master_hooks: Vec<SerializedHookFactory>,
}

impl JobCheckpointingSettings {
    /// Settings where every task is triggered, acknowledges and commits.
    pub fn new(tasks: Vec<TaskId>, config: CheckpointConfig) -> Self {
        Self {
            tasks_to_trigger: tasks.clone(),
            tasks_to_acknowledge: tasks.clone(),
            tasks_to_commit: tasks,
            config,
            master_hooks: Vec::new(),
        }
    }

    pub fn with_tasks_to_trigger(mut self, tasks: Vec<TaskId>) -> Self {
        self.tasks_to_trigger = tasks;
        self
    }

    pub fn with_tasks_to_commit(mut self, tasks: Vec<TaskId>) -> Self {
        self.tasks_to_commit = tasks;
        self
    }

    pub fn with_master_hook(mut self, factory: SerializedHookFactory) -> Self {
        self.master_hooks.push(factory);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn validate(&self) -> Result<(), CheckpointError> {
        self.config.validate()?;
        if self.tasks_to_acknowledge.is_empty() {
            return Err(CheckpointError::InvalidConfig(
                "tasks_to_acknowledge must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Instantiates the master hooks under the given resolver.
    ///
    /// Factories that fail to resolve or instantiate are reported and
    /// skipped; the returned registry holds every hook that could be built.
    pub fn build_hook_registry(
        &self,
        resolver: &dyn HookResolver,
    ) -> (MasterHookRegistry, Vec<CheckpointError>) {
        MasterHookRegistry::from_factories(&self.master_hooks, resolver)
    }
}
