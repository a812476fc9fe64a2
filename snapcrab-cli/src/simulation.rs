//! A simulated job driven by a real checkpoint coordinator.
//!
//! Tasks are plain threads reading coordinator messages from the channel
//! gateway; each acknowledges a trigger after its configured delay. A demo
//! master hook tracks the offsets of an imaginary partitioned source.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapcrab_core::checkpoint::{CheckpointEvent, TaskCheckpointAck};
use snapcrab_core::config::{
    CheckpointConfig, CheckpointMode, JobCheckpointingSettings, RetentionPolicy,
};
use snapcrab_core::coordinator::{CheckpointCoordinator, JobTermination};
use snapcrab_core::gateway::{ChannelTaskGateway, TaskMessage};
use snapcrab_core::hooks::{
    MasterHook, MasterHookFactory, SerializedHookFactory, TypeRegistryResolver,
};
use snapcrab_core::store::RecoveryStoreKind;
use snapcrab_core::types::{CheckpointId, EventTime, SnapshotHandle, TaskId, VertexId};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const OFFSET_HOOK_TYPE: &str = "offset-tracker";

/// Simulated job, as read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of parallel tasks of the single job vertex.
    pub tasks: usize,
    /// Delay before a task acknowledges, multiplied by its subtask index + 1.
    pub ack_delay_ms: u64,
    /// Stop after this many checkpoints completed or were discarded.
    pub checkpoints: usize,
    /// Subtask index of a task that never acknowledges.
    pub stuck_task: Option<usize>,
    /// Partitions of the source whose offsets the demo hook tracks.
    pub source_partitions: u32,
    pub checkpoint: CheckpointSection,
    pub store: RecoveryStoreKind,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tasks: 3,
            ack_delay_ms: 20,
            checkpoints: 5,
            stuck_task: None,
            source_partitions: 4,
            checkpoint: CheckpointSection::default(),
            store: RecoveryStoreKind::Standalone,
        }
    }
}

/// `[checkpoint]` table; durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub min_pause_ms: u64,
    pub max_concurrent: usize,
    pub max_retained: usize,
    pub tolerable_persist_failures: u32,
    pub retention: RetentionPolicy,
    pub mode: CheckpointMode,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 10_000,
            min_pause_ms: 0,
            max_concurrent: 1,
            max_retained: 1,
            tolerable_persist_failures: 3,
            retention: RetentionPolicy::RetainOnCancellation,
            mode: CheckpointMode::ExactlyOnce,
        }
    }
}

impl CheckpointSection {
    pub fn to_config(&self) -> CheckpointConfig {
        CheckpointConfig::default()
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_min_pause(Duration::from_millis(self.min_pause_ms))
            .with_max_concurrent(self.max_concurrent)
            .with_max_retained(self.max_retained)
            .with_tolerable_persist_failures(self.tolerable_persist_failures)
            .with_retention(self.retention)
            .with_mode(self.mode)
    }
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {} failed", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks == 0 {
            bail!("tasks must be greater than 0");
        }
        if self.checkpoints == 0 {
            bail!("checkpoints must be greater than 0");
        }
        if let Some(stuck) = self.stuck_task.filter(|stuck| *stuck >= self.tasks) {
            bail!(
                "stuck_task {} is out of range for {} tasks",
                stuck,
                self.tasks
            );
        }
        self.checkpoint.to_config().validate()?;
        Ok(())
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        (0..self.tasks)
            .map(|i| TaskId::new(VertexId::new(1), i))
            .collect()
    }

    /// Settings as the job-graph side would hand them over.
    pub fn job_settings(&self) -> Result<JobCheckpointingSettings> {
        let hook = SerializedHookFactory::encode(
            OFFSET_HOOK_TYPE,
            &OffsetHookConfig {
                partitions: self.source_partitions,
            },
        )?;
        Ok(
            JobCheckpointingSettings::new(self.task_ids(), self.checkpoint.to_config())
                .with_master_hook(hook),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetHookConfig {
    pub partitions: u32,
}

/// Tracks how far an external partitioned source has been read. Every
/// checkpoint captures the current offsets; recovery rewinds to them.
pub struct OffsetTrackingHook {
    offsets: Mutex<Vec<u64>>,
}

impl OffsetTrackingHook {
    pub fn new(partitions: u32) -> Self {
        Self {
            offsets: Mutex::new(vec![0; partitions as usize]),
        }
    }
}

#[async_trait]
impl MasterHook for OffsetTrackingHook {
    fn identifier(&self) -> &str {
        OFFSET_HOOK_TYPE
    }

    async fn trigger_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        _timestamp: EventTime,
    ) -> Result<Option<Vec<u8>>> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| anyhow!("offsets lock poisoned"))?;
        // The source keeps reading between checkpoints.
        for (partition, offset) in offsets.iter_mut().enumerate() {
            *offset += 10 + partition as u64;
        }
        debug!("checkpoint {} captured offsets {:?}", checkpoint_id, *offsets);
        Ok(Some(bincode::serialize(&*offsets)?))
    }

    async fn restore_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        state: Option<&[u8]>,
    ) -> Result<()> {
        let Some(state) = state else {
            return Ok(());
        };
        let restored: Vec<u64> =
            bincode::deserialize(state).context("decode source offsets failed")?;
        info!(
            "source rewound to offsets {:?} of checkpoint {}",
            restored, checkpoint_id
        );
        *self
            .offsets
            .lock()
            .map_err(|_| anyhow!("offsets lock poisoned"))? = restored;
        Ok(())
    }
}

struct OffsetHookFactory {
    config: OffsetHookConfig,
}

impl MasterHookFactory for OffsetHookFactory {
    fn create(&self) -> Result<Arc<dyn MasterHook>> {
        Ok(Arc::new(OffsetTrackingHook::new(self.config.partitions)))
    }
}

/// Hook types this binary knows how to instantiate.
pub fn demo_resolver() -> TypeRegistryResolver {
    TypeRegistryResolver::new().with_type(OFFSET_HOOK_TYPE, |payload| {
        let config: OffsetHookConfig = bincode::deserialize(payload)?;
        Ok(Box::new(OffsetHookFactory { config }) as Box<dyn MasterHookFactory>)
    })
}

/// Decodes the offsets the demo hook stored in a checkpoint.
pub fn decode_offsets(state: &[u8]) -> Result<Vec<u64>> {
    Ok(bincode::deserialize(state)?)
}

/// Plays the tasks of the job on a dedicated thread until the gateway is
/// dropped by the coordinator.
fn spawn_task_simulator(
    messages: crossbeam_channel::Receiver<TaskMessage>,
    coordinator: CheckpointCoordinator,
    ack_delay: Duration,
    stuck_task: Option<TaskId>,
) -> std::thread::JoinHandle<()> {
    let runtime = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        while let Ok(message) = messages.recv() {
            match message {
                TaskMessage::TriggerCheckpoint {
                    task_id,
                    checkpoint_id,
                    ..
                } => {
                    if Some(task_id) == stuck_task {
                        debug!("task {} ignores checkpoint {}", task_id, checkpoint_id);
                        continue;
                    }
                    let coordinator = coordinator.clone();
                    let delay = ack_delay * (task_id.subtask_index as u32 + 1);
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let ack = TaskCheckpointAck {
                            checkpoint_id,
                            task_id,
                            handle: SnapshotHandle::new(format!(
                                "state/{task_id}/chk-{checkpoint_id}"
                            )),
                        };
                        if let Err(err) = coordinator.acknowledge(ack).await {
                            warn!("task {} failed to acknowledge: {}", task_id, err);
                        }
                    });
                }
                TaskMessage::NotifyCheckpointComplete {
                    task_id,
                    checkpoint_id,
                } => debug!("task {} commits checkpoint {}", task_id, checkpoint_id),
                TaskMessage::NotifyCheckpointAborted {
                    task_id,
                    checkpoint_id,
                } => debug!("task {} rolls back checkpoint {}", task_id, checkpoint_id),
            }
        }
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulationSummary {
    pub completed: usize,
    pub discarded: usize,
    pub last_completed: Option<CheckpointId>,
}

/// Runs the job until `checkpoints` outcomes were observed, then suspends
/// it so a later run can recover.
pub async fn run(config: SimulationConfig) -> Result<SimulationSummary> {
    // The settings travel as bytes from the job-graph side.
    let settings = JobCheckpointingSettings::from_bytes(&config.job_settings()?.to_bytes()?)?;
    let store = config.store.build()?;
    let (gateway, messages) = ChannelTaskGateway::unbounded();

    let coordinator = CheckpointCoordinator::start_with_settings(
        &settings,
        &demo_resolver(),
        store,
        Arc::new(gateway),
    )
    .await?;
    let report = coordinator.recovery_report();
    match report.restored_checkpoint {
        Some(checkpoint_id) => info!("resumed from checkpoint {}", checkpoint_id),
        None => info!("no checkpoint to resume from"),
    }
    for failure in &report.hook_instantiation_failures {
        warn!("{}", failure);
    }

    let stuck_task = config
        .stuck_task
        .map(|i| TaskId::new(VertexId::new(1), i));
    let mut events = coordinator.subscribe();
    let simulator = spawn_task_simulator(
        messages,
        coordinator.clone(),
        Duration::from_millis(config.ack_delay_ms),
        stuck_task,
    );
    coordinator.start_scheduler().await?;

    let mut summary = SimulationSummary::default();
    while summary.completed + summary.discarded < config.checkpoints {
        match events.recv().await {
            Ok(CheckpointEvent::Triggered { checkpoint_id, .. }) => {
                debug!("checkpoint {} triggered", checkpoint_id)
            }
            Ok(CheckpointEvent::Completed(metadata)) => {
                println!(
                    "checkpoint {} completed: {} task snapshots, {} hook states",
                    metadata.checkpoint_id,
                    metadata.task_snapshots.len(),
                    metadata.hook_states.len()
                );
                summary.completed += 1;
                summary.last_completed = Some(metadata.checkpoint_id);
            }
            Ok(CheckpointEvent::Discarded {
                checkpoint_id,
                reason,
            }) => {
                println!("checkpoint {} discarded: {}", checkpoint_id, reason);
                summary.discarded += 1;
            }
            Ok(CheckpointEvent::HealthDegraded {
                consecutive_persist_failures,
            }) => warn!(
                "checkpoint store degraded after {} failed writes",
                consecutive_persist_failures
            ),
            Err(RecvError::Lagged(skipped)) => warn!("missed {} checkpoint events", skipped),
            Err(RecvError::Closed) => break,
        }
    }

    coordinator.stop_scheduler().await?;
    coordinator.shutdown(JobTermination::Suspended).await?;
    // The simulator exits once the coordinator dropped the gateway.
    tokio::task::spawn_blocking(move || simulator.join())
        .await?
        .map_err(|_| anyhow!("task simulator panicked"))?;
    Ok(summary)
}

pub fn store_for_dir(dir: Option<PathBuf>) -> RecoveryStoreKind {
    match dir {
        Some(path) => RecoveryStoreKind::Filesystem { path },
        None => RecoveryStoreKind::Standalone,
    }
}
