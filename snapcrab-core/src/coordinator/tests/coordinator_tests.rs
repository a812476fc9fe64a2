use super::*;
use crate::config::CheckpointMode;
use crate::gateway::{ChannelTaskGateway, TaskMessage};
use crate::hooks::{SerializedHookFactory, TypeRegistryResolver};
use crate::store::StandaloneRecoveryStore;
use crate::types::{SnapshotHandle, VertexId};
use anyhow::bail;
use async_trait::async_trait;
use crossbeam_channel::Receiver;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn task(i: usize) -> TaskId {
    TaskId::new(VertexId::new(1), i)
}

fn ack(checkpoint_id: CheckpointId, i: usize) -> TaskCheckpointAck {
    TaskCheckpointAck {
        checkpoint_id,
        task_id: task(i),
        handle: SnapshotHandle::new(format!("t{i}@{checkpoint_id}")),
    }
}

type CallLog = Arc<Mutex<Vec<String>>>;

struct ScriptedHook {
    id: String,
    mandatory: bool,
    state: Option<Vec<u8>>,
    fail_trigger: bool,
    fail_restore: bool,
    stall: Option<Duration>,
    log: CallLog,
}

impl ScriptedHook {
    fn new(id: &str, log: &CallLog) -> Self {
        Self {
            id: id.to_string(),
            mandatory: true,
            state: Some(format!("{id}-state").into_bytes()),
            fail_trigger: false,
            fail_restore: false,
            stall: None,
            log: Arc::clone(log),
        }
    }

    fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    fn failing_trigger(mut self) -> Self {
        self.fail_trigger = true;
        self
    }

    fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    fn stalled(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }

    fn into_hook(self) -> Arc<dyn MasterHook> {
        Arc::new(self)
    }
}

#[async_trait]
impl MasterHook for ScriptedHook {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    async fn trigger_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        _timestamp: EventTime,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("trigger:{}:{checkpoint_id}", self.id));
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("done:{}:{checkpoint_id}", self.id));
        }
        if self.fail_trigger {
            bail!("source offsets unavailable");
        }
        Ok(self.state.clone())
    }

    async fn restore_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        state: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let state = state.map_or("-".to_string(), |s| String::from_utf8_lossy(s).to_string());
        self.log
            .lock()
            .unwrap()
            .push(format!("restore:{}:{checkpoint_id}:{state}", self.id));
        if self.fail_restore {
            bail!("lease expired");
        }
        Ok(())
    }

    fn close(&self) {
        self.log.lock().unwrap().push(format!("close:{}", self.id));
    }
}

/// In-memory store whose persist and recovery can be made to fail.
#[derive(Default)]
struct ControlledStore {
    inner: StandaloneRecoveryStore,
    fail_persist: AtomicBool,
    /// Blocks the persist of one checkpoint for a while.
    slow_persist: Option<(CheckpointId, Duration)>,
    unreachable: bool,
    shut_down: AtomicBool,
}

impl CheckpointRecoveryStore for ControlledStore {
    fn persist(&self, metadata: &CompletedCheckpointMetadata) -> anyhow::Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        if let Some((checkpoint_id, delay)) = self.slow_persist
            && checkpoint_id == metadata.checkpoint_id
        {
            std::thread::sleep(delay);
        }
        self.inner.persist(metadata)
    }

    fn recover_latest(&self) -> anyhow::Result<Option<CompletedCheckpointMetadata>> {
        if self.unreachable {
            bail!("connection refused");
        }
        self.inner.recover_latest()
    }

    fn load(&self, checkpoint_id: CheckpointId) -> anyhow::Result<Option<CompletedCheckpointMetadata>> {
        self.inner.load(checkpoint_id)
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        self.inner.discard(checkpoint_id)
    }

    fn list_checkpoints(&self) -> anyhow::Result<Vec<CheckpointId>> {
        self.inner.list_checkpoints()
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    coordinator: CheckpointCoordinator,
    store: Arc<ControlledStore>,
    tasks_rx: Receiver<TaskMessage>,
    events: broadcast::Receiver<CheckpointEvent>,
}

async fn start_with_store(
    config: CheckpointConfig,
    tasks: usize,
    hooks: Vec<Arc<dyn MasterHook>>,
    store: Arc<ControlledStore>,
) -> Harness {
    let mut registry = MasterHookRegistry::new();
    for hook in hooks {
        registry.register(hook).unwrap();
    }
    let (gateway, tasks_rx) = ChannelTaskGateway::unbounded();
    let coordinator = CheckpointCoordinator::start(
        config,
        CheckpointTasks::all((0..tasks).map(task).collect()),
        registry,
        store.clone(),
        Arc::new(gateway),
    )
    .await
    .unwrap();
    let events = coordinator.subscribe();
    Harness {
        coordinator,
        store,
        tasks_rx,
        events,
    }
}

async fn start(config: CheckpointConfig, tasks: usize, hooks: Vec<Arc<dyn MasterHook>>) -> Harness {
    start_with_store(config, tasks, hooks, Arc::new(ControlledStore::default())).await
}

/// Next completion, discard or health event.
async fn next_outcome(events: &mut broadcast::Receiver<CheckpointEvent>) -> CheckpointEvent {
    loop {
        match events.recv().await.unwrap() {
            CheckpointEvent::Triggered { .. } => continue,
            event => return event,
        }
    }
}

async fn next_task_message(rx: &Receiver<TaskMessage>) -> TaskMessage {
    loop {
        if let Ok(message) = rx.try_recv() {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn expect_discarded(event: CheckpointEvent) -> (CheckpointId, AbortReason) {
    match event {
        CheckpointEvent::Discarded {
            checkpoint_id,
            reason,
        } => (checkpoint_id, reason),
        other => panic!("expected a discarded checkpoint, got {other:?}"),
    }
}

fn expect_completed(event: CheckpointEvent) -> CompletedCheckpointMetadata {
    match event {
        CheckpointEvent::Completed(metadata) => metadata,
        other => panic!("expected a completed checkpoint, got {other:?}"),
    }
}

#[tokio::test]
async fn test_checkpoint_completes_after_all_acks() {
    let mut h = start(CheckpointConfig::default(), 2, Vec::new()).await;

    let checkpoint_id = h.coordinator.trigger_checkpoint().await.unwrap();
    assert_eq!(checkpoint_id, 1);
    let triggers: Vec<TaskMessage> = h.tasks_rx.try_iter().collect();
    assert_eq!(triggers.len(), 2);
    assert!(triggers.iter().all(|m| matches!(
        m,
        TaskMessage::TriggerCheckpoint {
            checkpoint_id: 1,
            mode: CheckpointMode::ExactlyOnce,
            ..
        }
    )));

    assert_eq!(
        h.coordinator.acknowledge(ack(1, 1)).await.unwrap(),
        AckOutcome::Accepted
    );
    assert_eq!(h.coordinator.status().pending_checkpoints, 1);
    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();

    let metadata = expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(metadata.checkpoint_id, 1);
    assert_eq!(metadata.task_snapshots.len(), 2);
    assert_eq!(
        metadata.task_snapshot(&task(1)),
        Some(&SnapshotHandle::new("t1@1"))
    );
    assert_eq!(h.store.recover_latest().unwrap(), Some(metadata));

    let status = h.coordinator.status();
    assert_eq!(status.pending_checkpoints, 0);
    assert_eq!(status.last_completed_checkpoint, Some(1));
    assert_eq!(status.retained_checkpoints, vec![1]);
    assert_eq!(status.next_checkpoint_id, 2);

    let commits: Vec<TaskMessage> = h.tasks_rx.try_iter().collect();
    assert_eq!(commits.len(), 2);
    assert!(commits.iter().all(|m| matches!(
        m,
        TaskMessage::NotifyCheckpointComplete {
            checkpoint_id: 1,
            ..
        }
    )));
}

#[tokio::test]
async fn test_trigger_rejections() {
    let h = start(CheckpointConfig::default(), 1, Vec::new()).await;
    h.coordinator.trigger_checkpoint().await.unwrap();
    let err = h.coordinator.trigger_checkpoint().await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejection::TooManyConcurrentCheckpoints)
    ));
    assert!(err.is_retryable());

    let config = CheckpointConfig::default()
        .with_max_concurrent(4)
        .with_min_pause(Duration::from_secs(3600));
    let h = start(config, 1, Vec::new()).await;
    h.coordinator.trigger_checkpoint().await.unwrap();
    let err = h.coordinator.trigger_checkpoint().await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejection::MinPauseNotElapsed)
    ));

    let h = start(CheckpointConfig::default(), 0, Vec::new()).await;
    let err = h.coordinator.trigger_checkpoint().await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::TriggerRejected(TriggerRejection::NoTasks)
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_hooks_capture_in_order_before_tasks_are_triggered() {
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("a", &log).into_hook(),
        ScriptedHook::new("b", &log).into_hook(),
    ];
    let mut h = start(CheckpointConfig::default(), 1, hooks).await;

    let checkpoint_id = h.coordinator.trigger_checkpoint().await.unwrap();
    let message = next_task_message(&h.tasks_rx).await;
    assert!(matches!(message, TaskMessage::TriggerCheckpoint { .. }));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["trigger:a:1".to_string(), "trigger:b:1".to_string()]
    );

    h.coordinator.acknowledge(ack(checkpoint_id, 0)).await.unwrap();
    let metadata = expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(metadata.hook_state("a"), Some(b"a-state".as_slice()));
    assert_eq!(metadata.hook_state("b"), Some(b"b-state".as_slice()));
    assert_eq!(
        h.coordinator.status().hooks.get("a"),
        Some(&HookStatus::Captured {
            checkpoint_id: 1,
            has_state: true
        })
    );
}

#[tokio::test]
async fn test_mandatory_hook_failure_aborts_checkpoint() {
    let log = CallLog::default();
    let hooks = vec![ScriptedHook::new("offsets", &log).failing_trigger().into_hook()];
    let mut h = start(CheckpointConfig::default(), 2, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    let (checkpoint_id, reason) = expect_discarded(next_outcome(&mut h.events).await);
    assert_eq!(checkpoint_id, 1);
    assert!(matches!(
        reason,
        AbortReason::HookFailed { ref identifier, .. } if identifier == "offsets"
    ));

    // Tasks were never asked to snapshot, only told about the abort.
    let messages: Vec<TaskMessage> = h.tasks_rx.try_iter().collect();
    assert!(
        messages
            .iter()
            .all(|m| matches!(m, TaskMessage::NotifyCheckpointAborted { .. })),
        "{messages:?}"
    );
    assert_eq!(h.store.recover_latest().unwrap(), None);

    // The next checkpoint is unaffected by the failure of this one.
    assert_eq!(h.coordinator.trigger_checkpoint().await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_mandatory_hook_stops_remaining_captures() {
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("lease", &log).failing_trigger().into_hook(),
        ScriptedHook::new("offsets", &log).into_hook(),
    ];
    let mut h = start(CheckpointConfig::default(), 1, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    let (_, reason) = expect_discarded(next_outcome(&mut h.events).await);
    assert!(matches!(reason, AbortReason::HookFailed { .. }));
    assert_eq!(*log.lock().unwrap(), vec!["trigger:lease:1".to_string()]);
    assert_eq!(
        h.coordinator.status().hooks.get("offsets"),
        Some(&HookStatus::Triggering { checkpoint_id: 1 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_checkpoint_stops_hook_capture() {
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("slow", &log)
            .stalled(Duration::from_secs(60))
            .into_hook(),
        ScriptedHook::new("next", &log).into_hook(),
    ];
    let config = CheckpointConfig::default().with_timeout(Duration::from_secs(10));
    let mut h = start(config, 1, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    assert_eq!(
        expect_discarded(next_outcome(&mut h.events).await),
        (1, AbortReason::Timeout)
    );
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*log.lock().unwrap(), vec!["trigger:slow:1".to_string()]);

    h.coordinator
        .shutdown(JobTermination::Suspended)
        .await
        .unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "trigger:slow:1".to_string(),
            "close:slow".to_string(),
            "close:next".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_hooks_after_capture_stopped() {
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("slow", &log)
            .stalled(Duration::from_secs(60))
            .into_hook(),
    ];
    let h = start(CheckpointConfig::default(), 1, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    while log.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    h.coordinator
        .shutdown(JobTermination::Suspended)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["trigger:slow:1".to_string(), "close:slow".to_string()]
    );
}

#[tokio::test]
async fn test_stale_hook_report_keeps_current_status() {
    let log = CallLog::default();
    let hooks = vec![ScriptedHook::new("h", &log).into_hook()];
    let mut h = start(CheckpointConfig::default(), 1, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    next_task_message(&h.tasks_rx).await;
    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();
    expect_completed(next_outcome(&mut h.events).await);

    h.coordinator
        .commands
        .send(Command::HookReported {
            checkpoint_id: 1,
            identifier: "h".to_string(),
            result: HookResult::Failed("late".to_string()),
        })
        .unwrap();
    // Round trip through the decision loop.
    assert_eq!(
        h.coordinator.acknowledge(ack(1, 0)).await.unwrap(),
        AckOutcome::Ignored
    );
    assert_eq!(
        h.coordinator.status().hooks.get("h"),
        Some(&HookStatus::Captured {
            checkpoint_id: 1,
            has_state: true
        })
    );
}

#[tokio::test]
async fn test_optional_hook_failure_is_skipped() {
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("required", &log).into_hook(),
        ScriptedHook::new("metrics", &log)
            .optional()
            .failing_trigger()
            .into_hook(),
    ];
    let mut h = start(CheckpointConfig::default(), 1, hooks).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    next_task_message(&h.tasks_rx).await;
    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();

    let metadata = expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(metadata.hook_states.len(), 1);
    assert!(metadata.hook_state("metrics").is_none());
    assert!(matches!(
        h.coordinator.status().hooks.get("metrics"),
        Some(HookStatus::Failed { checkpoint_id: 1, .. })
    ));
}

#[tokio::test]
async fn test_decline_aborts_and_late_acks_are_ignored() {
    let mut h = start(CheckpointConfig::default(), 2, Vec::new()).await;
    h.coordinator.trigger_checkpoint().await.unwrap();

    let outcome = h
        .coordinator
        .decline(TaskCheckpointDecline {
            checkpoint_id: 1,
            task_id: task(1),
            reason: "state backend unavailable".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, AckOutcome::Accepted);

    let (_, reason) = expect_discarded(next_outcome(&mut h.events).await);
    assert!(matches!(reason, AbortReason::TaskDeclined { task_id, .. } if task_id == task(1)));

    for i in 0..2 {
        assert_eq!(
            h.coordinator.acknowledge(ack(1, i)).await.unwrap(),
            AckOutcome::Ignored
        );
    }
    assert_eq!(h.coordinator.status().pending_checkpoints, 0);
    assert_eq!(h.coordinator.status().last_completed_checkpoint, None);
}

#[tokio::test]
async fn test_unknown_and_duplicate_acks() {
    let mut h = start(CheckpointConfig::default(), 2, Vec::new()).await;
    h.coordinator.trigger_checkpoint().await.unwrap();

    let err = h.coordinator.acknowledge(ack(1, 9)).await.unwrap_err();
    assert!(matches!(err, CheckpointError::UnknownAcknowledger { .. }));
    assert!(err.to_string().contains("vertex_1_9"), "unexpected error: {err}");

    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();
    assert_eq!(
        h.coordinator.acknowledge(ack(1, 0)).await.unwrap(),
        AckOutcome::Duplicate
    );
    assert_eq!(h.coordinator.status().pending_checkpoints, 1);

    h.coordinator
        .handle_task_event(TaskCheckpointEvent::Ack(ack(1, 1)))
        .await
        .unwrap();
    let metadata = expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(metadata.task_snapshots.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_times_out() {
    let config = CheckpointConfig::default().with_timeout(Duration::from_millis(10_000));
    let mut h = start(config, 2, Vec::new()).await;

    let started = Instant::now();
    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();

    let (checkpoint_id, reason) = expect_discarded(next_outcome(&mut h.events).await);
    assert_eq!(checkpoint_id, 1);
    assert_eq!(reason, AbortReason::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(10_000));

    assert_eq!(
        h.coordinator.acknowledge(ack(1, 1)).await.unwrap(),
        AckOutcome::Ignored
    );
    assert_eq!(h.coordinator.trigger_checkpoint().await.unwrap(), 2);
}

#[tokio::test]
async fn test_persist_failure_discards_and_degrades_health() {
    let config = CheckpointConfig::default().with_tolerable_persist_failures(2);
    let mut h = start(config, 1, Vec::new()).await;
    h.store.fail_persist.store(true, Ordering::SeqCst);

    for checkpoint_id in 1..=2 {
        assert_eq!(
            h.coordinator.trigger_checkpoint().await.unwrap(),
            checkpoint_id
        );
        h.coordinator.acknowledge(ack(checkpoint_id, 0)).await.unwrap();
        let (discarded, reason) = expect_discarded(next_outcome(&mut h.events).await);
        assert_eq!(discarded, checkpoint_id);
        assert!(
            matches!(reason, AbortReason::PersistFailure(ref msg) if msg.contains("disk full")),
            "{reason:?}"
        );
    }
    assert_eq!(
        next_outcome(&mut h.events).await,
        CheckpointEvent::HealthDegraded {
            consecutive_persist_failures: 2
        }
    );
    assert_eq!(h.coordinator.status().consecutive_persist_failures, 2);
    assert_eq!(h.coordinator.status().last_completed_checkpoint, None);
    assert_eq!(h.store.recover_latest().unwrap(), None);

    h.store.fail_persist.store(false, Ordering::SeqCst);
    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.acknowledge(ack(3, 0)).await.unwrap();
    expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(h.coordinator.status().consecutive_persist_failures, 0);
}

#[tokio::test]
async fn test_newer_completion_subsumes_older_checkpoints() {
    let config = CheckpointConfig::default()
        .with_max_concurrent(3)
        .with_max_retained(1);
    let mut h = start(config, 1, Vec::new()).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.acknowledge(ack(2, 0)).await.unwrap();

    assert_eq!(expect_completed(next_outcome(&mut h.events).await).checkpoint_id, 2);
    assert_eq!(
        expect_discarded(next_outcome(&mut h.events).await),
        (1, AbortReason::Subsumed)
    );

    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.acknowledge(ack(3, 0)).await.unwrap();
    expect_completed(next_outcome(&mut h.events).await);
    assert_eq!(h.coordinator.status().retained_checkpoints, vec![3]);

    h.coordinator
        .shutdown(JobTermination::Suspended)
        .await
        .unwrap();
    assert_eq!(h.store.list_checkpoints().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_older_checkpoint_persisted_late_is_subsumed() {
    let store = Arc::new(ControlledStore {
        slow_persist: Some((1, Duration::from_millis(200))),
        ..ControlledStore::default()
    });
    let config = CheckpointConfig::default()
        .with_max_concurrent(2)
        .with_max_retained(2);
    let mut h = start_with_store(config, 1, Vec::new(), store).await;

    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.acknowledge(ack(1, 0)).await.unwrap();
    h.coordinator.acknowledge(ack(2, 0)).await.unwrap();

    assert_eq!(expect_completed(next_outcome(&mut h.events).await).checkpoint_id, 2);
    assert_eq!(
        expect_discarded(next_outcome(&mut h.events).await),
        (1, AbortReason::Subsumed)
    );
    let status = h.coordinator.status();
    assert_eq!(status.last_completed_checkpoint, Some(2));
    assert_eq!(status.retained_checkpoints, vec![2]);

    h.coordinator
        .shutdown(JobTermination::Suspended)
        .await
        .unwrap();
    assert_eq!(h.store.list_checkpoints().unwrap(), vec![2]);

    let notifications: Vec<(CheckpointId, bool)> = h
        .tasks_rx
        .try_iter()
        .filter_map(|message| match message {
            TaskMessage::NotifyCheckpointComplete { checkpoint_id, .. } => {
                Some((checkpoint_id, true))
            }
            TaskMessage::NotifyCheckpointAborted { checkpoint_id, .. } => {
                Some((checkpoint_id, false))
            }
            TaskMessage::TriggerCheckpoint { .. } => None,
        })
        .collect();
    assert_eq!(notifications, vec![(2, true), (1, false)]);
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_and_rejects_new_work() {
    let log = CallLog::default();
    let hooks = vec![ScriptedHook::new("h", &log).into_hook()];
    let mut h = start(CheckpointConfig::default(), 1, hooks).await;
    h.coordinator.trigger_checkpoint().await.unwrap();
    next_task_message(&h.tasks_rx).await;

    h.coordinator
        .shutdown(JobTermination::Cancelled)
        .await
        .unwrap();
    assert_eq!(
        expect_discarded(next_outcome(&mut h.events).await),
        (1, AbortReason::JobCancelled)
    );

    let status = h.coordinator.status();
    assert_eq!(status.state, CoordinatorState::ShutDown);
    assert_eq!(status.pending_checkpoints, 0);
    assert!(log.lock().unwrap().contains(&"close:h".to_string()));
    assert!(h.store.shut_down.load(Ordering::SeqCst));

    h.coordinator
        .shutdown(JobTermination::Cancelled)
        .await
        .unwrap();
    assert!(matches!(
        h.coordinator.trigger_checkpoint().await.unwrap_err(),
        CheckpointError::TriggerRejected(TriggerRejection::NotRunning)
    ));
    assert!(matches!(
        h.coordinator.acknowledge(ack(1, 0)).await.unwrap_err(),
        CheckpointError::ShutDown
    ));
}

#[tokio::test]
async fn test_retention_policy_on_shutdown() {
    async fn completed_then_shutdown(
        retention: RetentionPolicy,
        termination: JobTermination,
    ) -> Vec<CheckpointId> {
        let config = CheckpointConfig::default().with_retention(retention);
        let mut h = start(config, 1, Vec::new()).await;
        h.coordinator.trigger_checkpoint().await.unwrap();
        h.coordinator.acknowledge(ack(1, 0)).await.unwrap();
        expect_completed(next_outcome(&mut h.events).await);
        h.coordinator.shutdown(termination).await.unwrap();
        h.store.list_checkpoints().unwrap()
    }

    let delete = RetentionPolicy::DeleteOnCancellation;
    let retain = RetentionPolicy::RetainOnCancellation;
    assert!(
        completed_then_shutdown(delete, JobTermination::Finished)
            .await
            .is_empty()
    );
    assert!(
        completed_then_shutdown(delete, JobTermination::Cancelled)
            .await
            .is_empty()
    );
    assert_eq!(
        completed_then_shutdown(delete, JobTermination::Failed).await,
        vec![1]
    );
    assert_eq!(
        completed_then_shutdown(delete, JobTermination::Suspended).await,
        vec![1]
    );
    assert_eq!(
        completed_then_shutdown(retain, JobTermination::Cancelled).await,
        vec![1]
    );
}

#[tokio::test]
async fn test_abort_pending_checkpoints() {
    let config = CheckpointConfig::default().with_max_concurrent(2);
    let mut h = start(config, 1, Vec::new()).await;
    h.coordinator.trigger_checkpoint().await.unwrap();
    h.coordinator.trigger_checkpoint().await.unwrap();

    let aborted = h
        .coordinator
        .abort_pending_checkpoints(AbortReason::JobCancelled)
        .await
        .unwrap();
    assert_eq!(aborted, 2);
    for expected in 1..=2 {
        assert_eq!(
            expect_discarded(next_outcome(&mut h.events).await),
            (expected, AbortReason::JobCancelled)
        );
    }
    assert_eq!(h.coordinator.status().state, CoordinatorState::Running);
    assert_eq!(h.coordinator.trigger_checkpoint().await.unwrap(), 3);
}

fn recovered_metadata() -> CompletedCheckpointMetadata {
    let mut metadata = CompletedCheckpointMetadata {
        checkpoint_id: 7,
        trigger_timestamp: 100,
        completion_timestamp: 150,
        task_snapshots: BTreeMap::new(),
        hook_states: BTreeMap::new(),
    };
    metadata
        .task_snapshots
        .insert(task(0), SnapshotHandle::new("t0@7"));
    metadata.hook_states.insert("h".to_string(), b"s".to_vec());
    metadata
        .hook_states
        .insert("gone".to_string(), b"x".to_vec());
    metadata
}

#[tokio::test]
async fn test_recovery_restores_hooks_and_reports_orphans() {
    let store = Arc::new(ControlledStore::default());
    store.persist(&recovered_metadata()).unwrap();
    let log = CallLog::default();
    let hooks = vec![
        ScriptedHook::new("h", &log).into_hook(),
        ScriptedHook::new("fresh", &log).into_hook(),
    ];
    let h = start_with_store(CheckpointConfig::default(), 1, hooks, store).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["restore:h:7:s".to_string(), "restore:fresh:7:-".to_string()]
    );
    let report = h.coordinator.recovery_report();
    assert_eq!(report.restored_checkpoint, Some(7));
    assert_eq!(report.restored_hooks, vec!["h".to_string(), "fresh".to_string()]);
    assert_eq!(report.orphaned_hook_states, vec!["gone".to_string()]);
    assert!(!report.is_clean());

    let status = h.coordinator.status();
    assert_eq!(status.next_checkpoint_id, 8);
    assert_eq!(status.last_completed_checkpoint, Some(7));
    assert_eq!(
        status.hooks.get("h"),
        Some(&HookStatus::Restored { checkpoint_id: 7 })
    );
    assert_eq!(h.coordinator.trigger_checkpoint().await.unwrap(), 8);
}

fn stored_metadata(checkpoint_id: CheckpointId) -> CompletedCheckpointMetadata {
    CompletedCheckpointMetadata {
        checkpoint_id,
        trigger_timestamp: 10 * checkpoint_id as EventTime,
        completion_timestamp: 10 * checkpoint_id as EventTime + 5,
        task_snapshots: BTreeMap::new(),
        hook_states: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_restart_bounds_and_discards_retained_history() {
    let store = Arc::new(ControlledStore::default());
    for checkpoint_id in 1..=3 {
        store.persist(&stored_metadata(checkpoint_id)).unwrap();
    }
    let config = CheckpointConfig::default().with_max_retained(2);

    let h = start_with_store(config.clone(), 1, Vec::new(), store.clone()).await;
    assert_eq!(
        h.coordinator.recovery_report().retained_checkpoints,
        vec![1, 2, 3]
    );
    assert_eq!(h.coordinator.status().retained_checkpoints, vec![2, 3]);
    h.coordinator
        .shutdown(JobTermination::Suspended)
        .await
        .unwrap();
    assert_eq!(store.list_checkpoints().unwrap(), vec![2, 3]);

    let h = start_with_store(config, 1, Vec::new(), store.clone()).await;
    assert_eq!(h.coordinator.status().retained_checkpoints, vec![2, 3]);
    h.coordinator
        .shutdown(JobTermination::Finished)
        .await
        .unwrap();
    assert!(store.list_checkpoints().unwrap().is_empty());
    assert_eq!(store.recover_latest().unwrap(), None);
}

#[tokio::test]
async fn test_restore_failures() {
    let store = Arc::new(ControlledStore::default());
    store.persist(&recovered_metadata()).unwrap();
    let log = CallLog::default();

    let mut registry = MasterHookRegistry::new();
    registry
        .register(ScriptedHook::new("h", &log).failing_restore().into_hook())
        .unwrap();
    let (gateway, _rx) = ChannelTaskGateway::unbounded();
    let err = CheckpointCoordinator::start(
        CheckpointConfig::default(),
        CheckpointTasks::all(vec![task(0)]),
        registry,
        store.clone(),
        Arc::new(gateway.clone()),
    )
    .await
    .err()
    .unwrap();
    assert!(
        matches!(err, CheckpointError::HookRestore { ref identifier, checkpoint_id: 7, .. } if identifier == "h"),
        "unexpected error: {err}"
    );

    let hooks = vec![
        ScriptedHook::new("h", &log)
            .optional()
            .failing_restore()
            .into_hook(),
    ];
    let h = start_with_store(CheckpointConfig::default(), 1, hooks, store).await;
    let report = h.coordinator.recovery_report();
    assert_eq!(report.failed_optional_hooks.len(), 1);
    assert!(report.failed_optional_hooks[0].1.contains("lease expired"));
    assert!(matches!(
        h.coordinator.status().hooks.get("h"),
        Some(HookStatus::RestoreFailed { checkpoint_id: 7, .. })
    ));
}

#[tokio::test]
async fn test_unreachable_store_fails_start() {
    let store = Arc::new(ControlledStore {
        unreachable: true,
        ..ControlledStore::default()
    });
    let (gateway, _rx) = ChannelTaskGateway::unbounded();
    let err = CheckpointCoordinator::start(
        CheckpointConfig::default(),
        CheckpointTasks::all(vec![task(0)]),
        MasterHookRegistry::new(),
        store,
        Arc::new(gateway),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CheckpointError::StoreUnavailable(_)));
    assert!(err.to_string().contains("unavailable"), "unexpected error: {err}");
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let (gateway, _rx) = ChannelTaskGateway::unbounded();
    let err = CheckpointCoordinator::start(
        CheckpointConfig::default().with_max_retained(0),
        CheckpointTasks::all(vec![task(0)]),
        MasterHookRegistry::new(),
        Arc::new(StandaloneRecoveryStore::new()),
        Arc::new(gateway),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CheckpointError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_start_with_settings_tolerates_missing_hook_types() {
    let settings = JobCheckpointingSettings::new(vec![task(0), task(1)], CheckpointConfig::default())
        .with_tasks_to_trigger(vec![task(0)])
        .with_master_hook(SerializedHookFactory::new("not-on-classpath", Vec::new()));
    let (gateway, tasks_rx) = ChannelTaskGateway::unbounded();

    let coordinator = CheckpointCoordinator::start_with_settings(
        &settings,
        &TypeRegistryResolver::new(),
        Arc::new(StandaloneRecoveryStore::new()),
        Arc::new(gateway),
    )
    .await
    .unwrap();

    let report = coordinator.recovery_report();
    assert_eq!(report.hook_instantiation_failures.len(), 1);
    assert!(report.hook_instantiation_failures[0].contains("not-on-classpath"));
    assert_eq!(coordinator.status().registered_hooks, 0);

    coordinator.trigger_checkpoint().await.unwrap();
    let triggered: Vec<TaskId> = tasks_rx.try_iter().map(|m| m.task_id()).collect();
    assert_eq!(triggered, vec![task(0)]);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_triggers_periodically() {
    let config = CheckpointConfig::default().with_interval(Duration::from_secs(1));
    let mut h = start(config, 1, Vec::new()).await;

    h.coordinator.start_scheduler().await.unwrap();
    h.coordinator.start_scheduler().await.unwrap();
    for expected in 1..=2 {
        let checkpoint_id = loop {
            if let CheckpointEvent::Triggered { checkpoint_id, .. } = h.events.recv().await.unwrap() {
                break checkpoint_id;
            }
        };
        assert_eq!(checkpoint_id, expected);
        h.coordinator
            .acknowledge(ack(checkpoint_id, 0))
            .await
            .unwrap();
    }

    h.coordinator.stop_scheduler().await.unwrap();
    let next_id = h.coordinator.status().next_checkpoint_id;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.coordinator.status().next_checkpoint_id, next_id);
}
