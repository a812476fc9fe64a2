use super::*;

/// Lifecycle of one checkpoint attempt.
///
/// `Completed` and `Discarded` are terminal: once reached, the checkpoint
/// never changes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Master hooks are capturing state; tasks have not been triggered yet.
    Triggering,
    InProgress,
    Completed,
    Discarded(AbortReason),
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded(_))
    }
}

/// Result of one master hook's trigger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    State(Option<Vec<u8>>),
    Failed(String),
}

/// What happened to an acknowledgment or hook result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    /// Already recorded; nothing changed.
    Duplicate,
    /// The checkpoint is already terminal; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HookSlot {
    Outstanding,
    Captured(Option<Vec<u8>>),
    Failed(String),
}

#[derive(Debug, Clone)]
struct HookEntry {
    mandatory: bool,
    slot: HookSlot,
}

/// Aggregation state of one in-flight checkpoint.
///
/// Only the coordinator's decision loop owns and mutates these.
#[derive(Debug)]
pub struct PendingCheckpoint {
    checkpoint_id: CheckpointId,
    trigger_timestamp: EventTime,
    deadline: Instant,
    expected_tasks: HashSet<TaskId>,
    not_yet_acknowledged: HashSet<TaskId>,
    task_snapshots: BTreeMap<TaskId, SnapshotHandle>,
    hooks: BTreeMap<String, HookEntry>,
    status: CheckpointStatus,
}

impl PendingCheckpoint {
    /// `hooks` lists `(identifier, mandatory)` for every hook that must
    /// report before the checkpoint can complete.
    pub fn new(
        checkpoint_id: CheckpointId,
        trigger_timestamp: EventTime,
        deadline: Instant,
        expected_tasks: impl IntoIterator<Item = TaskId>,
        hooks: impl IntoIterator<Item = (String, bool)>,
    ) -> Self {
        let expected_tasks: HashSet<TaskId> = expected_tasks.into_iter().collect();
        let hooks: BTreeMap<String, HookEntry> = hooks
            .into_iter()
            .map(|(identifier, mandatory)| {
                (
                    identifier,
                    HookEntry {
                        mandatory,
                        slot: HookSlot::Outstanding,
                    },
                )
            })
            .collect();
        let status = if hooks.is_empty() {
            CheckpointStatus::InProgress
        } else {
            CheckpointStatus::Triggering
        };
        Self {
            checkpoint_id,
            trigger_timestamp,
            deadline,
            not_yet_acknowledged: expected_tasks.clone(),
            expected_tasks,
            task_snapshots: BTreeMap::new(),
            hooks,
            status,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn trigger_timestamp(&self) -> EventTime {
        self.trigger_timestamp
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn status(&self) -> &CheckpointStatus {
        &self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self.status, CheckpointStatus::Discarded(_))
    }

    pub fn expected_task_count(&self) -> usize {
        self.expected_tasks.len()
    }

    pub fn expects(&self, task_id: &TaskId) -> bool {
        self.expected_tasks.contains(task_id)
    }

    pub fn acknowledged_task_count(&self) -> usize {
        self.expected_tasks.len() - self.not_yet_acknowledged.len()
    }

    /// Tasks that still owe an acknowledgment, sorted.
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self.not_yet_acknowledged.iter().copied().collect();
        tasks.sort_unstable();
        tasks
    }

    /// True once no hook result is outstanding.
    pub fn hooks_settled(&self) -> bool {
        self.hooks
            .values()
            .all(|entry| entry.slot != HookSlot::Outstanding)
    }

    /// Moves `Triggering` to `InProgress`. Returns whether the status changed.
    pub fn mark_in_progress(&mut self) -> bool {
        if self.status == CheckpointStatus::Triggering {
            self.status = CheckpointStatus::InProgress;
            true
        } else {
            false
        }
    }

    pub fn record_task_ack(
        &mut self,
        task_id: TaskId,
        handle: SnapshotHandle,
    ) -> Result<AckOutcome, CheckpointError> {
        if self.is_terminal() {
            return Ok(AckOutcome::Ignored);
        }
        if !self.expected_tasks.contains(&task_id) {
            return Err(CheckpointError::UnknownAcknowledger {
                checkpoint_id: self.checkpoint_id,
                task_id,
            });
        }
        if !self.not_yet_acknowledged.remove(&task_id) {
            return Ok(AckOutcome::Duplicate);
        }
        self.task_snapshots.insert(task_id, handle);
        Ok(AckOutcome::Accepted)
    }

    pub fn record_hook_result(
        &mut self,
        identifier: &str,
        result: HookResult,
    ) -> Result<AckOutcome, CheckpointError> {
        if self.is_terminal() {
            return Ok(AckOutcome::Ignored);
        }
        let checkpoint_id = self.checkpoint_id;
        let entry = self
            .hooks
            .get_mut(identifier)
            .ok_or_else(|| CheckpointError::UnknownHook {
                checkpoint_id,
                identifier: identifier.to_string(),
            })?;
        if entry.slot != HookSlot::Outstanding {
            return Ok(AckOutcome::Duplicate);
        }
        entry.slot = match result {
            HookResult::State(state) => HookSlot::Captured(state),
            HookResult::Failed(message) => HookSlot::Failed(message),
        };
        Ok(AckOutcome::Accepted)
    }

    /// First mandatory hook that failed, as `(identifier, message)`.
    pub fn failed_mandatory_hook(&self) -> Option<(String, String)> {
        self.hooks
            .iter()
            .find_map(|(identifier, entry)| match &entry.slot {
                HookSlot::Failed(message) if entry.mandatory => {
                    Some((identifier.clone(), message.clone()))
                }
                _ => None,
            })
    }

    /// True exactly when every expected task acknowledged and every hook
    /// reported, with no mandatory hook failing.
    pub fn is_complete(&self) -> bool {
        !self.is_terminal()
            && self.not_yet_acknowledged.is_empty()
            && self.hooks_settled()
            && self.failed_mandatory_hook().is_none()
    }

    /// Forces the checkpoint into `Discarded`. Returns false if it was
    /// already terminal, in which case nothing changes.
    pub fn abort(&mut self, reason: AbortReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = CheckpointStatus::Discarded(reason);
        true
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_terminal() && now >= self.deadline
    }

    /// Aborts with [`AbortReason::Timeout`] if the deadline has passed.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        if self.is_expired(now) {
            self.abort(AbortReason::Timeout)
        } else {
            false
        }
    }

    /// Builds the metadata to persist. The checkpoint must be complete.
    pub fn to_completed_metadata(
        &self,
        completion_timestamp: EventTime,
    ) -> Result<CompletedCheckpointMetadata> {
        if !self.is_complete() {
            bail!("checkpoint {} is not complete", self.checkpoint_id);
        }
        let hook_states = self
            .hooks
            .iter()
            .filter_map(|(identifier, entry)| match &entry.slot {
                HookSlot::Captured(Some(state)) => Some((identifier.clone(), state.clone())),
                _ => None,
            })
            .collect();
        Ok(CompletedCheckpointMetadata {
            checkpoint_id: self.checkpoint_id,
            trigger_timestamp: self.trigger_timestamp,
            completion_timestamp,
            task_snapshots: self.task_snapshots.clone(),
            hook_states,
        })
    }

    /// Marks the checkpoint `Completed`. Call only after its metadata is
    /// durable.
    pub fn mark_completed(&mut self) -> Result<()> {
        if !self.is_complete() {
            bail!("checkpoint {} is not complete", self.checkpoint_id);
        }
        self.status = CheckpointStatus::Completed;
        Ok(())
    }
}
