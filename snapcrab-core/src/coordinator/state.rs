use super::*;
use anyhow::anyhow;

type Reply<T> = oneshot::Sender<T>;

fn reject(reason: TriggerRejection) -> Result<CheckpointId, CheckpointError> {
    Err(CheckpointError::TriggerRejected(reason))
}

/// Requests and reports folded into the decision loop.
pub(crate) enum Command {
    Trigger {
        reply: Reply<Result<CheckpointId, CheckpointError>>,
    },
    PeriodicTrigger,
    HookReported {
        checkpoint_id: CheckpointId,
        identifier: String,
        result: HookResult,
    },
    Acknowledge {
        ack: TaskCheckpointAck,
        reply: Reply<Result<AckOutcome, CheckpointError>>,
    },
    Decline {
        decline: TaskCheckpointDecline,
        reply: Reply<Result<AckOutcome, CheckpointError>>,
    },
    Expire {
        checkpoint_id: CheckpointId,
    },
    Persisted {
        checkpoint_id: CheckpointId,
        result: anyhow::Result<CompletedCheckpointMetadata>,
    },
    AbortAll {
        reason: AbortReason,
        reply: Reply<usize>,
    },
    StartScheduler {
        reply: Reply<Result<(), CheckpointError>>,
    },
    StopScheduler {
        reply: Reply<()>,
    },
    Shutdown {
        termination: JobTermination,
        reply: Reply<Result<(), CheckpointError>>,
    },
}

/// Sole owner of the coordinator's decision state.
pub(crate) struct DecisionLoop {
    config: CheckpointConfig,
    tasks: CheckpointTasks,
    hooks: MasterHookRegistry,
    store: Arc<dyn CheckpointRecoveryStore>,
    gateway: Arc<dyn TaskGateway>,
    events: broadcast::Sender<CheckpointEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,

    state: CoordinatorState,
    next_checkpoint_id: CheckpointId,
    last_trigger: Option<Instant>,
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
    /// Complete checkpoints whose metadata is being persisted. They can no
    /// longer be aborted.
    finalizing: BTreeSet<CheckpointId>,
    timers: HashMap<CheckpointId, JoinHandle<()>>,
    /// Hook capture tasks of checkpoints still in the triggering phase.
    captures: HashMap<CheckpointId, JoinHandle<()>>,
    /// Aborted capture tasks that may not have stopped yet.
    stopped_captures: Vec<JoinHandle<()>>,
    /// Ids of the retained completed checkpoints, ascending.
    retained: VecDeque<CheckpointId>,
    last_completed: Option<(CheckpointId, EventTime)>,
    hook_status: BTreeMap<String, HookStatus>,
    consecutive_persist_failures: u32,
    scheduler: Option<TriggerScheduler>,
    discards: Vec<JoinHandle<()>>,
    termination: Option<JobTermination>,
    shutdown_waiters: Vec<Reply<Result<(), CheckpointError>>>,
}

impl DecisionLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CheckpointConfig,
        tasks: CheckpointTasks,
        hooks: MasterHookRegistry,
        store: Arc<dyn CheckpointRecoveryStore>,
        gateway: Arc<dyn TaskGateway>,
        events: broadcast::Sender<CheckpointEvent>,
        commands: mpsc::WeakUnboundedSender<Command>,
        recovered: Option<CompletedCheckpointMetadata>,
        report: &RecoveryReport,
    ) -> Self {
        let mut hook_status = BTreeMap::new();
        for identifier in hooks.identifiers() {
            let status = match report.restored_checkpoint {
                Some(checkpoint_id) if report.restored_hooks.contains(&identifier) => {
                    HookStatus::Restored { checkpoint_id }
                }
                Some(checkpoint_id) => report
                    .failed_optional_hooks
                    .iter()
                    .find(|(failed, _)| *failed == identifier)
                    .map(|(_, message)| HookStatus::RestoreFailed {
                        checkpoint_id,
                        message: message.clone(),
                    })
                    .unwrap_or(HookStatus::Idle),
                None => HookStatus::Idle,
            };
            hook_status.insert(identifier, status);
        }

        // Ids never regress, even across restarts.
        let next_checkpoint_id = recovered
            .as_ref()
            .map_or(1, |metadata| metadata.checkpoint_id + 1);
        let last_completed = recovered
            .as_ref()
            .map(|metadata| (metadata.checkpoint_id, metadata.completion_timestamp));
        let mut retained: VecDeque<CheckpointId> =
            report.retained_checkpoints.iter().copied().collect();
        if let Some((checkpoint_id, _)) = last_completed
            && !retained.contains(&checkpoint_id)
        {
            retained.push_back(checkpoint_id);
        }

        let mut decision_loop = Self {
            config,
            tasks,
            hooks,
            store,
            gateway,
            events,
            commands,
            state: CoordinatorState::Running,
            next_checkpoint_id,
            last_trigger: None,
            pending: BTreeMap::new(),
            finalizing: BTreeSet::new(),
            timers: HashMap::new(),
            captures: HashMap::new(),
            stopped_captures: Vec::new(),
            retained,
            last_completed,
            hook_status,
            consecutive_persist_failures: 0,
            scheduler: None,
            discards: Vec::new(),
            termination: None,
            shutdown_waiters: Vec::new(),
        };
        // History left behind by earlier coordinators obeys the same bound.
        decision_loop.trim_retained();
        decision_loop
    }

    pub(crate) fn snapshot(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state,
            pending_checkpoints: self.pending.len(),
            last_completed_checkpoint: self.last_completed.map(|(id, _)| id),
            last_completion_time: self.last_completed.map(|(_, time)| time),
            retained_checkpoints: self.retained.iter().copied().collect(),
            hooks: self.hook_status.clone(),
            consecutive_persist_failures: self.consecutive_persist_failures,
            registered_hooks: self.hooks.len(),
            next_checkpoint_id: self.next_checkpoint_id,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<CoordinatorStatus>,
    ) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
            status.send_replace(self.snapshot());
            if self.state == CoordinatorState::ShutDown {
                return;
            }
        }

        debug!("all coordinator handles dropped, stopping decision loop");
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        for (_, capture) in self.captures.drain() {
            capture.abort();
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Trigger { reply } => {
                let result = self.trigger();
                if let Err(err) = &result {
                    debug!("{}", err);
                }
                let _ = reply.send(result);
            }
            Command::PeriodicTrigger => {
                if let Err(err) = self.trigger() {
                    debug!("periodic checkpoint skipped: {}", err);
                }
            }
            Command::HookReported {
                checkpoint_id,
                identifier,
                result,
            } => self.on_hook_reported(checkpoint_id, identifier, result),
            Command::Acknowledge { ack, reply } => {
                let _ = reply.send(self.on_acknowledge(ack));
            }
            Command::Decline { decline, reply } => {
                let _ = reply.send(self.on_decline(decline));
            }
            Command::Expire { checkpoint_id } => self.on_expire(checkpoint_id),
            Command::Persisted {
                checkpoint_id,
                result,
            } => self.on_persisted(checkpoint_id, result).await,
            Command::AbortAll { reason, reply } => {
                let _ = reply.send(self.abort_all(reason));
            }
            Command::StartScheduler { reply } => {
                let _ = reply.send(self.start_scheduler());
            }
            Command::StopScheduler { reply } => {
                if let Some(scheduler) = self.scheduler.take() {
                    scheduler.stop();
                    info!("checkpoint scheduler stopped");
                }
                let _ = reply.send(());
            }
            Command::Shutdown { termination, reply } => self.begin_shutdown(termination, reply).await,
        }
    }

    fn trigger(&mut self) -> Result<CheckpointId, CheckpointError> {
        if self.state != CoordinatorState::Running {
            return reject(TriggerRejection::NotRunning);
        }
        if self.tasks.to_acknowledge.is_empty() {
            return reject(TriggerRejection::NoTasks);
        }
        if self.pending.len() >= self.config.max_concurrent {
            return reject(TriggerRejection::TooManyConcurrentCheckpoints);
        }
        let now = Instant::now();
        if let Some(last) = self.last_trigger
            && now.duration_since(last) < self.config.min_pause
        {
            return reject(TriggerRejection::MinPauseNotElapsed);
        }

        let checkpoint_id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        self.last_trigger = Some(now);
        let timestamp = current_unix_millis();
        let deadline = now + self.config.timeout;

        let hooks: Vec<Arc<dyn MasterHook>> = self.hooks.hooks_ordered().cloned().collect();
        let pending = PendingCheckpoint::new(
            checkpoint_id,
            timestamp,
            deadline,
            self.tasks.to_acknowledge.iter().copied(),
            hooks
                .iter()
                .map(|hook| (hook.identifier().to_string(), hook.is_mandatory())),
        );
        self.pending.insert(checkpoint_id, pending);
        self.arm_timer(checkpoint_id, deadline);

        info!(
            "triggering checkpoint {} @ {} ({} tasks, {} hooks)",
            checkpoint_id,
            timestamp,
            self.tasks.to_acknowledge.len(),
            hooks.len()
        );
        self.publish(CheckpointEvent::Triggered {
            checkpoint_id,
            timestamp,
        });

        if hooks.is_empty() {
            self.dispatch_triggers(checkpoint_id, timestamp);
        } else {
            for hook in &hooks {
                self.hook_status.insert(
                    hook.identifier().to_string(),
                    HookStatus::Triggering { checkpoint_id },
                );
            }
            let capture = self.spawn_hook_capture(checkpoint_id, timestamp, hooks);
            self.captures.insert(checkpoint_id, capture);
        }
        Ok(checkpoint_id)
    }

    /// Runs the hooks one after another, in registration order, off the
    /// decision loop. Stops at the first failing mandatory hook.
    fn spawn_hook_capture(
        &self,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
        hooks: Vec<Arc<dyn MasterHook>>,
    ) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            for hook in hooks {
                let result = match hook.trigger_checkpoint(checkpoint_id, timestamp).await {
                    Ok(state) => HookResult::State(state),
                    Err(err) => HookResult::Failed(format!("{err:#}")),
                };
                let fatal = matches!(result, HookResult::Failed(_)) && hook.is_mandatory();
                let Some(commands) = commands.upgrade() else {
                    return;
                };
                let reported = Command::HookReported {
                    checkpoint_id,
                    identifier: hook.identifier().to_string(),
                    result,
                };
                if commands.send(reported).is_err() || fatal {
                    return;
                }
            }
        })
    }

    fn arm_timer(&mut self, checkpoint_id: CheckpointId, deadline: Instant) {
        let commands = self.commands.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Expire { checkpoint_id });
            }
        });
        self.timers.insert(checkpoint_id, timer);
    }

    fn dispatch_triggers(&self, checkpoint_id: CheckpointId, timestamp: EventTime) {
        debug!(
            "sending checkpoint {} to {} tasks",
            checkpoint_id,
            self.tasks.to_trigger.len()
        );
        for task_id in &self.tasks.to_trigger {
            if let Err(err) =
                self.gateway
                    .trigger_checkpoint(*task_id, checkpoint_id, timestamp, self.config.mode)
            {
                warn!(
                    "failed to send checkpoint {} to task {}: {:#}",
                    checkpoint_id, task_id, err
                );
            }
        }
    }

    fn on_hook_reported(
        &mut self,
        checkpoint_id: CheckpointId,
        identifier: String,
        result: HookResult,
    ) {
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            debug!(
                "master hook '{}' reported for checkpoint {} which is no longer pending",
                identifier, checkpoint_id
            );
            return;
        };
        let mandatory = self
            .hooks
            .get(&identifier)
            .is_none_or(|hook| hook.is_mandatory());
        let status = match &result {
            HookResult::State(state) => HookStatus::Captured {
                checkpoint_id,
                has_state: state.is_some(),
            },
            HookResult::Failed(message) => {
                if !mandatory {
                    warn!(
                        "optional master hook '{}' failed for checkpoint {}, skipping it: {}",
                        identifier, checkpoint_id, message
                    );
                }
                HookStatus::Failed {
                    checkpoint_id,
                    message: message.clone(),
                }
            }
        };
        match pending.record_hook_result(&identifier, result) {
            Ok(AckOutcome::Accepted) => {}
            Ok(_) => return,
            Err(err) => {
                warn!("{}", err);
                return;
            }
        }
        self.hook_status.insert(identifier, status);

        if let Some((identifier, message)) = pending.failed_mandatory_hook() {
            self.abort_checkpoint(
                checkpoint_id,
                AbortReason::HookFailed {
                    identifier,
                    message,
                },
            );
            return;
        }
        if pending.hooks_settled() {
            self.captures.remove(&checkpoint_id);
            if pending.mark_in_progress() {
                let timestamp = pending.trigger_timestamp();
                self.dispatch_triggers(checkpoint_id, timestamp);
            }
        }
        self.try_finalize(checkpoint_id);
    }

    fn on_acknowledge(&mut self, ack: TaskCheckpointAck) -> Result<AckOutcome, CheckpointError> {
        let TaskCheckpointAck {
            checkpoint_id,
            task_id,
            handle,
        } = ack;
        if self.finalizing.contains(&checkpoint_id) {
            return Ok(AckOutcome::Ignored);
        }
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            debug!(
                "ack from task {} for checkpoint {} which is no longer pending",
                task_id, checkpoint_id
            );
            return Ok(AckOutcome::Ignored);
        };

        match pending.record_task_ack(task_id, handle) {
            Ok(AckOutcome::Accepted) => {
                debug!(
                    "checkpoint {}: ack from task {} ({}/{})",
                    checkpoint_id,
                    task_id,
                    pending.acknowledged_task_count(),
                    pending.expected_task_count()
                );
                self.try_finalize(checkpoint_id);
                Ok(AckOutcome::Accepted)
            }
            Ok(outcome) => {
                debug!(
                    "duplicate ack from task {} for checkpoint {}",
                    task_id, checkpoint_id
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!("{}, ignoring", err);
                Err(err)
            }
        }
    }

    fn on_decline(&mut self, decline: TaskCheckpointDecline) -> Result<AckOutcome, CheckpointError> {
        let TaskCheckpointDecline {
            checkpoint_id,
            task_id,
            reason,
        } = decline;
        if self.finalizing.contains(&checkpoint_id) {
            return Ok(AckOutcome::Ignored);
        }
        let Some(pending) = self.pending.get(&checkpoint_id) else {
            return Ok(AckOutcome::Ignored);
        };
        if !pending.expects(&task_id) {
            let err = CheckpointError::UnknownAcknowledger {
                checkpoint_id,
                task_id,
            };
            warn!("{}, ignoring decline", err);
            return Err(err);
        }
        self.abort_checkpoint(checkpoint_id, AbortReason::TaskDeclined { task_id, reason });
        Ok(AckOutcome::Accepted)
    }

    fn on_expire(&mut self, checkpoint_id: CheckpointId) {
        if self.finalizing.contains(&checkpoint_id) {
            return;
        }
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            return;
        };
        if pending.check_deadline(Instant::now()) {
            let pending_tasks = pending.pending_tasks();
            self.pending.remove(&checkpoint_id);
            debug!(
                "checkpoint {} expired waiting for tasks {:?}",
                checkpoint_id, pending_tasks
            );
            self.after_abort(checkpoint_id, AbortReason::Timeout);
        }
    }

    /// Starts persisting `checkpoint_id` once every contribution is in.
    fn try_finalize(&mut self, checkpoint_id: CheckpointId) {
        if self.finalizing.contains(&checkpoint_id) {
            return;
        }
        let Some(pending) = self.pending.get(&checkpoint_id) else {
            return;
        };
        if !pending.is_complete() {
            return;
        }
        let metadata = match pending.to_completed_metadata(current_unix_millis()) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("cannot finalize checkpoint {}: {:#}", checkpoint_id, err);
                return;
            }
        };

        self.finalizing.insert(checkpoint_id);
        if let Some(timer) = self.timers.remove(&checkpoint_id) {
            timer.abort();
        }
        debug!("checkpoint {} complete, persisting metadata", checkpoint_id);

        let store = Arc::clone(&self.store);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || store.persist(&metadata).map(|()| metadata))
                    .await
                    .unwrap_or_else(|err| Err(anyhow!("persist task failed: {err}")));
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Persisted {
                    checkpoint_id,
                    result,
                });
            }
        });
    }

    async fn on_persisted(
        &mut self,
        checkpoint_id: CheckpointId,
        result: anyhow::Result<CompletedCheckpointMetadata>,
    ) {
        self.finalizing.remove(&checkpoint_id);
        if let Some(mut pending) = self.pending.remove(&checkpoint_id) {
            match result {
                // A newer checkpoint completed while this one was being
                // written; committing it now would reorder commits.
                Ok(_)
                    if self
                        .last_completed
                        .is_some_and(|(last_id, _)| last_id > checkpoint_id) =>
                {
                    self.consecutive_persist_failures = 0;
                    pending.abort(AbortReason::Subsumed);
                    self.after_abort(checkpoint_id, AbortReason::Subsumed);
                    self.discard_in_background(checkpoint_id);
                }
                Ok(metadata) => {
                    if let Err(err) = pending.mark_completed() {
                        warn!("{:#}", err);
                    }
                    self.on_completed(metadata);
                }
                Err(err) => {
                    let reason = AbortReason::PersistFailure(format!("{err:#}"));
                    pending.abort(reason.clone());
                    self.after_abort(checkpoint_id, reason);
                    self.record_persist_failure();
                }
            }
        }

        if self.state == CoordinatorState::ShuttingDown && self.finalizing.is_empty() {
            self.finish_shutdown().await;
        }
    }

    fn on_completed(&mut self, metadata: CompletedCheckpointMetadata) {
        let checkpoint_id = metadata.checkpoint_id;
        self.consecutive_persist_failures = 0;
        if self
            .last_completed
            .is_none_or(|(last_id, _)| last_id < checkpoint_id)
        {
            self.last_completed = Some((checkpoint_id, metadata.completion_timestamp));
        }
        info!(
            "completed checkpoint {} ({} task snapshots, {} hook states)",
            checkpoint_id,
            metadata.task_snapshots.len(),
            metadata.hook_states.len()
        );

        self.retain(checkpoint_id);
        for task_id in &self.tasks.to_commit {
            if let Err(err) = self
                .gateway
                .notify_checkpoint_complete(*task_id, checkpoint_id)
            {
                warn!(
                    "failed to notify task {} of completed checkpoint {}: {:#}",
                    task_id, checkpoint_id, err
                );
            }
        }
        self.publish(CheckpointEvent::Completed(metadata));

        let subsumed: Vec<CheckpointId> = self
            .pending
            .keys()
            .copied()
            .filter(|id| *id < checkpoint_id && !self.finalizing.contains(id))
            .collect();
        for id in subsumed {
            self.abort_checkpoint(id, AbortReason::Subsumed);
        }
    }

    fn record_persist_failure(&mut self) {
        self.consecutive_persist_failures += 1;
        let threshold = self.config.tolerable_persist_failures.max(1);
        if self.consecutive_persist_failures == threshold {
            error!(
                "{} consecutive checkpoints failed to persist, checkpointing is degraded",
                self.consecutive_persist_failures
            );
            self.publish(CheckpointEvent::HealthDegraded {
                consecutive_persist_failures: self.consecutive_persist_failures,
            });
        }
    }

    /// Adds to the retained history and discards what falls out of it.
    fn retain(&mut self, checkpoint_id: CheckpointId) {
        let position = self.retained.partition_point(|id| *id < checkpoint_id);
        self.retained.insert(position, checkpoint_id);
        self.trim_retained();
    }

    fn trim_retained(&mut self) {
        self.discards.retain(|discard| !discard.is_finished());
        self.stopped_captures.retain(|capture| !capture.is_finished());
        while self.retained.len() > self.config.max_retained {
            if let Some(oldest) = self.retained.pop_front() {
                self.discard_in_background(oldest);
            }
        }
    }

    fn discard_in_background(&mut self, checkpoint_id: CheckpointId) {
        let store = Arc::clone(&self.store);
        let discard = tokio::task::spawn_blocking(move || match store.discard(checkpoint_id) {
            Ok(()) => debug!("discarded checkpoint {}", checkpoint_id),
            Err(err) => warn!("failed to discard checkpoint {}: {:#}", checkpoint_id, err),
        });
        self.discards.push(discard);
    }

    /// Aborts a pending checkpoint unless it is already being persisted.
    fn abort_checkpoint(&mut self, checkpoint_id: CheckpointId, reason: AbortReason) -> bool {
        if self.finalizing.contains(&checkpoint_id) {
            return false;
        }
        let Some(mut pending) = self.pending.remove(&checkpoint_id) else {
            return false;
        };
        pending.abort(reason.clone());
        self.after_abort(checkpoint_id, reason);
        true
    }

    fn after_abort(&mut self, checkpoint_id: CheckpointId, reason: AbortReason) {
        if let Some(timer) = self.timers.remove(&checkpoint_id) {
            timer.abort();
        }
        if let Some(capture) = self.captures.remove(&checkpoint_id) {
            capture.abort();
            self.stopped_captures.push(capture);
        }
        match reason {
            AbortReason::Subsumed | AbortReason::CoordinatorShutdown | AbortReason::JobCancelled => {
                info!("checkpoint {} discarded: {}", checkpoint_id, reason)
            }
            _ => warn!("checkpoint {} discarded: {}", checkpoint_id, reason),
        }
        for task_id in &self.tasks.to_commit {
            if let Err(err) = self.gateway.notify_checkpoint_aborted(*task_id, checkpoint_id) {
                warn!(
                    "failed to notify task {} of aborted checkpoint {}: {:#}",
                    task_id, checkpoint_id, err
                );
            }
        }
        self.publish(CheckpointEvent::Discarded {
            checkpoint_id,
            reason,
        });
    }

    fn abort_all(&mut self, reason: AbortReason) -> usize {
        let ids: Vec<CheckpointId> = self.pending.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.abort_checkpoint(*id, reason.clone()))
            .count()
    }

    fn start_scheduler(&mut self) -> Result<(), CheckpointError> {
        if self.state != CoordinatorState::Running {
            return Err(CheckpointError::TriggerRejected(TriggerRejection::NotRunning));
        }
        if self
            .scheduler
            .as_ref()
            .is_some_and(TriggerScheduler::is_running)
        {
            return Ok(());
        }
        info!(
            "starting checkpoint scheduler, interval {:?}",
            self.config.interval
        );
        self.scheduler = Some(TriggerScheduler::spawn(
            self.config.interval,
            self.commands.clone(),
        ));
        Ok(())
    }

    async fn begin_shutdown(
        &mut self,
        termination: JobTermination,
        reply: Reply<Result<(), CheckpointError>>,
    ) {
        if self.state != CoordinatorState::Running {
            self.shutdown_waiters.push(reply);
            return;
        }
        info!("shutting down checkpoint coordinator, job {:?}", termination);
        self.state = CoordinatorState::ShuttingDown;
        self.termination = Some(termination);
        self.shutdown_waiters.push(reply);
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }

        let reason = if termination == JobTermination::Cancelled {
            AbortReason::JobCancelled
        } else {
            AbortReason::CoordinatorShutdown
        };
        let aborted = self.abort_all(reason);
        if aborted > 0 {
            debug!("aborted {} in-flight checkpoints on shutdown", aborted);
        }
        if self.finalizing.is_empty() {
            self.finish_shutdown().await;
        } else {
            info!(
                "waiting for {} checkpoints to finish persisting",
                self.finalizing.len()
            );
        }
    }

    async fn finish_shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        // No hook may still be inside a trigger call when it is closed.
        for (_, capture) in self.captures.drain() {
            capture.abort();
            self.stopped_captures.push(capture);
        }
        for capture in self.stopped_captures.drain(..) {
            let _ = capture.await;
        }
        for hook in self.hooks.hooks_ordered() {
            hook.close();
        }
        for discard in self.discards.drain(..) {
            let _ = discard.await;
        }

        let termination = self.termination.unwrap_or(JobTermination::Suspended);
        let discard_retained = termination.is_globally_terminal()
            && self.config.retention == RetentionPolicy::DeleteOnCancellation;
        let retained: Vec<CheckpointId> = if discard_retained {
            self.retained.drain(..).collect()
        } else {
            Vec::new()
        };
        let store = Arc::clone(&self.store);
        let closed = tokio::task::spawn_blocking(move || {
            for checkpoint_id in retained {
                if let Err(err) = store.discard(checkpoint_id) {
                    warn!(
                        "failed to discard retained checkpoint {}: {:#}",
                        checkpoint_id, err
                    );
                }
            }
            store.shutdown()
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("recovery store shutdown failed: {:#}", err),
            Err(err) => warn!("recovery store shutdown task failed: {}", err),
        }

        self.state = CoordinatorState::ShutDown;
        info!("checkpoint coordinator shut down");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn publish(&self, event: CheckpointEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }
}
