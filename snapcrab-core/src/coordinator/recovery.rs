use super::*;
use anyhow::anyhow;

/// What happened while the coordinator recovered at start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoint the coordinator resumed from, if any.
    pub restored_checkpoint: Option<CheckpointId>,
    /// Completed checkpoints found in the store up to the restored one,
    /// ascending. They seed the retained history.
    pub retained_checkpoints: Vec<CheckpointId>,
    /// Hooks whose restore succeeded, in restore order.
    pub restored_hooks: Vec<String>,
    /// Identifiers that had state in the checkpoint but no registered hook.
    pub orphaned_hook_states: Vec<String>,
    /// Optional hooks whose restore failed, with the failure message.
    pub failed_optional_hooks: Vec<(String, String)>,
    /// Hook factories that could not be instantiated.
    pub hook_instantiation_failures: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_hook_states.is_empty()
            && self.failed_optional_hooks.is_empty()
            && self.hook_instantiation_failures.is_empty()
    }
}

/// Loads the latest completed checkpoint and feeds each registered hook its
/// state, in registration order.
pub(crate) async fn recover(
    store: Arc<dyn CheckpointRecoveryStore>,
    hooks: &MasterHookRegistry,
) -> Result<(Option<CompletedCheckpointMetadata>, RecoveryReport), CheckpointError> {
    let (latest, stored) = tokio::task::spawn_blocking(move || {
        anyhow::Ok((store.recover_latest()?, store.list_checkpoints()?))
    })
    .await
    .map_err(|err| CheckpointError::StoreUnavailable(anyhow!("recovery task failed: {err}")))?
    .map_err(CheckpointError::StoreUnavailable)?;

    let mut report = RecoveryReport::default();
    let Some(metadata) = latest else {
        info!("no completed checkpoint to recover, starting fresh");
        return Ok((None, report));
    };

    let checkpoint_id = metadata.checkpoint_id;
    report.retained_checkpoints = stored
        .into_iter()
        .filter(|id| *id <= checkpoint_id)
        .collect();
    info!(
        "recovering from checkpoint {} ({} task snapshots, {} hook states)",
        checkpoint_id,
        metadata.task_snapshots.len(),
        metadata.hook_states.len()
    );

    for identifier in metadata.hook_states.keys() {
        if !hooks.contains(identifier) {
            let orphan = CheckpointError::OrphanedHookState {
                checkpoint_id,
                identifier: identifier.clone(),
            };
            warn!("{}, skipping", orphan);
            report.orphaned_hook_states.push(identifier.clone());
        }
    }

    for hook in hooks.hooks_ordered() {
        let identifier = hook.identifier().to_string();
        match hook
            .restore_checkpoint(checkpoint_id, metadata.hook_state(&identifier))
            .await
        {
            Ok(()) => {
                debug!("restored master hook '{}'", identifier);
                report.restored_hooks.push(identifier);
            }
            Err(source) if hook.is_mandatory() => {
                error!(
                    "mandatory master hook '{}' failed to restore checkpoint {}: {:#}",
                    identifier, checkpoint_id, source
                );
                return Err(CheckpointError::HookRestore {
                    identifier,
                    checkpoint_id,
                    source,
                });
            }
            Err(err) => {
                warn!(
                    "optional master hook '{}' failed to restore checkpoint {}: {:#}",
                    identifier, checkpoint_id, err
                );
                report
                    .failed_optional_hooks
                    .push((identifier, format!("{err:#}")));
            }
        }
    }

    report.restored_checkpoint = Some(checkpoint_id);
    Ok((Some(metadata), report))
}
