use super::*;

/// In-memory recovery store for tests and single-process execution.
///
/// Survives coordinator restarts within one process (share the `Arc`), not
/// process restarts.
#[derive(Debug, Default)]
pub struct StandaloneRecoveryStore {
    checkpoints: Mutex<BTreeMap<CheckpointId, CompletedCheckpointMetadata>>,
}

impl StandaloneRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<CheckpointId, CompletedCheckpointMetadata>>>
    {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow!("recovery store lock poisoned"))
    }
}

impl CheckpointRecoveryStore for StandaloneRecoveryStore {
    fn persist(&self, metadata: &CompletedCheckpointMetadata) -> Result<()> {
        self.guard()?
            .insert(metadata.checkpoint_id, metadata.clone());
        Ok(())
    }

    fn recover_latest(&self) -> Result<Option<CompletedCheckpointMetadata>> {
        Ok(self
            .guard()?
            .last_key_value()
            .map(|(_, metadata)| metadata.clone()))
    }

    fn load(&self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpointMetadata>> {
        Ok(self.guard()?.get(&checkpoint_id).cloned())
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.guard()?.remove(&checkpoint_id);
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        Ok(self.guard()?.keys().copied().collect())
    }
}
