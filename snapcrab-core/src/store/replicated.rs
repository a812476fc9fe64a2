use super::*;

/// Recovery store replicated over several member stores.
///
/// A checkpoint counts as persisted once `quorum` members hold it. A persist
/// that cannot reach quorum is rolled back on the members that accepted it
/// and fails. Recovery only returns checkpoints found on at least `quorum`
/// members, so a write that never reached quorum (even if its rollback
/// failed) is never recovered.
pub struct ReplicatedRecoveryStore {
    replicas: Vec<Arc<dyn CheckpointRecoveryStore>>,
    quorum: usize,
}

impl ReplicatedRecoveryStore {
    /// Majority quorum over `replicas`.
    pub fn new(replicas: Vec<Arc<dyn CheckpointRecoveryStore>>) -> Result<Self> {
        let quorum = replicas.len() / 2 + 1;
        Self::with_quorum(replicas, quorum)
    }

    pub fn with_quorum(
        replicas: Vec<Arc<dyn CheckpointRecoveryStore>>,
        quorum: usize,
    ) -> Result<Self> {
        if replicas.is_empty() {
            bail!("replicated recovery store needs at least one replica");
        }
        if quorum == 0 || quorum > replicas.len() {
            bail!(
                "quorum {} is out of range for {} replicas",
                quorum,
                replicas.len()
            );
        }
        // Two quorums must overlap, otherwise recovery could miss a write.
        if quorum * 2 <= replicas.len() {
            bail!(
                "quorum {} does not form a majority of {} replicas",
                quorum,
                replicas.len()
            );
        }
        Ok(Self { replicas, quorum })
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Ids held by at least `quorum` members, ascending.
    fn quorum_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let mut counts: BTreeMap<CheckpointId, usize> = BTreeMap::new();
        let mut reachable = 0;
        for (idx, replica) in self.replicas.iter().enumerate() {
            match replica.list_checkpoints() {
                Ok(ids) => {
                    reachable += 1;
                    for id in ids {
                        *counts.entry(id).or_default() += 1;
                    }
                }
                Err(err) => tracing::warn!("replica {} unreachable: {:#}", idx, err),
            }
        }
        if reachable < self.quorum {
            bail!(
                "only {} of {} replicas reachable, quorum is {}",
                reachable,
                self.replicas.len(),
                self.quorum
            );
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count >= self.quorum)
            .map(|(id, _)| id)
            .collect())
    }
}

impl CheckpointRecoveryStore for ReplicatedRecoveryStore {
    fn persist(&self, metadata: &CompletedCheckpointMetadata) -> Result<()> {
        let mut accepted = Vec::with_capacity(self.replicas.len());
        let mut last_error = None;
        for (idx, replica) in self.replicas.iter().enumerate() {
            match replica.persist(metadata) {
                Ok(()) => accepted.push(idx),
                Err(err) => {
                    tracing::warn!(
                        "replica {} rejected checkpoint {}: {:#}",
                        idx,
                        metadata.checkpoint_id,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        if accepted.len() >= self.quorum {
            return Ok(());
        }

        for idx in accepted.iter().copied() {
            if let Err(err) = self.replicas[idx].discard(metadata.checkpoint_id) {
                tracing::warn!(
                    "rollback of checkpoint {} on replica {} failed: {:#}",
                    metadata.checkpoint_id,
                    idx,
                    err
                );
            }
        }
        let cause = last_error.unwrap_or_else(|| anyhow!("no replica accepted the write"));
        Err(cause.context(format!(
            "checkpoint {} reached {} of {} replicas, quorum is {}",
            metadata.checkpoint_id,
            accepted.len(),
            self.replicas.len(),
            self.quorum
        )))
    }

    fn recover_latest(&self) -> Result<Option<CompletedCheckpointMetadata>> {
        for checkpoint_id in self.quorum_checkpoints()?.into_iter().rev() {
            if let Some(metadata) = self.load(checkpoint_id)? {
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    fn load(&self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpointMetadata>> {
        for (idx, replica) in self.replicas.iter().enumerate() {
            match replica.load(checkpoint_id) {
                Ok(Some(metadata)) => return Ok(Some(metadata)),
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    "replica {} failed to load checkpoint {}: {:#}",
                    idx,
                    checkpoint_id,
                    err
                ),
            }
        }
        Ok(None)
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let mut failures = 0;
        for (idx, replica) in self.replicas.iter().enumerate() {
            if let Err(err) = replica.discard(checkpoint_id) {
                failures += 1;
                tracing::warn!(
                    "replica {} failed to discard checkpoint {}: {:#}",
                    idx,
                    checkpoint_id,
                    err
                );
            }
        }
        if failures > 0 {
            bail!(
                "discard of checkpoint {} failed on {} replicas",
                checkpoint_id,
                failures
            );
        }
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        self.quorum_checkpoints()
    }

    fn shutdown(&self) -> Result<()> {
        for replica in &self.replicas {
            replica.shutdown()?;
        }
        Ok(())
    }
}
