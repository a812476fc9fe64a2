//! Durable side channel for completed checkpoint metadata.
//!
//! The coordinator only depends on [`CheckpointRecoveryStore`]; which variant
//! backs it is chosen by the hosting environment through
//! [`RecoveryStoreKind`].

use crate::checkpoint::CompletedCheckpointMetadata;
use crate::types::CheckpointId;
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

mod fs_store;
mod replicated;
mod standalone;

pub use fs_store::*;
pub use replicated::*;
pub use standalone::*;

/// Storage interface for completed checkpoint metadata.
///
/// `persist` is atomic: either the whole record becomes retrievable, or the
/// call fails and `recover_latest` never observes it.
pub trait CheckpointRecoveryStore: Send + Sync {
    fn persist(&self, metadata: &CompletedCheckpointMetadata) -> Result<()>;

    /// Most recently persisted checkpoint, or `None` if nothing was ever
    /// persisted.
    fn recover_latest(&self) -> Result<Option<CompletedCheckpointMetadata>>;

    fn load(&self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpointMetadata>>;

    /// Releases storage of a superseded checkpoint. Discarding an unknown id
    /// is not an error.
    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Ids of all retrievable checkpoints, ascending.
    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>>;

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Store selection for the hosting environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryStoreKind {
    /// Ephemeral, lives as long as the process.
    Standalone,
    /// One directory on a durable file system.
    Filesystem { path: PathBuf },
    /// One directory per replica; a write must reach a majority (or
    /// `quorum`, when given).
    Replicated {
        paths: Vec<PathBuf>,
        #[serde(default)]
        quorum: Option<usize>,
    },
}

impl RecoveryStoreKind {
    pub fn build(&self) -> Result<Arc<dyn CheckpointRecoveryStore>> {
        match self {
            Self::Standalone => Ok(Arc::new(StandaloneRecoveryStore::new())),
            Self::Filesystem { path } => Ok(Arc::new(FsRecoveryStore::new(path)?)),
            Self::Replicated { paths, quorum } => {
                let replicas = paths
                    .iter()
                    .map(|path| {
                        FsRecoveryStore::new(path)
                            .map(|store| Arc::new(store) as Arc<dyn CheckpointRecoveryStore>)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let store = match quorum {
                    Some(quorum) => ReplicatedRecoveryStore::with_quorum(replicas, *quorum)?,
                    None => ReplicatedRecoveryStore::new(replicas)?,
                };
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
