//! Checkpoint aggregation state and the records exchanged around it.

use crate::error::{AbortReason, CheckpointError};
use crate::types::{CheckpointId, EventTime, SnapshotHandle, TaskId};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tokio::time::Instant;

mod events;
mod metadata;
mod pending;

pub use events::*;
pub use metadata::*;
pub use pending::*;

#[cfg(test)]
#[path = "tests/checkpoint_tests.rs"]
mod tests;
