//! # SnapCrab Core
//!
//! Checkpoint coordination for distributed dataflow jobs.
//!
//! A single coordinator triggers consistent snapshots across the tasks of a
//! job, lets master hooks capture coordinator-side state, folds task
//! acknowledgments into pending checkpoints, persists completed ones through
//! a recovery store and recovers the latest of them on restart.
//!
//! - [`types`]: identifiers and opaque snapshot handles.
//! - [`error`]: [`CheckpointError`](error::CheckpointError),
//!   [`AbortReason`](error::AbortReason) and trigger rejections.
//! - [`config`]: [`CheckpointConfig`](config::CheckpointConfig) and the
//!   serialized [`JobCheckpointingSettings`](config::JobCheckpointingSettings).
//! - [`hooks`]: [`MasterHook`](hooks::MasterHook), hook factories and the
//!   [`MasterHookRegistry`](hooks::MasterHookRegistry).
//! - [`checkpoint`]: [`PendingCheckpoint`](checkpoint::PendingCheckpoint) and
//!   [`CompletedCheckpointMetadata`](checkpoint::CompletedCheckpointMetadata).
//! - [`store`]: [`CheckpointRecoveryStore`](store::CheckpointRecoveryStore)
//!   and its standalone, file-system and replicated variants.
//! - [`gateway`]: the coordinator -> task transport.
//! - [`coordinator`]: the [`CheckpointCoordinator`](coordinator::CheckpointCoordinator).

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod store;
pub mod types;
