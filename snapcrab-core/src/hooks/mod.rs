//! Master hooks: coordinator-side participants in the checkpoint protocol.
//!
//! A master hook captures state that lives outside of any task (for example
//! the offsets an external source has handed out) when a checkpoint is
//! triggered, and gets that state back when the coordinator recovers.
//!
//! Hooks reach the coordinator as [`SerializedHookFactory`] values inside the
//! job's checkpointing settings. A [`HookResolver`] plays the role of the
//! job-specific type loader: it turns a serialized factory into a live
//! [`MasterHookFactory`], or reports that the type is not available.

use crate::error::CheckpointError;
use crate::types::{CheckpointId, EventTime};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

mod registry;

pub use registry::*;

/// Coordinator-side checkpoint participant.
///
/// Trigger and restore may perform I/O against external systems; the
/// coordinator always calls them outside of its decision loop.
#[async_trait]
pub trait MasterHook: Send + Sync {
    /// Identifier, unique within a job. State in completed checkpoints is
    /// keyed by it.
    fn identifier(&self) -> &str;

    /// A failing mandatory hook aborts the checkpoint; a failing optional
    /// hook is skipped.
    fn is_mandatory(&self) -> bool {
        true
    }

    /// Captures the hook's state for `checkpoint_id`. `None` means the hook
    /// has nothing to store for this checkpoint.
    async fn trigger_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
    ) -> Result<Option<Vec<u8>>>;

    /// Restores the state captured for `checkpoint_id`. `state` is `None`
    /// when the checkpoint holds nothing for this hook.
    async fn restore_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        state: Option<&[u8]>,
    ) -> Result<()>;

    /// Releases resources when the coordinator shuts down.
    fn close(&self) {}
}

/// Produces the hook instance for one coordinator lifetime.
pub trait MasterHookFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn MasterHook>>;
}

/// A hook factory in its transportable form: a type name the resolver
/// understands plus the factory's encoded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedHookFactory {
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl SerializedHookFactory {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }

    /// Encodes a serde-serializable factory configuration.
    pub fn encode<T: Serialize>(type_name: impl Into<String>, config: &T) -> Result<Self> {
        let payload = bincode::serialize(config).context("serialize hook factory failed")?;
        Ok(Self::new(type_name, payload))
    }
}

/// Turns serialized factories into live ones.
pub trait HookResolver: Send + Sync {
    fn resolve(&self, factory: &SerializedHookFactory) -> Result<Box<dyn MasterHookFactory>>;
}

type FactoryDecoder = Box<dyn Fn(&[u8]) -> Result<Box<dyn MasterHookFactory>> + Send + Sync>;

/// Resolver backed by an explicit table of known factory types.
#[derive(Default)]
pub struct TypeRegistryResolver {
    decoders: HashMap<String, FactoryDecoder>,
}

impl TypeRegistryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, decoder: F)
    where
        F: Fn(&[u8]) -> Result<Box<dyn MasterHookFactory>> + Send + Sync + 'static,
    {
        self.decoders.insert(type_name.into(), Box::new(decoder));
    }

    pub fn with_type<F>(mut self, type_name: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Box<dyn MasterHookFactory>> + Send + Sync + 'static,
    {
        self.register(type_name, decoder);
        self
    }

    pub fn knows(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }
}

impl HookResolver for TypeRegistryResolver {
    fn resolve(&self, factory: &SerializedHookFactory) -> Result<Box<dyn MasterHookFactory>> {
        let decoder = self.decoders.get(&factory.type_name).ok_or_else(|| {
            anyhow!(
                "hook factory type '{}' is not available to this job",
                factory.type_name
            )
        })?;
        decoder(&factory.payload)
            .with_context(|| format!("decode hook factory '{}' failed", factory.type_name))
    }
}

/// Resolves and instantiates one serialized factory, mapping every failure
/// to [`CheckpointError::HookInstantiation`].
pub fn instantiate_hook(
    factory: &SerializedHookFactory,
    resolver: &dyn HookResolver,
) -> Result<Arc<dyn MasterHook>, CheckpointError> {
    resolver
        .resolve(factory)
        .and_then(|f| f.create())
        .map_err(|err| CheckpointError::HookInstantiation {
            factory: factory.type_name.clone(),
            message: format!("{err:#}"),
        })
}

#[cfg(test)]
#[path = "tests/hooks_tests.rs"]
mod tests;
