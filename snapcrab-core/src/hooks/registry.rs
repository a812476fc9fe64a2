use super::*;

/// Registered master hooks of one job, in registration order.
///
/// Owned by exactly one coordinator; there is no process-wide registry.
#[derive(Default, Clone)]
pub struct MasterHookRegistry {
    hooks: Vec<Arc<dyn MasterHook>>,
    index: HashMap<String, usize>,
}

impl MasterHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiates every factory once, in order.
    ///
    /// A factory that cannot be resolved, fails to create its hook, or yields
    /// an identifier that is already taken is reported in the returned error
    /// list; the remaining hooks are still registered.
    pub fn from_factories(
        factories: &[SerializedHookFactory],
        resolver: &dyn HookResolver,
    ) -> (Self, Vec<CheckpointError>) {
        let mut registry = Self::new();
        let mut errors = Vec::new();
        for factory in factories {
            let registered =
                instantiate_hook(factory, resolver).and_then(|hook| registry.register(hook));
            if let Err(err) = registered {
                tracing::warn!(
                    "skipping master hook from factory '{}': {}",
                    factory.type_name,
                    err
                );
                errors.push(err);
            }
        }
        (registry, errors)
    }

    pub fn register(&mut self, hook: Arc<dyn MasterHook>) -> Result<(), CheckpointError> {
        let identifier = hook.identifier().to_string();
        if self.index.contains_key(&identifier) {
            return Err(CheckpointError::DuplicateIdentifier(identifier));
        }
        self.index.insert(identifier, self.hooks.len());
        self.hooks.push(hook);
        Ok(())
    }

    pub fn with_hook(mut self, hook: Arc<dyn MasterHook>) -> Result<Self, CheckpointError> {
        self.register(hook)?;
        Ok(self)
    }

    /// Hooks in registration order. Each call starts a fresh iteration.
    pub fn hooks_ordered(&self) -> impl Iterator<Item = &Arc<dyn MasterHook>> + '_ {
        self.hooks.iter()
    }

    pub fn get(&self, identifier: &str) -> Option<&Arc<dyn MasterHook>> {
        self.index.get(identifier).map(|&pos| &self.hooks[pos])
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.hooks
            .iter()
            .map(|h| h.identifier().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for MasterHookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHookRegistry")
            .field("hooks", &self.identifiers())
            .finish()
    }
}
