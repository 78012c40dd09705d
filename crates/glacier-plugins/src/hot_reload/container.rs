//! Dependency container
//!
//! Rebuilt on every rescan: the host singletons plus one singleton binding per
//! scanned service descriptor. Plugin instances are created lazily on first
//! resolution and cached for the lifetime of the container.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use glacier_kernel::{ServiceError, ServiceInstance, ServiceKey, ServiceResolver};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::loader::{LoadContext, TypeRef};
use super::scanner::ServiceTable;

/// Deepest dependency chain followed before giving up
pub const MAX_RESOLUTION_DEPTH: usize = 64;

/// Host-provided singletons copied into every container
#[derive(Clone, Default)]
pub struct HostServices {
    entries: HashMap<ServiceKey, ServiceInstance>,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host singleton under [`ServiceKey::of`]
    pub fn with<T: Any + Send + Sync>(mut self, instance: Arc<T>) -> Self {
        self.entries.insert(ServiceKey::of::<T>(), instance);
        self
    }

    /// Register a host singleton under an explicit key
    pub fn with_keyed(mut self, key: impl Into<ServiceKey>, instance: ServiceInstance) -> Self {
        self.insert(key, instance);
        self
    }

    pub fn insert(&mut self, key: impl Into<ServiceKey>, instance: ServiceInstance) {
        self.entries.insert(key.into(), instance);
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// A cached plugin instance and the context its code lives in
struct CachedInstance {
    // Must drop before the guard.
    instance: ServiceInstance,
    _guard: Arc<LoadContext>,
}

enum Binding {
    Host(ServiceInstance),
    Plugin {
        implementation: TypeRef,
        cached: Mutex<Option<CachedInstance>>,
    },
}

/// Builds a [`ServiceContainer`] from host services and a scan result
pub struct ContainerBuilder {
    host: HostServices,
    generation: u64,
}

impl ContainerBuilder {
    pub fn new(host: HostServices) -> Self {
        Self {
            host,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn build(self, table: &ServiceTable) -> ServiceContainer {
        let mut bindings: HashMap<ServiceKey, Binding> = self
            .host
            .entries
            .into_iter()
            .map(|(key, instance)| (key, Binding::Host(instance)))
            .collect();

        for descriptor in table.iter() {
            if bindings.contains_key(descriptor.contract()) {
                warn!(
                    "{} would shadow a host service, skipping",
                    descriptor.qualified_name()
                );
                continue;
            }
            bindings.insert(
                descriptor.contract().clone(),
                Binding::Plugin {
                    implementation: descriptor.implementation().clone(),
                    cached: Mutex::new(None),
                },
            );
        }

        debug!(
            "Built service container generation {} with {} bindings",
            self.generation,
            bindings.len()
        );

        ServiceContainer {
            generation: self.generation,
            bindings,
        }
    }
}

/// Immutable set of bindings for one plugin-set generation
pub struct ServiceContainer {
    generation: u64,
    bindings: HashMap<ServiceKey, Binding>,
}

impl ServiceContainer {
    /// Container with host services only
    pub fn empty(host: HostServices) -> Self {
        ContainerBuilder::new(host).build(&ServiceTable::default())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.bindings.keys()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether a plugin singleton has been created yet
    pub fn is_instantiated(&self, key: &ServiceKey) -> bool {
        match self.bindings.get(key) {
            Some(Binding::Host(_)) => true,
            Some(Binding::Plugin { cached, .. }) => cached.lock().is_some(),
            None => false,
        }
    }

    fn resolve_in(
        &self,
        key: &ServiceKey,
        scope: &ResolutionScope<'_>,
    ) -> Result<ServiceInstance, ServiceError> {
        let binding = self
            .bindings
            .get(key)
            .ok_or_else(|| ServiceError::NotRegistered(key.clone()))?;

        let (implementation, cached) = match binding {
            Binding::Host(instance) => return Ok(instance.clone()),
            Binding::Plugin {
                implementation,
                cached,
            } => (implementation, cached),
        };

        if let Some(existing) = cached.lock().as_ref() {
            return Ok(existing.instance.clone());
        }

        // Construct outside the lock; the factory may resolve other bindings.
        scope.enter(key)?;
        let created = implementation.activate_guarded(scope);
        scope.leave();
        let (instance, guard) = created?;

        let mut slot = cached.lock();
        match slot.as_ref() {
            Some(existing) => Ok(existing.instance.clone()),
            None => {
                debug!("Created {} from {}", key, implementation.assembly());
                *slot = Some(CachedInstance {
                    instance: instance.clone(),
                    _guard: guard,
                });
                Ok(instance)
            }
        }
    }
}

impl ServiceResolver for ServiceContainer {
    fn resolve_any(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceError> {
        let scope = ResolutionScope {
            container: self,
            stack: Mutex::new(Vec::new()),
        };
        self.resolve_in(key, &scope)
    }

    fn contains(&self, key: &ServiceKey) -> bool {
        self.bindings.contains_key(key)
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("generation", &self.generation)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Resolver handed to factories during one top-level resolution
struct ResolutionScope<'a> {
    container: &'a ServiceContainer,
    stack: Mutex<Vec<ServiceKey>>,
}

impl ResolutionScope<'_> {
    fn enter(&self, key: &ServiceKey) -> Result<(), ServiceError> {
        let mut stack = self.stack.lock();
        if stack.contains(key) {
            let mut chain = stack.clone();
            chain.push(key.clone());
            return Err(ServiceError::CircularDependency(chain));
        }
        if stack.len() >= MAX_RESOLUTION_DEPTH {
            return Err(ServiceError::ConstructionFailed(format!(
                "maximum resolution depth exceeded at {}",
                key
            )));
        }
        stack.push(key.clone());
        Ok(())
    }

    fn leave(&self) {
        self.stack.lock().pop();
    }
}

impl ServiceResolver for ResolutionScope<'_> {
    fn resolve_any(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceError> {
        self.container.resolve_in(key, self)
    }

    fn contains(&self, key: &ServiceKey) -> bool {
        self.container.contains(key)
    }
}
