//! Module subsystem contracts
//!
//! The host owns the live command and interaction subsystems. The reload
//! pipeline only needs to add a module set for an assembly and remove the
//! handles it previously got back.

use crate::capability::CapabilityId;
use crate::service::{ServiceError, ServiceInstance, ServiceResolver};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Subsystem a module is registered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    /// Prefix-triggered text commands
    Command,
    /// Slash commands and component interactions
    Interaction,
}

impl SubsystemKind {
    pub const ALL: [SubsystemKind; 2] = [SubsystemKind::Command, SubsystemKind::Interaction];

    /// Marker a plugin type declares to be picked up by this subsystem
    pub fn marker(&self) -> CapabilityId {
        match self {
            SubsystemKind::Command => CapabilityId::COMMAND_MODULE,
            SubsystemKind::Interaction => CapabilityId::INTERACTION_MODULE,
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsystemKind::Command => f.write_str("command"),
            SubsystemKind::Interaction => f.write_str("interaction"),
        }
    }
}

/// A module instance and the guard keeping its code mapped
///
/// Subsystems hold on to the whole value while the module runs. Once the last
/// clone is gone the plugin binary the instance came from may be released.
#[derive(Clone)]
pub struct ModuleInstance {
    // Field order matters: the instance drops before its guard.
    instance: ServiceInstance,
    guard: Option<Arc<dyn Any + Send + Sync>>,
}

impl ModuleInstance {
    /// An instance whose code the host owns
    pub fn new(instance: ServiceInstance) -> Self {
        Self {
            instance,
            guard: None,
        }
    }

    /// An instance kept alive together with `guard`
    pub fn guarded(instance: ServiceInstance, guard: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            instance,
            guard: Some(guard),
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.instance.downcast_ref::<T>()
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("guarded", &self.is_guarded())
            .finish()
    }
}

/// Creates instances of one exported type
pub trait TypeActivator: Send + Sync {
    /// Instantiate the type, resolving its dependencies through `resolver`
    fn activate(&self, resolver: &dyn ServiceResolver) -> Result<ModuleInstance, ServiceError>;

    /// Whether the owning plugin binary is still loaded
    fn is_live(&self) -> bool;
}

/// A module type offered to a subsystem
#[derive(Clone)]
pub struct ModuleType {
    name: String,
    assembly: String,
    epoch: u64,
    kind: SubsystemKind,
    activator: Arc<dyn TypeActivator>,
}

impl ModuleType {
    pub fn new(
        name: impl Into<String>,
        assembly: impl Into<String>,
        epoch: u64,
        kind: SubsystemKind,
        activator: Arc<dyn TypeActivator>,
    ) -> Self {
        Self {
            name: name.into(),
            assembly: assembly.into(),
            epoch,
            kind,
            activator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    /// Load epoch of the binary the type came from
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Create a module instance
    pub fn activate(&self, resolver: &dyn ServiceResolver) -> Result<ModuleInstance, ServiceError> {
        self.activator.activate(resolver)
    }

    pub fn is_live(&self) -> bool {
        self.activator.is_live()
    }
}

impl fmt::Debug for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleType")
            .field("name", &self.name)
            .field("assembly", &self.assembly)
            .field("epoch", &self.epoch)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Handle to a module registered with a subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub id: Uuid,
    pub name: String,
    pub assembly: String,
    pub epoch: u64,
    pub kind: SubsystemKind,
}

impl ModuleHandle {
    /// Fresh handle for a module type
    pub fn for_module(module: &ModuleType) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: module.name().to_string(),
            assembly: module.assembly().to_string(),
            epoch: module.epoch(),
            kind: module.kind(),
        }
    }
}

/// Subsystem errors
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum SubsystemError {
    #[error("Module rejected: {0}")]
    Rejected(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Subsystem unavailable: {0}")]
    Unavailable(String),
}

/// A live host subsystem modules are registered with
#[async_trait::async_trait]
pub trait ModuleSubsystem: Send + Sync {
    /// Which subsystem this is
    fn kind(&self) -> SubsystemKind;

    /// Register the module types of one assembly, returning a handle per added module
    async fn add_modules(
        &self,
        assembly: &str,
        modules: Vec<ModuleType>,
        services: Arc<dyn ServiceResolver>,
    ) -> Result<Vec<ModuleHandle>, SubsystemError>;

    /// Remove a previously added module; `Ok(false)` when the subsystem refused
    async fn remove_module(&self, handle: &ModuleHandle) -> Result<bool, SubsystemError>;
}
