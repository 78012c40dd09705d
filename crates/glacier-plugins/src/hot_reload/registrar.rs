//! Module registrar
//!
//! Keeps, per subsystem and assembly, the handles the live subsystems handed
//! back, and brings them in line with the current plugin set: tracked modules
//! of an assembly are removed before its fresh module set is added.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use glacier_kernel::{ModuleHandle, ModuleSubsystem, ServiceResolver, SubsystemError, SubsystemKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::loader::PluginBinary;

/// Registrar errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistrarError {
    #[error("No {0} subsystem registered")]
    NoSubsystem(SubsystemKind),

    #[error("{kind} subsystem rejected modules of {assembly}: {source}")]
    Subsystem {
        kind: SubsystemKind,
        assembly: String,
        source: SubsystemError,
    },
}

/// Modules of one assembly registered with one subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub assembly: String,
    pub epoch: u64,
    pub kind: SubsystemKind,
    pub handles: Vec<ModuleHandle>,
}

impl ModuleDescriptor {
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.iter().map(|h| h.name.clone()).collect();
        names.sort();
        names
    }
}

/// Result of removing one module
#[derive(Debug, Clone)]
pub struct RemovalOutcome {
    pub handle: ModuleHandle,
    pub removed: bool,
    pub error: Option<SubsystemError>,
}

impl RemovalOutcome {
    pub fn is_failure(&self) -> bool {
        !self.removed
    }
}

/// What syncing one binary did
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub added: Vec<ModuleHandle>,
    pub removals: Vec<RemovalOutcome>,
    pub errors: Vec<RegistrarError>,
}

/// Serializable view of the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    entries: BTreeMap<SubsystemKind, BTreeMap<String, Vec<String>>>,
}

impl RegistrySnapshot {
    /// Module names registered for an assembly, sorted
    pub fn modules(&self, kind: SubsystemKind, assembly: &str) -> Option<&[String]> {
        self.entries
            .get(&kind)
            .and_then(|by_assembly| by_assembly.get(assembly))
            .map(|names| names.as_slice())
    }

    /// Assemblies with registered modules, sorted
    pub fn assemblies(&self, kind: SubsystemKind) -> Vec<&str> {
        self.entries
            .get(&kind)
            .map(|by_assembly| by_assembly.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every registered module name of a subsystem, sorted
    pub fn module_names(&self, kind: SubsystemKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .get(&kind)
            .map(|by_assembly| by_assembly.values().flatten().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn total_modules(&self) -> usize {
        self.entries
            .values()
            .flat_map(|by_assembly| by_assembly.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_modules() == 0
    }
}

/// Tracks registered modules and drives the live subsystems
pub struct ModuleRegistrar {
    subsystems: HashMap<SubsystemKind, Arc<dyn ModuleSubsystem>>,
    registry: HashMap<SubsystemKind, HashMap<String, ModuleDescriptor>>,
}

impl Default for ModuleRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistrar {
    pub fn new() -> Self {
        Self {
            subsystems: HashMap::new(),
            registry: HashMap::new(),
        }
    }

    /// Attach a subsystem; replaces any previous subsystem of the same kind
    pub fn with_subsystem(mut self, subsystem: Arc<dyn ModuleSubsystem>) -> Self {
        self.subsystems.insert(subsystem.kind(), subsystem);
        self
    }

    pub fn subsystem(&self, kind: SubsystemKind) -> Option<&Arc<dyn ModuleSubsystem>> {
        self.subsystems.get(&kind)
    }

    pub fn descriptor(&self, kind: SubsystemKind, assembly: &str) -> Option<&ModuleDescriptor> {
        self.registry.get(&kind).and_then(|m| m.get(assembly))
    }

    /// Assemblies that currently have modules registered with any subsystem
    pub fn tracked_assemblies(&self) -> HashSet<String> {
        self.registry
            .values()
            .flat_map(|by_assembly| by_assembly.keys().cloned())
            .collect()
    }

    /// Add a module set and track the handles as the assembly's entry
    pub async fn register_modules(
        &mut self,
        kind: SubsystemKind,
        binary: &PluginBinary,
        services: Arc<dyn ServiceResolver>,
    ) -> Result<Vec<ModuleHandle>, RegistrarError> {
        let subsystem = self
            .subsystems
            .get(&kind)
            .cloned()
            .ok_or(RegistrarError::NoSubsystem(kind))?;
        let modules = binary.module_types(kind);
        if modules.is_empty() {
            return Ok(Vec::new());
        }

        let assembly = binary.assembly_name().to_string();
        let handles = subsystem
            .add_modules(&assembly, modules, services)
            .await
            .map_err(|source| RegistrarError::Subsystem {
                kind,
                assembly: assembly.clone(),
                source,
            })?;

        info!(
            "Registered {} {} module(s) from {} (epoch {})",
            handles.len(),
            kind,
            assembly,
            binary.epoch()
        );

        self.registry.entry(kind).or_default().insert(
            assembly.clone(),
            ModuleDescriptor {
                assembly,
                epoch: binary.epoch(),
                kind,
                handles: handles.clone(),
            },
        );
        Ok(handles)
    }

    /// Remove every tracked module of an assembly from one subsystem
    ///
    /// The entry is dropped even when the subsystem refuses a removal.
    pub async fn unregister_modules(
        &mut self,
        kind: SubsystemKind,
        assembly: &str,
    ) -> Vec<RemovalOutcome> {
        let Some(descriptor) = self.registry.get_mut(&kind).and_then(|m| m.remove(assembly)) else {
            return Vec::new();
        };
        let Some(subsystem) = self.subsystems.get(&kind).cloned() else {
            return Vec::new();
        };

        let mut outcomes = Vec::with_capacity(descriptor.handles.len());
        for handle in descriptor.handles {
            let outcome = match subsystem.remove_module(&handle).await {
                Ok(true) => {
                    debug!("Removed {} module {} ({})", kind, handle.name, assembly);
                    RemovalOutcome {
                        handle,
                        removed: true,
                        error: None,
                    }
                }
                Ok(false) => {
                    warn!("{} subsystem refused to remove {} ({})", kind, handle.name, assembly);
                    RemovalOutcome {
                        handle,
                        removed: false,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("Failed to remove {} module {} ({}): {}", kind, handle.name, assembly, e);
                    RemovalOutcome {
                        handle,
                        removed: false,
                        error: Some(e),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Replace the registered modules of one binary in every subsystem
    pub async fn sync_binary(
        &mut self,
        binary: &PluginBinary,
        services: Arc<dyn ServiceResolver>,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let mut kinds: Vec<SubsystemKind> = self.subsystems.keys().copied().collect();
        kinds.sort();

        for kind in kinds {
            report
                .removals
                .extend(self.unregister_modules(kind, binary.assembly_name()).await);

            match self.register_modules(kind, binary, services.clone()).await {
                Ok(handles) => report.added.extend(handles),
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(e);
                }
            }
        }

        report
    }

    /// Remove every module of an assembly from every subsystem
    pub async fn retire_assembly(&mut self, assembly: &str) -> Vec<RemovalOutcome> {
        let mut outcomes = Vec::new();
        for kind in SubsystemKind::ALL {
            outcomes.extend(self.unregister_modules(kind, assembly).await);
        }
        if !outcomes.is_empty() {
            info!("Retired modules of {}", assembly);
        }
        outcomes
    }

    /// Retire every tracked assembly not in `live`
    pub async fn retain_assemblies(&mut self, live: &HashSet<String>) -> Vec<RemovalOutcome> {
        let mut stale: Vec<String> = self
            .tracked_assemblies()
            .into_iter()
            .filter(|assembly| !live.contains(assembly))
            .collect();
        stale.sort();

        let mut outcomes = Vec::new();
        for assembly in stale {
            outcomes.extend(self.retire_assembly(&assembly).await);
        }
        outcomes
    }

    /// Remove everything, for teardown
    pub async fn unregister_all(&mut self) -> Vec<RemovalOutcome> {
        let mut assemblies: Vec<String> = self.tracked_assemblies().into_iter().collect();
        assemblies.sort();

        let mut outcomes = Vec::new();
        for assembly in assemblies {
            outcomes.extend(self.retire_assembly(&assembly).await);
        }
        outcomes
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = self
            .registry
            .iter()
            .filter(|(_, by_assembly)| !by_assembly.is_empty())
            .map(|(kind, by_assembly)| {
                let assemblies = by_assembly
                    .iter()
                    .map(|(assembly, descriptor)| (assembly.clone(), descriptor.module_names()))
                    .collect();
                (*kind, assemblies)
            })
            .collect();
        RegistrySnapshot { entries }
    }
}
