//! Glacier plugin host
//!
//! Loads plugin binaries from a watched directory, binds their service
//! capabilities into a dependency container and keeps the host's command and
//! interaction subsystems in sync with whatever is currently on disk.

pub mod hot_reload;

pub use glacier_kernel::{
    CapabilityId, CapabilitySet, DuplicatePolicy, ExportedType, ModuleHandle, ModuleSubsystem,
    ModuleType, PluginExports, ServiceError, ServiceKey, ServiceResolver, ServiceResolverExt,
    SubsystemError, SubsystemKind,
};
