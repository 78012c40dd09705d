//! Hot-reload plugin support module
//!
//! - Directory watching with debounced rescan requests
//! - Isolated loading of plugin binaries, one context per binary
//! - Capability scanning into service descriptors
//! - Per-rescan dependency containers
//! - Module registration diffing against the live subsystems

mod container;
mod loader;
mod manager;
mod native;
mod registrar;
mod scanner;
mod watcher;

pub use container::{ContainerBuilder, HostServices, MAX_RESOLUTION_DEPTH, ServiceContainer};
pub use loader::{
    BinaryLoader, LoadContext, LoadFailure, LoadOutcome, LoadedImage, PluginBinary,
    PluginLoadError, PluginLoader, PluginPattern, TypeRef,
};
pub use manager::{
    BinarySummary, HotReloadConfig, HotReloadManager, PluginSetUpdated, ReloadError, ReloadEvent,
    RescanReport,
};
pub use native::NativeBinaryLoader;
pub use registrar::{
    ModuleDescriptor, ModuleRegistrar, RegistrarError, RegistrySnapshot, RemovalOutcome,
    SyncReport,
};
pub use scanner::{CapabilityScanner, ScanError, ServiceDescriptor, ServiceLifetime, ServiceTable};
pub use watcher::{PluginWatcher, WatchConfig, WatcherError};
