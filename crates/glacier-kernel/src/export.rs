//! Plugin export table
//!
//! What a plugin binary hands to the host when it is loaded. A plugin crate
//! builds a [`PluginExports`] value and exposes it with [`declare_plugin!`].

use crate::capability::CapabilityId;
use crate::service::{ServiceFactory, ServiceInstance, ServiceResolver, ServiceError};
use std::fmt;
use std::sync::Arc;

/// Current plugin ABI version
pub const PLUGIN_API_VERSION: u32 = 1;

/// Symbol returning the ABI version a plugin was built against
pub const API_VERSION_SYMBOL: &[u8] = b"_glacier_plugin_api_version";

/// Symbol returning the boxed export table
pub const EXPORTS_SYMBOL: &[u8] = b"_glacier_plugin_exports";

/// A type exported by a plugin binary
#[derive(Clone)]
pub struct ExportedType {
    name: String,
    contract: Option<String>,
    capabilities: Vec<CapabilityId>,
    factory: Option<ServiceFactory>,
}

impl ExportedType {
    /// Create an export with no capabilities
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: None,
            capabilities: Vec::new(),
            factory: None,
        }
    }

    /// Export a command module
    pub fn command_module<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&dyn ServiceResolver) -> Result<ServiceInstance, ServiceError> + Send + Sync + 'static,
    {
        Self::new(name)
            .with_capability(CapabilityId::COMMAND_MODULE)
            .with_factory(factory)
    }

    /// Export an interaction module
    pub fn interaction_module<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&dyn ServiceResolver) -> Result<ServiceInstance, ServiceError> + Send + Sync + 'static,
    {
        Self::new(name)
            .with_capability(CapabilityId::INTERACTION_MODULE)
            .with_factory(factory)
    }

    /// Publish the type under a contract other than its own name
    pub fn with_contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    /// Declare a capability marker
    pub fn with_capability(mut self, capability: impl Into<CapabilityId>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Attach the instance factory
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&dyn ServiceResolver) -> Result<ServiceInstance, ServiceError> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Concrete type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Contract the type is bound under; defaults to its name
    pub fn contract(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }

    /// Declared capability markers, in declaration order
    pub fn capabilities(&self) -> &[CapabilityId] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &CapabilityId) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn factory(&self) -> Option<&ServiceFactory> {
        self.factory.as_ref()
    }
}

impl fmt::Debug for ExportedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedType")
            .field("name", &self.name)
            .field("contract", &self.contract())
            .field("capabilities", &self.capabilities)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Everything a plugin binary exports
#[derive(Debug, Clone)]
pub struct PluginExports {
    assembly_name: String,
    version: String,
    types: Vec<ExportedType>,
}

impl PluginExports {
    pub fn new(assembly_name: impl Into<String>) -> Self {
        Self {
            assembly_name: assembly_name.into(),
            version: "0.0.0".to_string(),
            types: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_type(mut self, exported: ExportedType) -> Self {
        self.types.push(exported);
        self
    }

    pub fn assembly_name(&self) -> &str {
        &self.assembly_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn types(&self) -> &[ExportedType] {
        &self.types
    }

    pub fn into_types(self) -> Vec<ExportedType> {
        self.types
    }
}

/// Expose a plugin's export table from a `cdylib`
///
/// ```rust,ignore
/// glacier_kernel::declare_plugin!(
///     glacier_kernel::PluginExports::new("weather")
///         .with_type(ExportedType::new("Forecast").with_capability(CapabilityId::SHARED_SERVICE))
/// );
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($exports:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _glacier_plugin_api_version() -> u32 {
            $crate::export::PLUGIN_API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _glacier_plugin_exports() -> *mut $crate::export::PluginExports {
            let exports: $crate::export::PluginExports = $exports;
            Box::into_raw(Box::new(exports))
        }
    };
}
