//! Capability scanner
//!
//! Walks the exported types of the current plugin set and produces one
//! service descriptor per contract for every type carrying a recognized
//! service marker.

use std::collections::HashMap;

use glacier_kernel::{CapabilityId, CapabilitySet, DuplicatePolicy, ServiceKey};
use tracing::{debug, warn};

use super::loader::{PluginBinary, TypeRef};

/// Scanner errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("Contract {contract} is implemented by both {first} and {second}")]
    DuplicateCapabilityBinding {
        contract: ServiceKey,
        first: String,
        second: String,
    },
}

/// Instance lifetime of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// One instance per container
    Singleton,
}

/// Binding of a contract to a plugin implementation
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    contract: ServiceKey,
    marker: CapabilityId,
    lifetime: ServiceLifetime,
    implementation: TypeRef,
}

impl ServiceDescriptor {
    pub fn contract(&self) -> &ServiceKey {
        &self.contract
    }

    /// Recognized marker that selected the type
    pub fn marker(&self) -> &CapabilityId {
        &self.marker
    }

    pub fn lifetime(&self) -> ServiceLifetime {
        self.lifetime
    }

    pub fn implementation(&self) -> &TypeRef {
        &self.implementation
    }

    /// `assembly::Type` of the implementation
    pub fn qualified_name(&self) -> String {
        qualified(&self.implementation)
    }
}

fn qualified(implementation: &TypeRef) -> String {
    format!("{}::{}", implementation.assembly(), implementation.name())
}

/// Descriptors found in one scan, in discovery order
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<ServiceKey, usize>,
}

impl ServiceTable {
    pub fn get(&self, contract: &ServiceKey) -> Option<&ServiceDescriptor> {
        self.index.get(contract).map(|&i| &self.descriptors[i])
    }

    pub fn contains(&self, contract: &ServiceKey) -> bool {
        self.index.contains_key(contract)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter()
    }

    pub fn contracts(&self) -> Vec<ServiceKey> {
        self.descriptors.iter().map(|d| d.contract.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Scans plugin types for service markers
#[derive(Debug, Clone, Default)]
pub struct CapabilityScanner {
    markers: CapabilitySet,
    policy: DuplicatePolicy,
}

impl CapabilityScanner {
    pub fn new(markers: CapabilitySet, policy: DuplicatePolicy) -> Self {
        Self { markers, policy }
    }

    pub fn markers(&self) -> &CapabilitySet {
        &self.markers
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Scan every type of every binary, in enumeration order
    pub fn scan<'a, I>(&self, binaries: I) -> Result<ServiceTable, ScanError>
    where
        I: IntoIterator<Item = &'a PluginBinary>,
    {
        self.scan_types(binaries.into_iter().flat_map(|b| b.types()))
    }

    /// Scan a flat list of types
    pub fn scan_types<I>(&self, types: I) -> Result<ServiceTable, ScanError>
    where
        I: IntoIterator<Item = TypeRef>,
    {
        let mut table = ServiceTable::default();

        for implementation in types {
            let Some(marker) = self.markers.first_match(implementation.capabilities()).cloned()
            else {
                continue;
            };

            if !implementation.has_factory() {
                warn!(
                    "{} declares {} but cannot be instantiated, skipping",
                    qualified(&implementation),
                    marker
                );
                continue;
            }

            let contract = ServiceKey::new(implementation.contract());
            if let Some(existing) = table.get(&contract) {
                let first = existing.qualified_name();
                let second = qualified(&implementation);
                match self.policy {
                    DuplicatePolicy::FirstWins => {
                        debug!(
                            "Contract {} already bound to {}, ignoring {}",
                            contract, first, second
                        );
                        continue;
                    }
                    DuplicatePolicy::Reject => {
                        return Err(ScanError::DuplicateCapabilityBinding {
                            contract,
                            first,
                            second,
                        });
                    }
                }
            }

            debug!(
                "Binding {} -> {} ({})",
                contract,
                qualified(&implementation),
                marker
            );
            table.index.insert(contract.clone(), table.descriptors.len());
            table.descriptors.push(ServiceDescriptor {
                contract,
                marker,
                lifetime: ServiceLifetime::Singleton,
                implementation,
            });
        }

        Ok(table)
    }
}
