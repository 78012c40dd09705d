//! Service keys, instances and the resolver seam
//!
//! Plugin factories receive a [`ServiceResolver`] so they can pull their own
//! dependencies out of the container the host built for the current rescan.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A resolved service instance
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Factory producing a service or module instance
pub type ServiceFactory =
    Arc<dyn Fn(&dyn ServiceResolver) -> Result<ServiceInstance, ServiceError> + Send + Sync>;

/// Contract identity a service is bound under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Key for a host-side Rust type
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(std::any::type_name::<T>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Service resolution errors
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("No binding for service: {0}")]
    NotRegistered(ServiceKey),

    #[error("Service {key} is not of the requested type {expected}")]
    TypeMismatch { key: ServiceKey, expected: String },

    #[error("Circular dependency detected: {}", format_chain(.0))]
    CircularDependency(Vec<ServiceKey>),

    #[error("Owning plugin binary of {0} has been unloaded")]
    ContextUnloaded(String),

    #[error("Type {0} does not provide a factory")]
    NoFactory(String),

    #[error("Service construction failed: {0}")]
    ConstructionFailed(String),
}

fn format_chain(chain: &[ServiceKey]) -> String {
    chain
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Resolves services by key
pub trait ServiceResolver: Send + Sync {
    /// Resolve an untyped instance
    fn resolve_any(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceError>;

    /// Check whether a binding exists
    fn contains(&self, key: &ServiceKey) -> bool;
}

/// Typed helpers on top of [`ServiceResolver`]
pub trait ServiceResolverExt {
    /// Resolve and downcast
    fn resolve<T: Any + Send + Sync>(&self, key: &ServiceKey) -> Result<Arc<T>, ServiceError>;

    /// Resolve a host singleton registered under [`ServiceKey::of`]
    fn resolve_host<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ServiceError> {
        self.resolve::<T>(&ServiceKey::of::<T>())
    }
}

impl<R: ServiceResolver + ?Sized> ServiceResolverExt for R {
    fn resolve<T: Any + Send + Sync>(&self, key: &ServiceKey) -> Result<Arc<T>, ServiceError> {
        self.resolve_any(key)?
            .downcast::<T>()
            .map_err(|_| ServiceError::TypeMismatch {
                key: key.clone(),
                expected: std::any::type_name::<T>().to_string(),
            })
    }
}
