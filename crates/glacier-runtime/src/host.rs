//! Plugin host wiring
//!
//! Connects the hot-reload manager to the orchestrator: the manager publishes
//! plugin sets, the orchestrator installs them.

use std::sync::Arc;

use glacier_kernel::config::PluginHostConfig;
use glacier_kernel::{ModuleSubsystem, ServiceKey};
use glacier_plugins::hot_reload::{
    BinaryLoader, HostServices, HotReloadConfig, HotReloadManager, ModuleRegistrar,
    NativeBinaryLoader, ReloadError, RemovalOutcome,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::gateway::{CommandDispatcher, Gateway, InteractionDispatcher};
use crate::orchestrator::HostOrchestrator;

/// Host errors
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error("Plugin-set updates already consumed")]
    UpdatesTaken,
}

/// Host-side collaborators
pub struct HostParts {
    pub gateway: Arc<dyn Gateway>,
    pub commands: Arc<dyn CommandDispatcher>,
    pub interactions: Arc<dyn InteractionDispatcher>,
    pub subsystems: Vec<Arc<dyn ModuleSubsystem>>,
    /// Extra host singletons (file-backed stores and the like)
    pub services: HostServices,
}

/// A running plugin host
///
/// The gateway and both dispatchers are registered as host services under
/// `ServiceKey::of::<dyn Trait>()`, each stored as an `Arc<dyn Trait>`.
pub struct PluginHost {
    manager: Arc<HotReloadManager>,
    orchestrator: Arc<HostOrchestrator>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl PluginHost {
    /// Build a host loading native shared libraries
    pub fn native(config: &PluginHostConfig, parts: HostParts) -> Result<Self, HostError> {
        let backend = Arc::new(NativeBinaryLoader::new().map_err(ReloadError::from)?);
        Ok(Self::with_backend(config, parts, backend))
    }

    /// Build a host loading binaries through `backend`
    pub fn with_backend(
        config: &PluginHostConfig,
        parts: HostParts,
        backend: Arc<dyn BinaryLoader>,
    ) -> Self {
        let HostParts {
            gateway,
            commands,
            interactions,
            subsystems,
            services,
        } = parts;

        let services = services
            .with_keyed(ServiceKey::of::<dyn Gateway>(), Arc::new(gateway.clone()))
            .with_keyed(
                ServiceKey::of::<dyn CommandDispatcher>(),
                Arc::new(commands.clone()),
            )
            .with_keyed(
                ServiceKey::of::<dyn InteractionDispatcher>(),
                Arc::new(interactions.clone()),
            );

        let registrar = subsystems
            .into_iter()
            .fold(ModuleRegistrar::new(), |registrar, subsystem| {
                registrar.with_subsystem(subsystem)
            });

        let manager = Arc::new(HotReloadManager::new(
            HotReloadConfig::from_host(config),
            backend,
            services.clone(),
            registrar,
        ));
        let orchestrator = Arc::new(HostOrchestrator::new(
            gateway,
            commands,
            interactions,
            services,
            config.command_prefix.clone(),
        ));

        Self {
            manager,
            orchestrator,
            runner: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<HotReloadManager> {
        &self.manager
    }

    pub fn orchestrator(&self) -> &Arc<HostOrchestrator> {
        &self.orchestrator
    }

    /// Start consuming updates, then start watching
    pub async fn start(&self) -> Result<(), HostError> {
        let updates = self
            .manager
            .take_update_receiver()
            .ok_or(HostError::UpdatesTaken)?;

        let orchestrator = self.orchestrator.clone();
        *self.runner.lock().await = Some(tokio::spawn(async move {
            orchestrator.run(updates).await;
        }));

        self.manager.start().await?;
        info!("Plugin host started");
        Ok(())
    }

    /// Stop the manager and tear everything down
    pub async fn stop(&self) -> Vec<RemovalOutcome> {
        let outcomes = self.manager.stop().await;
        if let Some(runner) = self.runner.lock().await.take() {
            runner.abort();
        }
        info!("Plugin host stopped");
        outcomes
    }
}
