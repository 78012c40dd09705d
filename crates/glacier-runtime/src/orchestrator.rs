//! Host orchestrator
//!
//! Reacts to published plugin sets: installs the new container for the
//! handlers, subscribes the handlers on the first update only, and pushes the
//! current interaction command definitions to every guild.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use glacier_plugins::hot_reload::{HostServices, PluginSetUpdated, ServiceContainer};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::gateway::{
    CommandDispatcher, Gateway, GuildId, GuildSyncError, InteractionDispatcher,
};
use crate::handlers::{ContainerCell, InteractionHandler, MessageHandler};

/// Outcome of syncing command definitions to every guild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildSyncReport {
    pub synced: Vec<GuildId>,
    pub failed: Vec<GuildSyncError>,
}

impl GuildSyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What applying one update did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        generation: u64,
        subscribed: bool,
        guilds: GuildSyncReport,
    },
    /// Older than the installed container
    Stale { generation: u64, current: u64 },
}

/// Consumes plugin-set updates on behalf of the host
pub struct HostOrchestrator {
    gateway: Arc<dyn Gateway>,
    interactions: Arc<dyn InteractionDispatcher>,
    container: Arc<ContainerCell>,
    message_handler: Arc<MessageHandler>,
    interaction_handler: Arc<InteractionHandler>,
    subscribed: AtomicBool,
    applied: AtomicU64,
}

impl HostOrchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        commands: Arc<dyn CommandDispatcher>,
        interactions: Arc<dyn InteractionDispatcher>,
        host: HostServices,
        command_prefix: impl Into<String>,
    ) -> Self {
        let container = Arc::new(ContainerCell::new(Arc::new(ServiceContainer::empty(host))));
        let message_handler = Arc::new(MessageHandler::new(
            command_prefix,
            commands,
            container.clone(),
        ));
        let interaction_handler = Arc::new(InteractionHandler::new(
            interactions.clone(),
            container.clone(),
        ));

        Self {
            gateway,
            interactions,
            container,
            message_handler,
            interaction_handler,
            subscribed: AtomicBool::new(false),
            applied: AtomicU64::new(0),
        }
    }

    /// Container the handlers currently dispatch with
    pub fn current_container(&self) -> Arc<ServiceContainer> {
        self.container.current()
    }

    pub fn message_handler(&self) -> &Arc<MessageHandler> {
        &self.message_handler
    }

    pub fn interaction_handler(&self) -> &Arc<InteractionHandler> {
        &self.interaction_handler
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Generation of the last applied update, 0 before the first
    pub fn applied_generation(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Subscribe the handlers with the gateway; later calls do nothing
    pub fn subscribe_handlers(&self) -> bool {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.gateway
            .add_message_listener(self.message_handler.clone());
        self.gateway
            .add_interaction_listener(self.interaction_handler.clone());
        info!("Message and interaction handlers subscribed");
        true
    }

    /// Push interaction command definitions to every known guild, one task per guild
    pub async fn sync_guilds(&self) -> GuildSyncReport {
        let guilds = self.gateway.guilds().await;
        let mut join_set: JoinSet<(GuildId, Result<(), GuildSyncError>)> = JoinSet::new();

        for guild in guilds {
            let interactions = self.interactions.clone();
            join_set.spawn(async move {
                let result = interactions.register_commands_to_guild(guild).await;
                (guild, result)
            });
        }

        let mut report = GuildSyncReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((guild, Ok(()))) => {
                    debug!("Commands synced to guild {}", guild);
                    report.synced.push(guild);
                }
                Ok((guild, Err(e))) => {
                    warn!("Command sync for guild {} failed: {}", guild, e.reason);
                    report.failed.push(e);
                }
                Err(e) => warn!("Guild sync task failed: {}", e),
            }
        }

        report.synced.sort_unstable();
        report.failed.sort_by_key(|e| e.guild);
        report
    }

    /// Apply one published plugin set
    pub async fn apply(&self, update: PluginSetUpdated) -> ApplyOutcome {
        let current = self.applied_generation();
        if update.generation <= current {
            debug!(
                "Ignoring stale plugin set {} (current {})",
                update.generation, current
            );
            return ApplyOutcome::Stale {
                generation: update.generation,
                current,
            };
        }

        let previous = self.container.swap(update.container.clone());
        self.applied.store(update.generation, Ordering::Release);
        info!(
            "Installed plugin set {} ({} services, {} modules; replaced generation {})",
            update.generation,
            update.services.len(),
            update.registry.total_modules(),
            previous.generation()
        );

        let subscribed = self.subscribe_handlers();
        let guilds = self.sync_guilds().await;
        if !guilds.is_clean() {
            warn!(
                "{} of {} guild(s) failed command sync",
                guilds.failed.len(),
                guilds.failed.len() + guilds.synced.len()
            );
        }

        ApplyOutcome::Applied {
            generation: update.generation,
            subscribed,
            guilds,
        }
    }

    /// Consume updates until the channel closes
    pub async fn run(&self, mut updates: mpsc::Receiver<PluginSetUpdated>) {
        while let Some(update) = updates.recv().await {
            self.apply(update).await;
        }
        info!("Plugin-set update channel closed");
    }
}
