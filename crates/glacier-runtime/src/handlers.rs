//! Message and interaction handlers
//!
//! Both handlers read the current container on every dispatch, so swapping
//! the container after a rescan takes effect without resubscribing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use glacier_kernel::ServiceResolver;
use glacier_plugins::hot_reload::ServiceContainer;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::gateway::{
    CommandDispatcher, IncomingMessage, Interaction, InteractionDispatcher, InteractionListener,
    MessageListener,
};

/// The container handlers dispatch with
pub struct ContainerCell {
    current: RwLock<Arc<ServiceContainer>>,
}

impl ContainerCell {
    pub fn new(container: Arc<ServiceContainer>) -> Self {
        Self {
            current: RwLock::new(container),
        }
    }

    pub fn current(&self) -> Arc<ServiceContainer> {
        self.current.read().clone()
    }

    /// Install a new container, returning the previous one
    pub fn swap(&self, container: Arc<ServiceContainer>) -> Arc<ServiceContainer> {
        std::mem::replace(&mut *self.current.write(), container)
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation()
    }
}

/// Routes prefixed chat messages to the command dispatcher
pub struct MessageHandler {
    prefix: String,
    dispatcher: Arc<dyn CommandDispatcher>,
    container: Arc<ContainerCell>,
    dispatched: AtomicU64,
}

impl MessageHandler {
    pub fn new(
        prefix: impl Into<String>,
        dispatcher: Arc<dyn CommandDispatcher>,
        container: Arc<ContainerCell>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            dispatcher,
            container,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Byte offset where the command text starts, if `content` is a command
    pub fn command_position(&self, content: &str) -> Option<usize> {
        if self.prefix.is_empty() || !content.starts_with(&self.prefix) {
            return None;
        }
        Some(self.prefix.len())
    }

    /// Number of messages handed to the dispatcher
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageListener for MessageHandler {
    async fn on_message(&self, message: IncomingMessage) {
        if !message.from_user {
            return;
        }
        let Some(arg_pos) = self.command_position(&message.content) else {
            return;
        };

        info!("'{}' read as a command", message.content);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let services: Arc<dyn ServiceResolver> = self.container.current();
        if let Err(e) = self.dispatcher.execute(&message, arg_pos, services).await {
            warn!("Command '{}' failed: {}", message.content, e);
        }
    }
}

/// Routes slash-command interactions to the interaction dispatcher
pub struct InteractionHandler {
    dispatcher: Arc<dyn InteractionDispatcher>,
    container: Arc<ContainerCell>,
    dispatched: AtomicU64,
}

impl InteractionHandler {
    pub fn new(dispatcher: Arc<dyn InteractionDispatcher>, container: Arc<ContainerCell>) -> Self {
        Self {
            dispatcher,
            container,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InteractionListener for InteractionHandler {
    async fn on_interaction(&self, interaction: Interaction) {
        let command = match interaction {
            Interaction::SlashCommand(command) => command,
            other => {
                debug!("Ignoring non slash-command interaction: {:?}", other);
                return;
            }
        };

        info!("'{}' read as an interaction", command.name);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let services: Arc<dyn ServiceResolver> = self.container.current();
        if let Err(e) = self.dispatcher.execute(&command, services).await {
            warn!("Interaction '{}' failed: {}", command.name, e);
        }
    }
}
