//! Chat gateway seams
//!
//! The host's communication client sits behind these traits. The runtime only
//! needs to know the guilds, subscribe its handlers and hand commands to the
//! command and interaction services.

use std::sync::Arc;

use async_trait::async_trait;
use glacier_kernel::ServiceResolver;
use serde::{Deserialize, Serialize};

/// Guild (server) identifier
pub type GuildId = u64;

/// A chat message delivered by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub channel_id: u64,
    pub guild_id: Option<GuildId>,
    pub author: String,
    pub content: String,
    /// False for system and webhook messages
    pub from_user: bool,
}

impl IncomingMessage {
    pub fn from_user(channel_id: u64, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            guild_id: None,
            author: author.into(),
            content: content.into(),
            from_user: true,
        }
    }

    pub fn in_guild(mut self, guild_id: GuildId) -> Self {
        self.guild_id = Some(guild_id);
        self
    }
}

/// A slash-command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashCommand {
    pub name: String,
    pub guild_id: Option<GuildId>,
    pub user: String,
    pub options: Vec<(String, String)>,
}

/// Interactions delivered by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    SlashCommand(SlashCommand),
    Component { custom_id: String, user: String },
    Autocomplete { command: String, focused: String },
    ModalSubmit { custom_id: String, user: String },
}

/// Dispatch errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command failed: {0}")]
    Failed(String),
}

/// Guild command registration failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Command sync for guild {guild} failed: {reason}")]
pub struct GuildSyncError {
    pub guild: GuildId,
    pub reason: String,
}

/// Receives chat messages from the gateway
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: IncomingMessage);
}

/// Receives interactions from the gateway
#[async_trait]
pub trait InteractionListener: Send + Sync {
    async fn on_interaction(&self, interaction: Interaction);
}

/// The host's communication client
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Guilds the client is currently a member of
    async fn guilds(&self) -> Vec<GuildId>;

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>);

    fn add_interaction_listener(&self, listener: Arc<dyn InteractionListener>);
}

/// Executes prefix commands against the registered command modules
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Execute `message`, whose command text starts at byte `arg_pos`
    async fn execute(
        &self,
        message: &IncomingMessage,
        arg_pos: usize,
        services: Arc<dyn ServiceResolver>,
    ) -> Result<(), DispatchError>;
}

/// Executes slash commands and publishes command definitions
#[async_trait]
pub trait InteractionDispatcher: Send + Sync {
    async fn execute(
        &self,
        command: &SlashCommand,
        services: Arc<dyn ServiceResolver>,
    ) -> Result<(), DispatchError>;

    /// Publish the currently registered interaction modules to one guild
    async fn register_commands_to_guild(&self, guild: GuildId) -> Result<(), GuildSyncError>;
}
