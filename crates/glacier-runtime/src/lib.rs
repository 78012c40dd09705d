//! Glacier runtime
//!
//! Host-side glue around the plugin pipeline: the chat gateway seams, the
//! message and interaction handlers, the orchestrator that installs each
//! published plugin set, and logging setup.

pub mod gateway;
pub mod handlers;
pub mod host;
pub mod logging;
pub mod orchestrator;

pub use gateway::{
    CommandDispatcher, DispatchError, Gateway, GuildId, GuildSyncError, IncomingMessage,
    Interaction, InteractionDispatcher, InteractionListener, MessageListener, SlashCommand,
};
pub use handlers::{ContainerCell, InteractionHandler, MessageHandler};
pub use host::{HostError, HostParts, PluginHost};
pub use logging::{LoggingError, init_logging};
pub use orchestrator::{ApplyOutcome, GuildSyncReport, HostOrchestrator};
