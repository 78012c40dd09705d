//! Glacier kernel
//!
//! Contracts shared by the plugin host and the plugins it loads:
//! - capability markers a plugin type declares to become host-managed
//! - the plugin-side export table and the `declare_plugin!` entry points
//! - service keys, instances and the resolver seam used by factories
//! - the module subsystem trait a host implements for command/interaction modules
//! - host configuration loading

// capability module
pub mod capability;
pub use capability::*;

// export module
pub mod export;
pub use export::*;

// service module
pub mod service;
pub use service::*;

// module subsystem contracts
pub mod module;
pub use module::*;

// configuration module
pub mod config;
