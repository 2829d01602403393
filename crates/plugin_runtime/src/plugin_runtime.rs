//! Plugin Runtime - Loading and executing chat plugins
//!
//! This crate contains the pieces that turn a message tag into a finished
//! result:
//! - `ServiceRegistry` holds the named services plugins depend on
//! - `PluginLoader` resolves a tag to a script file or a native handler
//! - `PluginExecutor` runs each invocation on its own worker thread
//! - `ResultChannel` carries finished results back to the dispatcher

mod context;
mod discovery;
mod error;
mod executor;
mod loader;
mod outbound;
mod registry;
mod resources;
mod results;
pub mod script;
pub mod services;

pub use context::*;
pub use discovery::*;
pub use error::*;
pub use executor::*;
pub use loader::*;
pub use outbound::*;
pub use registry::*;
pub use resources::*;
pub use results::*;

pub use plugin_types;
