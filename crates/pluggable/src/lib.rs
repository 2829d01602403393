//! Pluggable - Socket chat bot with a plugin pipeline
//!
//! - `transport` talks to the chat server (WebSocket or in-memory)
//! - `dispatcher` owns the bot state and routes server events, typed
//!   commands and plugin results
//! - `bot` assembles everything from a [`BotConfig`]
//!
//! Plugin loading and execution live in `plugin_runtime`.

pub mod bot;
pub mod commands;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod state;
pub mod transport;

pub use bot::{Bot, BotBuilder, BotHandle};
pub use config::{BotConfig, ConfigOverrides};
pub use console::{BufferConsole, Console, StdoutConsole};
pub use error::{CommandError, ConfigError, ConnectionError, ConnectionResult};
pub use hooks::{BotHooks, EchoHooks, NoHooks};
