//! Bot Errors

use std::path::PathBuf;

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("Failed to connect after {attempts} attempts: {message}")]
    ConnectFailed { attempts: u32, message: String },

    #[error("Invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("A connection attempt is already in progress")]
    InProgress,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Invalid(Box::new(e))
    }
}

/// A command that cannot run in the current state
///
/// The `Display` text is exactly what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Not connected to server. Cannot {0}.")]
    NotConnected(&'static str),

    #[error("Error: Not in a channel")]
    NoChannel,

    #[error("Error: Not in a channel. Join a channel first with /join [channel]")]
    NoChannelForMessage,

    #[error("Cannot send message: Channel {0} is inactive.")]
    ChannelInactive(String),

    #[error("Already connected to server.")]
    AlreadyConnected,

    #[error("Already connecting to server.")]
    AlreadyConnecting,

    #[error("Services directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("Unknown command: {0}")]
    Unknown(String),
}
