//! Slash Commands
//!
//! Parsing only. The dispatcher decides what each command does.

use std::path::PathBuf;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(Option<String>),
    Leave,
    Start(Option<String>),
    Stop,
    Channel(Option<String>),
    Reconnect,
    Info,
    Messages,
    Mode,
    Reload,
    Plugins,
    Discover(Option<PathBuf>),
    Help,
    Exit,
    /// Unrecognized `/name args...`, offered to the hooks
    Custom { name: String, args: Vec<String> },
    /// Plain text for the current channel
    Say(String),
}

impl Command {
    /// Parse one input line; blank lines give `None`
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Say(line.to_string()));
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default().to_lowercase();
        let args: Vec<String> = parts.map(str::to_string).collect();
        let first = args.first().cloned();

        let command = match name.as_str() {
            "join" => Command::Join(first),
            "leave" => Command::Leave,
            "start" => Command::Start(first),
            "stop" => Command::Stop,
            "channel" => Command::Channel(first),
            "reconnect" => Command::Reconnect,
            "info" => Command::Info,
            "messages" => Command::Messages,
            "mode" => Command::Mode,
            "reload" => Command::Reload,
            "plugins" => Command::Plugins,
            "discover" => Command::Discover(first.map(PathBuf::from)),
            "help" => Command::Help,
            "exit" | "quit" => Command::Exit,
            _ => Command::Custom { name, args },
        };
        Some(command)
    }
}

/// Built-in command help, one entry per line
pub const HELP: &[&str] = &[
    "/join [channel] - Join a channel (default channel if omitted)",
    "/leave - Leave the current channel",
    "/start [channel] - Start a channel",
    "/stop - Stop the current channel",
    "/channel [channel] - Show or switch the current channel",
    "/info - Show details of the current channel",
    "/messages - Show recent messages in the current channel",
    "/reconnect - Reconnect to the server",
    "/mode - Toggle between development and production mode",
    "/reload - Reload all plugins (development mode only)",
    "/plugins - Show plugin execution status",
    "/discover [directory] - Discover and register services",
    "/help - Show this help",
    "/exit - Exit the bot",
];
