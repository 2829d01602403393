//! Bot Hooks
//!
//! Behaviour a concrete bot customizes without touching the dispatcher. All
//! hooks run on the dispatcher task, so they should return quickly.

use plugin_types::Message;
use serde_json::Value;

use crate::console::Console;

pub trait BotHooks: Send + Sync {
    /// Handle an untagged message; a returned reply goes to the message's channel
    fn on_message(&self, _message: &Message) -> Option<String> {
        None
    }

    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_connect_error(&self, _error: &str) {}

    fn on_channel_status(&self, _data: &Value) {}

    fn on_bot_registered(&self, _data: &Value) {}

    /// Try an unrecognized slash command; `true` if it was handled
    fn handle_custom_command(&self, _name: &str, _args: &[String], _console: &dyn Console) -> bool {
        false
    }

    /// Extra `/help` lines for custom commands
    fn custom_help(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl BotHooks for NoHooks {}

/// Replies to every untagged message with `Echo: <content>`
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHooks;

impl BotHooks for EchoHooks {
    fn on_message(&self, message: &Message) -> Option<String> {
        Some(format!("Echo: {}", message.content))
    }

    fn handle_custom_command(&self, name: &str, args: &[String], console: &dyn Console) -> bool {
        if name != "echo" {
            return false;
        }
        console.line(&args.join(" "));
        true
    }

    fn custom_help(&self) -> Vec<String> {
        vec!["/echo <text> - Print text locally".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;

    #[test]
    fn test_echo_hooks() {
        let hooks = EchoHooks;
        let message = Message::new("alice", "general", "hi");
        assert_eq!(hooks.on_message(&message), Some("Echo: hi".to_string()));

        let console = BufferConsole::new();
        assert!(hooks.handle_custom_command("echo", &["a".into(), "b".into()], &console));
        assert!(!hooks.handle_custom_command("dance", &[], &console));
        assert_eq!(console.lines(), vec!["a b".to_string()]);
    }

    #[test]
    fn test_no_hooks_reply_nothing() {
        assert_eq!(NoHooks.on_message(&Message::new("alice", "general", "hi")), None);
        assert!(NoHooks.custom_help().is_empty());
    }
}
