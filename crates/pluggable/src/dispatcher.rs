//! Command/Message Dispatcher
//!
//! One task owns the bot state and is the only writer to the transport and
//! the console. Everything else reaches it through its inbox: typed lines,
//! deferred result drains, replies to requests, and sends from plugins and
//! services. Server events arrive on a second channel fed by the transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use plugin_runtime::{
    CancelPolicy, CancelReport, DiscoveryReport, OutboundSink, PluginExecutor, PluginLoader, PluginResolver, PluginWatcher,
    ServiceRegistry, discover_services,
};
use plugin_types::{ExecutionId, Message, PluginExecutionRecord, PluginOutcome, PluginResult};

use crate::commands::{Command, HELP};
use crate::config::BotConfig;
use crate::console::{Console, StdoutConsole};
use crate::error::CommandError;
use crate::hooks::{BotHooks, NoHooks};
use crate::state::{BotState, ConnectionState, ReconnectAdvice};
use crate::transport::{EventSink, Transport, TransportEvent};

const RECENT_MESSAGES: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Work for the dispatcher task
#[derive(Debug)]
pub enum DispatchInput {
    /// A line typed by the user
    Command(String),
    /// Drain the result channel
    Drain,
    /// Reply to an earlier request; `None` if none arrived in time
    Ack { kind: AckKind, reply: Option<Value> },
    /// A plugin or service wants to send a chat message
    Outbound { channel: String, content: String },
    /// A plugin or service wants to emit a raw event
    Emit { event: String, data: Value },
    /// A cancel pass finished
    Cancelled(CancelReport),
    /// A `/discover` scan finished
    Discovered {
        dir: PathBuf,
        report: std::io::Result<DiscoveryReport>,
    },
    Shutdown,
}

/// What a pending request was for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    /// Active flag of a channel we just joined or switched to
    ChannelState(String),
    Info,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Outbound sink that routes through the dispatcher inbox
#[derive(Clone)]
pub struct InboxOutbound {
    inbox: mpsc::UnboundedSender<DispatchInput>,
}

impl OutboundSink for InboxOutbound {
    fn send_message(&self, channel_id: &str, content: &str) -> bool {
        self.inbox
            .send(DispatchInput::Outbound {
                channel: channel_id.to_string(),
                content: content.to_string(),
            })
            .is_ok()
    }

    fn emit(&self, event: &str, payload: Value) -> bool {
        self.inbox
            .send(DispatchInput::Emit {
                event: event.to_string(),
                data: payload,
            })
            .is_ok()
    }
}

/// Receiving ends handed to [`Dispatcher::run`]
pub struct DispatcherChannels {
    inbox: mpsc::UnboundedReceiver<DispatchInput>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Directory watcher that follows the development mode flag
#[derive(Default)]
struct HotReload {
    loader: Option<Arc<PluginLoader>>,
    watcher: Option<PluginWatcher>,
}

impl HotReload {
    fn sync(&mut self, dev_mode: bool) {
        let Some(loader) = &self.loader else {
            return;
        };

        if dev_mode && self.watcher.is_none() {
            match PluginWatcher::start(loader.clone()) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => tracing::warn!(
                    path = %loader.plugins_path().display(),
                    error = %e,
                    "Plugin watcher not started"
                ),
            }
        } else if !dev_mode && self.watcher.take().is_some() {
            tracing::info!("Stopped watching plugin directory");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    config: BotConfig,
    state: BotState,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn PluginResolver>,
    executor: PluginExecutor,
    registry: Arc<ServiceRegistry>,
    hooks: Arc<dyn BotHooks>,
    console: Arc<dyn Console>,
    inbox: mpsc::UnboundedSender<DispatchInput>,
    events: EventSink,
    cancel_policy: CancelPolicy,
    ack_timeout: Duration,
    hot_reload: HotReload,
}

impl Dispatcher {
    pub fn new(
        config: BotConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn PluginResolver>,
        executor: PluginExecutor,
        registry: Arc<ServiceRegistry>,
    ) -> (Self, DispatcherChannels) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        resolver.set_dev_mode(config.dev_mode);
        let cancel_policy = CancelPolicy {
            grace: config.cancel_grace(),
            ..CancelPolicy::default()
        };

        let dispatcher = Self {
            state: BotState::new(config.dev_mode),
            config,
            transport,
            resolver,
            executor,
            registry,
            hooks: Arc::new(NoHooks),
            console: Arc::new(StdoutConsole),
            inbox,
            events,
            cancel_policy,
            ack_timeout: Duration::from_secs(5),
            hot_reload: HotReload::default(),
        };
        let channels = DispatcherChannels {
            inbox: inbox_rx,
            events: events_rx,
        };
        (dispatcher, channels)
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn BotHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    /// Builder: watch the loader's directory while in development mode
    pub fn with_hot_reload(mut self, loader: Arc<PluginLoader>) -> Self {
        self.hot_reload.loader = Some(loader);
        self
    }

    /// Builder: how long to wait for a request's reply
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn inbox(&self) -> mpsc::UnboundedSender<DispatchInput> {
        self.inbox.clone()
    }

    /// Sink for services and script plugins
    pub fn outbound_sink(&self) -> Arc<dyn OutboundSink> {
        Arc::new(InboxOutbound {
            inbox: self.inbox.clone(),
        })
    }

    /// Connect and process inputs until `/exit` or shutdown
    pub async fn run(mut self, channels: DispatcherChannels) {
        let DispatcherChannels {
            inbox: mut inbox_rx,
            events: mut events_rx,
        } = channels;
        let results = self.executor.results().clone();

        self.hot_reload.sync(self.state.dev_mode);
        self.console.line(&format!("Starting {}", self.config.bot_name));
        self.console.line(&format!("Connecting to {}", self.config.server_url));
        self.connect();
        self.show_prompt();

        loop {
            let flow = tokio::select! {
                input = inbox_rx.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => Flow::Exit,
                },
                Some(event) = events_rx.recv() => {
                    self.handle_event(event);
                    Flow::Continue
                }
                _ = results.notified() => {
                    self.drain_results();
                    Flow::Continue
                }
            };

            if flow == Flow::Exit {
                break;
            }
        }

        self.shutdown().await;
    }

    fn handle_input(&mut self, input: DispatchInput) -> Flow {
        match input {
            DispatchInput::Command(line) => {
                let flow = self.process_line(&line);
                if flow == Flow::Continue {
                    self.show_prompt();
                }
                return flow;
            }
            DispatchInput::Drain => self.drain_results(),
            DispatchInput::Ack { kind, reply } => self.handle_ack(kind, reply),
            DispatchInput::Outbound { channel, content } => {
                if let Err(e) = self.send_to_channel(&channel, &content) {
                    self.console.line(&e.to_string());
                }
            }
            DispatchInput::Emit { event, data } => {
                self.emit(&event, data);
            }
            DispatchInput::Cancelled(report) => {
                if report.resources == 0 {
                    self.console.line("Nothing to cancel");
                } else {
                    self.console.line(&format!("Cancelled {} resource(s)", report.resources));
                }
                if !report.failures.is_empty() {
                    self.console
                        .line(&format!("{} cancellation step(s) failed", report.failures.len()));
                }
            }
            DispatchInput::Discovered { dir, report } => self.show_discovery(&dir, report),
            DispatchInput::Shutdown => return Flow::Exit,
        }
        Flow::Continue
    }

    fn show_prompt(&self) {
        self.console.prompt(&self.state.prompt(&self.config.bot_name));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn connect(&mut self) {
        self.state.connection = ConnectionState::Connecting;
        let transport = self.transport.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.connect(events).await {
                tracing::warn!(error = %e, "Connect failed");
            }
        });
    }

    fn emit(&self, event: &str, data: Value) -> bool {
        match self.transport.emit(event, data) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(event, error = %e, "Emit failed");
                false
            }
        }
    }

    /// Emit a request and feed its reply back through the inbox
    fn request(&self, event: &str, data: Value, kind: AckKind) {
        let reply = match self.transport.request(event, data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(event, error = %e, "Request failed");
                return;
            }
        };

        let inbox = self.inbox.clone();
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            let reply = match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(value)) => Some(value),
                _ => None,
            };
            let _ = inbox.send(DispatchInput::Ack { kind, reply });
        });
    }

    fn require_connected(&self, action: &'static str) -> Result<(), CommandError> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(CommandError::NotConnected(action))
        }
    }

    fn send_to_channel(&self, channel: &str, content: &str) -> Result<(), CommandError> {
        self.require_connected("send message")?;
        if self.state.is_channel_inactive(channel) {
            return Err(CommandError::ChannelInactive(channel.to_string()));
        }
        self.emit("message", json!({ "channelId": channel, "content": content }));
        self.console.line(&format!("You sent: {}", content));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    fn process_line(&mut self, line: &str) -> Flow {
        let Some(command) = Command::parse(line) else {
            return Flow::Continue;
        };
        match self.process_command(command) {
            Ok(flow) => flow,
            Err(e) => {
                self.console.line(&e.to_string());
                Flow::Continue
            }
        }
    }

    fn process_command(&mut self, command: Command) -> Result<Flow, CommandError> {
        match command {
            Command::Join(channel) => {
                let channel = channel.unwrap_or_else(|| self.config.default_channel.clone());
                self.require_connected("join channel")?;
                self.emit("join_channel", json!(channel));
                self.state.current_channel = Some(channel.clone());
                self.request("get_channel_details", json!(channel), AckKind::ChannelState(channel.clone()));
                self.console.line(&format!("Joining channel: {}", channel));
            }

            Command::Leave => {
                let channel = self.state.current_channel.clone().ok_or(CommandError::NoChannel)?;
                self.require_connected("leave channel")?;
                self.emit("leave_channel", json!(channel));
                self.console.line(&format!("Leaving channel: {}", channel));
                self.state.current_channel = None;
            }

            Command::Start(channel) => {
                self.require_connected("start channel")?;
                let channel = channel
                    .or_else(|| self.state.current_channel.clone())
                    .unwrap_or_else(|| self.config.default_channel.clone());
                self.emit("start_channel", json!(channel));
                self.state.current_channel = Some(channel.clone());
                self.state.set_channel_active(channel.clone(), true);
                self.console.line(&format!("Starting channel: {}", channel));
            }

            Command::Stop => {
                let channel = self.state.current_channel.clone().ok_or(CommandError::NoChannel)?;
                self.require_connected("stop channel")?;
                self.emit("stop_channel", json!(channel));
                self.state.set_channel_active(channel.clone(), false);
                self.console.line(&format!("Stopping channel: {}", channel));
            }

            Command::Channel(None) => {
                let current = self.state.current_channel.clone();
                self.console
                    .line(&format!("Current channel: {}", current.as_deref().unwrap_or("None")));
                if let Some(channel) = current {
                    let status = if self.state.is_channel_active(&channel) { "Active" } else { "Inactive" };
                    self.console.line(&format!("Channel status: {}", status));
                }
            }

            Command::Channel(Some(channel)) => {
                self.state.current_channel = Some(channel.clone());
                if self.state.is_connected() {
                    self.request("get_channel_details", json!(channel), AckKind::ChannelState(channel.clone()));
                }
                self.console.line(&format!("Switched to channel: {}", channel));
            }

            Command::Reconnect => {
                if self.state.is_connected() {
                    return Err(CommandError::AlreadyConnected);
                }
                if self.transport.is_connecting() {
                    return Err(CommandError::AlreadyConnecting);
                }
                self.console.line("Attempting to reconnect to server...");
                self.connect();
            }

            Command::Info => {
                let channel = self.state.current_channel.clone().ok_or(CommandError::NoChannel)?;
                self.require_connected("get channel info")?;
                self.request("get_channel_details", json!(channel), AckKind::Info);
            }

            Command::Messages => {
                let channel = self.state.current_channel.clone().ok_or(CommandError::NoChannel)?;
                self.require_connected("get messages")?;
                self.request("get_channel_messages", json!(channel), AckKind::Messages);
            }

            Command::Mode => {
                self.state.dev_mode = !self.state.dev_mode;
                self.resolver.set_dev_mode(self.state.dev_mode);
                self.hot_reload.sync(self.state.dev_mode);
                let mode = if self.state.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" };
                self.console.line(&format!("Switched to {} mode", mode));
            }

            Command::Reload => {
                if !self.state.dev_mode {
                    self.console.line("Plugin reloading is only available in development mode");
                    self.console.line("Use /mode to switch to development mode");
                    return Ok(Flow::Continue);
                }
                let report = self.resolver.reload_all();
                for (path, error) in &report.failed {
                    self.console
                        .line(&format!("Error reloading {}: {}", path.display(), error));
                }
                self.console.line(&format!("Reloaded {} plugins", report.reloaded));
            }

            Command::Plugins => self.show_plugins(),

            Command::Discover(dir) => {
                let dir = dir.unwrap_or_else(|| self.config.services_path.clone());
                self.discover(&dir)?;
            }

            Command::Help => {
                self.console.line("Available commands:");
                for line in HELP {
                    self.console.line(line);
                }
                for line in self.hooks.custom_help() {
                    self.console.line(&line);
                }
                self.console.line("To send a message, just type it and press enter");
            }

            Command::Exit => return Ok(Flow::Exit),

            Command::Custom { name, args } => {
                if !self.hooks.handle_custom_command(&name, &args, self.console.as_ref()) {
                    return Err(CommandError::Unknown(name));
                }
            }

            Command::Say(text) => {
                let channel = self
                    .state
                    .current_channel
                    .clone()
                    .ok_or(CommandError::NoChannelForMessage)?;
                self.send_to_channel(&channel, &text)?;
            }
        }

        Ok(Flow::Continue)
    }

    fn show_plugins(&self) {
        let stats = self.state.plugin_stats();
        self.console.line("Plugin Status:");
        self.console.line(&format!("- Active: {}", stats.active));
        self.console.line(&format!("- Completed: {}", stats.completed));
        self.console.line(&format!("- Errors: {}", stats.error));
        self.console.line(&format!("- Total: {}", stats.total));

        if stats.active > 0 {
            self.console.line("Currently running plugins:");
            for (name, secs) in self.state.running_executions(Utc::now()) {
                self.console.line(&format!("- {} (running for {:.2}s)", name, secs));
            }
        }
    }

    /// Scan off the dispatcher task; the report comes back through the inbox
    fn discover(&self, dir: &Path) -> Result<(), CommandError> {
        if !dir.is_dir() {
            return Err(CommandError::MissingDirectory(dir.to_path_buf()));
        }

        self.console
            .line(&format!("Discovering services in: {}", dir.display()));
        let registry = self.registry.clone();
        let inbox = self.inbox.clone();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let report = discover_services(&registry, &dir);
            let _ = inbox.send(DispatchInput::Discovered { dir, report });
        });
        Ok(())
    }

    fn show_discovery(&self, dir: &Path, report: std::io::Result<DiscoveryReport>) {
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Service discovery failed");
                self.console
                    .line(&CommandError::MissingDirectory(dir.to_path_buf()).to_string());
                return;
            }
        };

        for name in &report.registered {
            self.console.line(&format!("Loaded service: {}", name));
        }
        for (name, error) in &report.failed {
            self.console
                .line(&format!("Error loading service {}: {}", name, error));
        }
        self.console
            .line(&format!("Discovered {} services", report.count()));
    }

    fn handle_ack(&mut self, kind: AckKind, reply: Option<Value>) {
        let Some(data) = reply else {
            tracing::warn!(?kind, "No reply from server");
            return;
        };

        match kind {
            AckKind::ChannelState(channel) => {
                if let Some(active) = data.get("active").and_then(Value::as_bool) {
                    self.state.set_channel_active(channel.clone(), active);
                    let status = if active { "active" } else { "inactive" };
                    self.console.line(&format!("Channel {} is {}", channel, status));
                }
            }

            AckKind::Info => {
                let channel = field(&data, "channelId");
                let active = data.get("active").and_then(Value::as_bool);
                self.console.line(&format!("Channel: {}", channel));
                let status = if active.unwrap_or(false) { "Active" } else { "Inactive" };
                self.console.line(&format!("Status: {}", status));
                if let Some(active) = active.filter(|_| !channel.is_empty()) {
                    self.state.set_channel_active(channel, active);
                }
                self.console
                    .line(&format!("Participants: {}", participant_count(&data)));
                let count = data
                    .get("messageCount")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "unknown".to_string());
                self.console.line(&format!("Message count: {}", count));
            }

            AckKind::Messages => {
                self.console.line(&format!("Channel: {}", field(&data, "channelId")));
                let messages = data
                    .get("messages")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                self.console.line(&format!("Message count: {}", messages.len()));
                if !messages.is_empty() {
                    self.console.line("Recent messages:");
                    let recent = &messages[messages.len().saturating_sub(RECENT_MESSAGES)..];
                    for message in recent {
                        self.console.line(&format!(
                            "[{}] {}: {}",
                            clock_time(message.get("timestamp")),
                            field(message, "senderName"),
                            field(message, "content")
                        ));
                    }
                }
            }
        }

        self.show_prompt();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server events
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.state.set_connected();
                self.console.line("Connected to server");
                self.emit(
                    "register",
                    json!({
                        "botId": self.config.bot_id,
                        "name": self.config.bot_name,
                        "type": self.config.bot_type,
                    }),
                );
                self.console.line(&format!(
                    "Registered as {} ({})",
                    self.config.bot_name, self.config.bot_id
                ));
                self.hooks.on_connect();
            }

            TransportEvent::Disconnected { reason } => {
                self.state.set_disconnected();
                tracing::info!(reason = ?reason, "Disconnected from server");
                self.console.line("Disconnected from server");
                self.hooks.on_disconnect();
            }

            TransportEvent::Reconnecting => {
                self.state.connection = ConnectionState::Connecting;
                self.console.line("Connection lost, reconnecting...");
            }

            TransportEvent::ConnectError(error) => {
                let advice = self.state.record_connect_error(self.config.max_reconnect_attempts);
                self.console.line(&format!("Connection error: {}", error));
                match advice {
                    ReconnectAdvice::Retrying { attempt, max } => {
                        self.console
                            .line(&format!("Reconnection attempt {}/{}...", attempt, max));
                    }
                    ReconnectAdvice::Exhausted { max } => {
                        self.state.set_disconnected();
                        self.console
                            .line(&format!("Failed to connect after {} attempts.", max));
                        self.console
                            .line("Use /reconnect to try again or check server status.");
                    }
                }
                self.hooks.on_connect_error(&error);
            }

            TransportEvent::Event { name, data } => self.handle_server_event(&name, data),
        }

        self.show_prompt();
    }

    fn handle_server_event(&mut self, name: &str, data: Value) {
        match name {
            "new_message" => self.handle_new_message(data),

            "channel_status" => {
                let channel = field(&data, "channelId");
                let active = data.get("active").and_then(Value::as_bool).unwrap_or(false);
                let status = if active { "active" } else { "inactive" };
                self.console
                    .line(&format!("Channel status: {} ({})", channel, status));
                self.console
                    .line(&format!("Participants: {}", participant_count(&data)));
                if !channel.is_empty() {
                    self.state.set_channel_active(channel, active);
                }
                self.hooks.on_channel_status(&data);
            }

            "participant_joined" => {
                self.console.line(&format!(
                    "Participant joined: {} ({})",
                    field(&data, "name"),
                    field(&data, "participantId")
                ));
            }

            "participant_left" => {
                let who = match field(&data, "name") {
                    "" => field(&data, "participantId"),
                    display => display,
                };
                self.console.line(&format!("Participant left: {}", who));
            }

            "channel_started" | "channel_stopped" => {
                let channel = field(&data, "channelId");
                let started = name == "channel_started";
                let verb = if started { "started" } else { "stopped" };
                self.console.line(&format!("Channel {}: {}", verb, channel));
                if !channel.is_empty() {
                    self.state.set_channel_active(channel, started);
                }
            }

            "bot_registered" => {
                self.console.line(&format!(
                    "Bot registered: {} ({})",
                    field(&data, "name"),
                    field(&data, "botId")
                ));
                let channel = self
                    .config
                    .autojoin_channel
                    .clone()
                    .unwrap_or_else(|| self.config.default_channel.clone());
                if let Err(e) = self.process_command(Command::Join(Some(channel))) {
                    self.console.line(&e.to_string());
                }
                self.hooks.on_bot_registered(&data);
            }

            "control_command" => self.handle_control_command(data),

            other => tracing::debug!("Ignoring server event {}", other),
        }
    }

    fn handle_new_message(&mut self, data: Value) {
        let message = match Message::from_value(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed message");
                return;
            }
        };

        if message.sender_id == self.config.bot_id {
            return;
        }
        self.console
            .line(&format!("{}: {}", message.sender_name, message.content));

        if self.state.is_channel_inactive(&message.channel_id) {
            tracing::debug!(channel = %message.channel_id, "Channel inactive, message not handled");
            return;
        }

        let message = message.enriched();
        if message.has_tags() {
            for tag in &message.tags {
                self.dispatch_plugin(tag, &message);
            }
            self.schedule_drain();
        } else if let Some(reply) = self.hooks.on_message(&message) {
            if let Err(e) = self.send_to_channel(&message.channel_id, &reply) {
                self.console.line(&e.to_string());
            }
        }
    }

    fn dispatch_plugin(&mut self, tag: &str, message: &Message) {
        let plugin = match self.resolver.resolve(tag) {
            Ok(plugin) => plugin,
            Err(e) if e.is_not_found() => {
                tracing::debug!(error = %e, "Plugin lookup failed");
                self.console
                    .line(&format!("Plugin '{}_handler' does not exist.", tag));
                return;
            }
            Err(e) => {
                let name = format!("{}_handler", tag);
                tracing::warn!(plugin = %name, error = %e, "Failed to load plugin");
                let id = ExecutionId::generate(&name);
                self.state
                    .begin_execution(id.clone(), PluginExecutionRecord::started(name.clone()));
                self.executor.results().push(PluginResult::new(
                    name,
                    id,
                    message.channel_id.clone(),
                    PluginOutcome::Failed(e.to_string()),
                ));
                return;
            }
        };

        let name = plugin.name.clone();
        let id = ExecutionId::generate(&name);
        self.state
            .begin_execution(id.clone(), PluginExecutionRecord::started(name.clone()));
        tracing::info!(plugin = %name, execution = %id, "Dispatching plugin");

        if let Err(e) = self.executor.spawn(plugin, message.clone(), id.clone()) {
            tracing::error!(plugin = %name, error = %e, "Failed to start plugin");
            self.executor.results().push(PluginResult::new(
                name,
                id,
                message.channel_id.clone(),
                PluginOutcome::Failed(e.to_string()),
            ));
        }
    }

    fn schedule_drain(&self) {
        let inbox = self.inbox.clone();
        let delay = self.config.result_drain_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(DispatchInput::Drain);
        });
    }

    fn drain_results(&mut self) {
        let results = self.executor.results().drain();
        if results.is_empty() {
            return;
        }

        for result in results {
            let payload = result.display_payload();
            let elapsed = self
                .state
                .finish_execution(&result)
                .map(|record| record.elapsed_secs(Utc::now()));

            let line = match elapsed {
                Some(secs) if result.outcome.is_success() => {
                    format!("Plugin '{}' completed in {:.2}s: {}", result.plugin_name, secs, payload)
                }
                Some(secs) => {
                    format!("Plugin '{}' failed after {:.2}s: {}", result.plugin_name, secs, payload)
                }
                None => format!("Plugin '{}' result: {}", result.plugin_name, payload),
            };
            self.console.line(&line);

            if self.state.current_channel.is_some() && !payload.is_empty() {
                if let Err(e) = self.send_to_channel(&result.channel_id, &payload) {
                    self.console.line(&e.to_string());
                }
            }
        }

        self.show_prompt();
    }

    fn handle_control_command(&mut self, data: Value) {
        self.console.line(&format!("Control command: {}", data));

        if let Some(target) = data.get("targetId").and_then(Value::as_str) {
            if target != self.config.bot_id {
                tracing::debug!(target_id = %target, "Control command for another bot");
                return;
            }
        }

        match field(&data, "command") {
            "cancel" => {
                let resources = self.executor.resources().clone();
                let policy = self.cancel_policy;
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let report = resources.cancel_all(policy).await;
                    let _ = inbox.send(DispatchInput::Cancelled(report));
                });
            }
            other => tracing::info!("Unhandled control command {}", other),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        if let Some(channel) = self.state.current_channel.take() {
            if self.state.is_connected() {
                self.emit("leave_channel", json!(channel));
            }
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                tracing::debug!(error = %e, "Disconnect failed");
            }
        }
        self.state.set_disconnected();
        self.hot_reload.sync(false);

        self.console.line("Exiting bot");
    }
}

/// A string field, or `""` when absent
fn field<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn participant_count(data: &Value) -> usize {
    data.get("participants")
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

/// Local `HH:MM:SS` of a millisecond epoch timestamp
fn clock_time(timestamp: Option<&Value>) -> String {
    timestamp
        .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|ms| ms as i64)))
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}
