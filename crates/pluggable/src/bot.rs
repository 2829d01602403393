//! Bot Assembly
//!
//! Wires the registry, loader, executor, transport and dispatcher together.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use plugin_runtime::services::{ConfigService, QueueManager, register_builtins};
use plugin_runtime::{
    HandlerTable, OutboundSlot, PluginExecutor, PluginLoader, PluginResolver, ResultChannel, ServiceRegistry,
    discover_services,
};

use crate::config::BotConfig;
use crate::console::{Console, StdoutConsole};
use crate::dispatcher::{DispatchInput, Dispatcher, DispatcherChannels};
use crate::hooks::{BotHooks, NoHooks};
use crate::transport::{Transport, WebSocketTransport, socket_url};

pub struct BotBuilder {
    config: BotConfig,
    hooks: Arc<dyn BotHooks>,
    console: Arc<dyn Console>,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn PluginResolver>>,
    table: HandlerTable,
    service_config: Option<ConfigService>,
}

impl BotBuilder {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            hooks: Arc::new(NoHooks),
            console: Arc::new(StdoutConsole),
            transport: None,
            resolver: None,
            table: HandlerTable::with_builtins(),
            service_config: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn BotHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    /// Builder: use this transport instead of a WebSocket to `server_url`
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builder: native handlers for the default loader
    pub fn with_handler_table(mut self, table: HandlerTable) -> Self {
        self.table = table;
        self
    }

    /// Builder: replace the default loader entirely
    pub fn with_resolver(mut self, resolver: Arc<dyn PluginResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builder: values for the `config` service (default: from the environment)
    pub fn with_service_config(mut self, config: ConfigService) -> Self {
        self.service_config = Some(config);
        self
    }

    pub fn build(self) -> anyhow::Result<Bot> {
        let config = self.config;

        let registry = Arc::new(ServiceRegistry::new());
        let service_config = self.service_config.unwrap_or_else(ConfigService::from_env);
        let queue = QueueManager::new().with_downstream(config.downstream_bots.clone());
        register_builtins(&registry, service_config, queue);

        if config.services_path.is_dir() {
            let report = discover_services(&registry, &config.services_path)
                .with_context(|| format!("Failed to scan {}", config.services_path.display()))?;
            tracing::info!("Registered {} startup services", report.count());
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let url = socket_url(&config.server_url, &config.socket_path)?;
                Arc::new(WebSocketTransport::new(url, config.max_reconnect_attempts)) as Arc<dyn Transport>
            }
        };

        let outbound = OutboundSlot::new();
        let executor = PluginExecutor::new(registry.clone(), ResultChannel::new())
            .with_outbound(outbound.clone())
            .with_teardown_timeout(config.teardown_timeout());

        // Only the built-in loader can be watched
        let (resolver, loader) = match self.resolver {
            Some(resolver) => (resolver, None),
            None => {
                let loader = Arc::new(
                    PluginLoader::new(config.plugins_path.clone())
                        .with_table(self.table)
                        .with_dev_mode(config.dev_mode),
                );
                (loader.clone() as Arc<dyn PluginResolver>, Some(loader))
            }
        };

        let (dispatcher, channels) = Dispatcher::new(config, transport, resolver, executor, registry.clone());
        let mut dispatcher = dispatcher.with_hooks(self.hooks).with_console(self.console);
        if let Some(loader) = loader {
            dispatcher = dispatcher.with_hot_reload(loader);
        }

        let sink = dispatcher.outbound_sink();
        registry.set_outbound(sink.clone());
        outbound.attach(sink);

        Ok(Bot { dispatcher, channels })
    }
}

/// A bot ready to run
pub struct Bot {
    dispatcher: Dispatcher,
    channels: DispatcherChannels,
}

impl Bot {
    pub fn builder(config: BotConfig) -> BotBuilder {
        BotBuilder::new(config)
    }

    pub fn handle(&self) -> BotHandle {
        BotHandle {
            inbox: self.dispatcher.inbox(),
        }
    }

    /// Run until `/exit` or [`BotHandle::shutdown`]
    pub async fn run(self) {
        self.dispatcher.run(self.channels).await;
    }
}

/// Feeds input to a running bot
#[derive(Clone)]
pub struct BotHandle {
    inbox: mpsc::UnboundedSender<DispatchInput>,
}

impl BotHandle {
    /// Process a typed line; `false` once the bot has stopped
    pub fn command(&self, line: impl Into<String>) -> bool {
        self.inbox.send(DispatchInput::Command(line.into())).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.inbox.send(DispatchInput::Shutdown).is_ok()
    }
}
