//! Native handler table
//!
//! Compiled-in plugins, registered under module-path names such as
//! `plugins.echo_handler` or `echo_handler`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use plugin_types::Message;

use crate::context::PluginContext;
use crate::services::{ConfigService, DatabaseService, DEFAULT_ECHO_WAIT_TIME, LoggerService};

pub type BlockingFn = dyn Fn(&Message, &PluginContext) -> anyhow::Result<String> + Send + Sync;
pub type SuspendingFn =
    dyn Fn(Message, PluginContext) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync;

/// How a native handler runs
#[derive(Clone)]
pub enum NativeHandler {
    /// Runs to completion on the worker thread
    Blocking(Arc<BlockingFn>),
    /// Runs on a scheduler created for the invocation
    Suspending(Arc<SuspendingFn>),
}

/// A compiled-in plugin
#[derive(Clone)]
pub struct NativePlugin {
    pub handler: NativeHandler,
    pub dependencies: Vec<String>,
}

impl NativePlugin {
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn(&Message, &PluginContext) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            handler: NativeHandler::Blocking(Arc::new(handler)),
            dependencies: Vec::new(),
        }
    }

    pub fn suspending<F, Fut>(handler: F) -> Self
    where
        F: Fn(Message, PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self {
            handler: NativeHandler::Suspending(Arc::new(move |message: Message, ctx: PluginContext| {
                handler(message, ctx).boxed()
            })),
            dependencies: Vec::new(),
        }
    }

    /// Builder: declare the services this plugin needs
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Debug for NativePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.handler {
            NativeHandler::Blocking(_) => "blocking",
            NativeHandler::Suspending(_) => "suspending",
        };
        f.debug_struct("NativePlugin")
            .field("kind", &kind)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Module path -> native plugin
#[derive(Default, Clone, Debug)]
pub struct HandlerTable {
    entries: HashMap<String, NativePlugin>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with the compiled-in plugins
    pub fn with_builtins() -> Self {
        Self::new().with("echo_handler", echo_plugin())
    }

    /// Builder: add an entry
    pub fn with(mut self, module_path: impl Into<String>, plugin: NativePlugin) -> Self {
        self.register(module_path, plugin);
        self
    }

    pub fn register(&mut self, module_path: impl Into<String>, plugin: NativePlugin) {
        let module_path = module_path.into();
        if self.entries.insert(module_path.clone(), plugin).is_some() {
            tracing::info!("Replaced native plugin {}", module_path);
        }
    }

    pub fn get(&self, module_path: &str) -> Option<&NativePlugin> {
        self.entries.get(module_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in plugins
// ─────────────────────────────────────────────────────────────────────────────

/// Waits `echo_wait_time` seconds, records the reply, and echoes the content
pub fn echo_plugin() -> NativePlugin {
    NativePlugin::suspending(echo).with_dependencies(["config", "logger", "database"])
}

async fn echo(message: Message, ctx: PluginContext) -> anyhow::Result<String> {
    let wait = ctx
        .get_as::<ConfigService>("config")
        .map(|config| config.echo_wait_time())
        .unwrap_or(DEFAULT_ECHO_WAIT_TIME);

    if let Some(logger) = ctx.get_as::<LoggerService>("logger") {
        logger.info(&format!(
            "Echo plugin processing message from {}, waiting {}s",
            message.sender_name, wait
        ));
    }

    tokio::time::sleep(Duration::from_secs_f64(wait)).await;

    let response = format!("Echo: {}", message.content);
    if let Some(database) = ctx.get_as::<DatabaseService>("database") {
        database.store_response(
            chrono::Utc::now().to_rfc3339(),
            serde_json::to_value(&message)?,
            response.clone(),
        );
    }

    Ok(response)
}
