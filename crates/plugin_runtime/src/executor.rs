//! Execution Context Manager
//!
//! Every invocation gets its own OS thread. Suspending handlers additionally
//! get a current-thread tokio runtime created for that invocation only; when
//! the handler returns, held resources are released and the runtime is shut
//! down with a bounded timeout, which cancels anything the handler spawned and
//! left running.
//!
//! Whatever happens inside the worker, including panics, ends as exactly one
//! [`PluginResult`] on the [`ResultChannel`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::FutureExt;
use plugin_types::{ExecutionId, Message, PluginOutcome, PluginResult};

use crate::context::PluginContext;
use crate::error::{PluginError, RuntimeResult};
use crate::loader::{NativeHandler, NativePlugin, PluginUnit, ResolvedPlugin, ScriptSource};
use crate::outbound::OutboundSlot;
use crate::registry::{ResolvedDependencies, ServiceRegistry};
use crate::resources::ActiveResources;
use crate::results::ResultChannel;
use crate::script::{ScriptEngine, ScriptGlobals, result_text};

/// Runs resolved plugins on dedicated workers
#[derive(Clone)]
pub struct PluginExecutor {
    registry: Arc<ServiceRegistry>,
    resources: Arc<ActiveResources>,
    results: ResultChannel,
    outbound: OutboundSlot,
    teardown_timeout: Duration,
}

impl PluginExecutor {
    pub fn new(registry: Arc<ServiceRegistry>, results: ResultChannel) -> Self {
        Self {
            registry,
            resources: Arc::new(ActiveResources::new()),
            results,
            outbound: OutboundSlot::new(),
            teardown_timeout: Duration::from_secs(2),
        }
    }

    /// Builder: share a resource table with a cancellation path
    pub fn with_resources(mut self, resources: Arc<ActiveResources>) -> Self {
        self.resources = resources;
        self
    }

    /// Builder: let script plugins call `bot.sendMessage`
    pub fn with_outbound(mut self, outbound: OutboundSlot) -> Self {
        self.outbound = outbound;
        self
    }

    /// Builder: bound on per-invocation scheduler teardown
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn resources(&self) -> &Arc<ActiveResources> {
        &self.resources
    }

    pub fn results(&self) -> &ResultChannel {
        &self.results
    }

    /// Start one invocation on a new worker thread
    ///
    /// Only fails if the thread cannot be created; in that case nothing is
    /// pushed to the result channel.
    pub fn spawn(
        &self,
        plugin: ResolvedPlugin,
        message: Message,
        execution_id: ExecutionId,
    ) -> RuntimeResult<thread::JoinHandle<()>> {
        let worker = self.clone();

        thread::Builder::new()
            .name(format!("plugin-{}", execution_id))
            .spawn(move || worker.run(plugin, message, execution_id))
            .map_err(PluginError::Spawn)
    }

    fn run(&self, plugin: ResolvedPlugin, message: Message, execution_id: ExecutionId) {
        let channel_id = message.channel_id.clone();
        tracing::debug!(plugin = %plugin.name, execution = %execution_id, "Plugin worker started");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke(&plugin, message, &execution_id)))
            .unwrap_or_else(|payload| Err(PluginError::Panicked(panic_message(payload))));

        let outcome = match outcome {
            Ok(text) => {
                tracing::info!(plugin = %plugin.name, execution = %execution_id, "Plugin completed");
                PluginOutcome::Completed(text)
            }
            Err(e) => {
                tracing::warn!(plugin = %plugin.name, execution = %execution_id, error = %e, "Plugin failed");
                PluginOutcome::Failed(e.to_string())
            }
        };

        self.results
            .push(PluginResult::new(plugin.name, execution_id, channel_id, outcome));
    }

    fn invoke(&self, plugin: &ResolvedPlugin, message: Message, execution_id: &ExecutionId) -> RuntimeResult<String> {
        match &plugin.unit {
            PluginUnit::Native(native) => self.invoke_native(&plugin.name, native, message, execution_id),
            PluginUnit::Script(script) => self.invoke_script(&plugin.name, script, message, execution_id),
        }
    }

    fn dependencies(&self, plugin_name: &str, names: &[String]) -> ResolvedDependencies {
        let resolved = self.registry.resolve(names);
        for missing in &resolved.missing {
            tracing::warn!(plugin = %plugin_name, "Dependency {} is not registered", missing);
        }
        resolved
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Native handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn invoke_native(
        &self,
        name: &str,
        native: &NativePlugin,
        message: Message,
        execution_id: &ExecutionId,
    ) -> RuntimeResult<String> {
        let deps = self.dependencies(name, &native.dependencies);
        let ctx = PluginContext::new(name, execution_id.clone(), deps, self.resources.clone());

        // Held resources are released even when the handler panics
        match &native.handler {
            NativeHandler::Blocking(handler) => {
                let result = catch_unwind(AssertUnwindSafe(|| handler(&message, &ctx)));
                if !ctx.resources().is_empty() {
                    let rt = scheduler()?;
                    rt.block_on(release(&ctx, self.teardown_timeout));
                }
                settle(result)
            }
            NativeHandler::Suspending(handler) => {
                let rt = scheduler()?;
                let result = rt.block_on(async {
                    let result = AssertUnwindSafe(async { handler(message, ctx.clone()).await })
                        .catch_unwind()
                        .await;
                    release(&ctx, self.teardown_timeout).await;
                    result
                });
                rt.shutdown_timeout(self.teardown_timeout);
                settle(result)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Script handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn invoke_script(
        &self,
        name: &str,
        script: &ScriptSource,
        message: Message,
        execution_id: &ExecutionId,
    ) -> RuntimeResult<String> {
        let globals = ScriptGlobals::new(name)
            .with_execution_id(execution_id.as_str())
            .with_outbound(self.outbound.clone());
        let engine = ScriptEngine::new(globals)?;

        engine.eval(&script.source)?;
        let declared = engine.declared_dependencies()?;
        let deps = self.dependencies(name, &declared);
        engine.bind_services(deps.services)?;

        let value = engine.invoke_handler(&message)?;
        Ok(result_text(value))
    }
}

/// A scheduler owned by one invocation
fn scheduler() -> RuntimeResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(PluginError::Spawn)
}

async fn release(ctx: &PluginContext, step_timeout: Duration) {
    let failures = ctx.resources().release_all(step_timeout).await;
    if !failures.is_empty() {
        tracing::warn!(
            plugin = %ctx.plugin_name(),
            "{} resource cleanup step(s) failed",
            failures.len()
        );
    }
}

fn settle(result: Result<anyhow::Result<String>, Box<dyn Any + Send>>) -> RuntimeResult<String> {
    match result {
        Ok(result) => result.map_err(|e| PluginError::Execution(format!("{:#}", e))),
        Err(payload) => Err(PluginError::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::HandlerTable;
    use crate::resources::testing::TracedResource;
    use crate::services::{ConfigService, QueueManager, register_builtins};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn executor() -> PluginExecutor {
        let registry = Arc::new(ServiceRegistry::new());
        register_builtins(
            &registry,
            ConfigService::new().with_value("echo_wait_time", serde_json::json!(0)),
            QueueManager::new(),
        );
        PluginExecutor::new(registry, ResultChannel::new()).with_teardown_timeout(Duration::from_millis(200))
    }

    fn native(name: &str, plugin: NativePlugin) -> ResolvedPlugin {
        ResolvedPlugin {
            name: name.to_string(),
            unit: PluginUnit::Native(plugin),
        }
    }

    fn script(name: &str, source: &str) -> ResolvedPlugin {
        ResolvedPlugin {
            name: name.to_string(),
            unit: PluginUnit::Script(ScriptSource {
                path: format!("{}.js", name).into(),
                source: Arc::from(source),
                modified: None,
            }),
        }
    }

    fn run_one(executor: &PluginExecutor, plugin: ResolvedPlugin, content: &str) -> PluginResult {
        let id = ExecutionId::generate(&plugin.name);
        let message = Message::new("user-1", "general", content).with_sender_name("Ada");
        executor.spawn(plugin, message, id.clone()).unwrap().join().unwrap();

        let mut results = executor.results().drain();
        assert_eq!(results.len(), 1);
        let result = results.remove(0);
        assert_eq!(result.execution_id, id);
        result
    }

    #[test]
    fn test_builtin_echo() {
        let executor = executor();
        let echo = HandlerTable::with_builtins().get("echo_handler").cloned().unwrap();

        let result = run_one(&executor, native("echo_handler", echo), "hi");
        assert_eq!(result.outcome, PluginOutcome::Completed("Echo: hi".to_string()));
        assert_eq!(result.channel_id, "general");
    }

    #[test]
    fn test_blocking_error_becomes_failed() {
        let executor = executor();
        let plugin = NativePlugin::blocking(|_, _| anyhow::bail!("no weather today"));

        let result = run_one(&executor, native("weather_handler", plugin), "x");
        assert!(!result.outcome.is_success());
        assert!(result.outcome.payload().contains("no weather today"));
    }

    #[test]
    fn test_panic_is_contained() {
        let executor = executor();
        let plugin = NativePlugin::blocking(|_, _| panic!("boom"));

        let result = run_one(&executor, native("panic_handler", plugin), "x");
        assert_eq!(result.outcome, PluginOutcome::Failed("Plugin panicked: boom".to_string()));
    }

    #[test]
    fn test_missing_dependency_is_omitted() {
        let executor = executor();
        let plugin = NativePlugin::blocking(|_, ctx| {
            Ok(format!("{:?}|{:?}", ctx.dependency_names(), ctx.missing_dependencies()))
        })
        .with_dependencies(["logger", "weather"]);

        let result = run_one(&executor, native("deps_handler", plugin), "x");
        assert_eq!(result.outcome.payload(), r#"["logger"]|["weather"]"#);
    }

    #[test]
    fn test_leftover_subtasks_are_cancelled() {
        let executor = executor();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let plugin = NativePlugin::suspending(move |_, _| {
            let flag = flag.clone();
            async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    flag.store(true, Ordering::SeqCst);
                });
                Ok("started".to_string())
            }
        });

        let started = std::time::Instant::now();
        let result = run_one(&executor, native("spawner_handler", plugin), "x");
        assert_eq!(result.outcome.payload(), "started");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_held_resource_cleaned_up() {
        let executor = executor();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let traced = calls.clone();

        let plugin = NativePlugin::blocking(move |_, ctx| {
            ctx.hold_resource(Arc::new(TracedResource::new("session", traced.clone())));
            Ok("done".to_string())
        });

        run_one(&executor, native("session_handler", plugin), "x");
        assert_eq!(*calls.lock(), vec!["session:cleanup".to_string()]);
        assert!(executor.resources().is_empty());
    }

    fn explode(what: &str) -> anyhow::Result<String> {
        panic!("{}", what)
    }

    #[test]
    fn test_held_resource_cleaned_up_after_panic() {
        let executor = executor();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let traced = calls.clone();
        let blocking = NativePlugin::blocking(move |_, ctx| {
            ctx.hold_resource(Arc::new(TracedResource::new("browser", traced.clone())));
            explode("crashed while browsing")
        });
        let result = run_one(&executor, native("browse_handler", blocking), "x");
        assert_eq!(
            result.outcome,
            PluginOutcome::Failed("Plugin panicked: crashed while browsing".to_string())
        );
        assert_eq!(*calls.lock(), vec!["browser:cleanup".to_string()]);
        assert!(executor.resources().is_empty());

        let traced = calls.clone();
        let suspending = NativePlugin::suspending(move |_, ctx| {
            let traced = traced.clone();
            async move {
                ctx.hold_resource(Arc::new(TracedResource::new("job", traced)));
                tokio::task::yield_now().await;
                explode("job exploded")
            }
        });
        let result = run_one(&executor, native("job_handler", suspending), "x");
        assert_eq!(result.outcome, PluginOutcome::Failed("Plugin panicked: job exploded".to_string()));
        assert_eq!(
            *calls.lock(),
            vec!["browser:cleanup".to_string(), "job:cleanup".to_string()]
        );
        assert!(executor.resources().is_empty());
    }

    #[test]
    fn test_script_handler_with_deps() {
        let executor = executor();
        let plugin = script(
            "greet_handler",
            r#"
            function getDependencies() { return ['config', 'nothing']; }
            async function handleMessage(message, deps) {
                const name = await deps.config.get('bot_name');
                return name + ' greets ' + message.senderName + ' via ' + bot.pluginName;
            }
            "#,
        );

        let result = run_one(&executor, plugin, "hello");
        assert_eq!(
            result.outcome,
            PluginOutcome::Completed("Pluggable Bot greets Ada via greet_handler".to_string())
        );
    }

    #[test]
    fn test_script_returning_cyclic_object_fails() {
        let executor = executor();
        let plugin = script(
            "cyclic_handler",
            "function handleMessage(m) { const o = {}; o.self = o; return o; }",
        );

        let result = run_one(&executor, plugin, "x");
        assert!(!result.outcome.is_success());
        assert!(result.outcome.payload().contains("cyclic"), "{}", result.outcome.payload());
    }

    #[test]
    fn test_script_without_handler_fails() {
        let executor = executor();
        let result = run_one(&executor, script("empty_handler", "var x = 1;"), "x");
        assert!(result.outcome.payload().contains("handleMessage is not defined"));
    }
}
