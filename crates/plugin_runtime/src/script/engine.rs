//! QuickJS Engine Wrapper

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::{CatchResultExt, Context, Function, Runtime, Value as JsValue};
use serde_json::{Value, json};

use plugin_types::Message;

use super::convert::{js_to_json, json_to_js};
use super::globals::ScriptGlobals;
use crate::error::{PluginError, RuntimeResult, ServiceError};
use crate::registry::Service;

/// Heap limit for one engine
const MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Upper bound on promise jobs run for a single call
const MAX_PENDING_JOBS: usize = 100_000;

/// A single-threaded JavaScript engine
///
/// All calls go through `__settle`, so sync functions, functions returning
/// promises and `async` functions are handled the same way.
pub struct ScriptEngine {
    name: String,
    runtime: Runtime,
    context: Context,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl ScriptEngine {
    /// Create an engine with the host globals installed
    pub fn new(globals: ScriptGlobals) -> RuntimeResult<Self> {
        let name = globals.name.clone();
        let runtime = Runtime::new().map_err(|e| PluginError::script(&name, e.to_string()))?;
        runtime.set_memory_limit(MEMORY_LIMIT);

        // Running script is interrupted once an armed deadline has passed
        let deadline = Arc::new(Mutex::new(None::<Instant>));
        let armed = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            armed.lock().is_some_and(|deadline| Instant::now() >= deadline)
        })));

        let context = Context::full(&runtime).map_err(|e| PluginError::script(&name, e.to_string()))?;

        context
            .with(|ctx| globals.register(&ctx))
            .map_err(|e| PluginError::script(&name, format!("failed to install globals: {}", e)))?;

        Ok(Self {
            name,
            runtime,
            context,
            deadline,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn error(&self, message: impl Into<String>) -> PluginError {
        PluginError::script(&self.name, message)
    }

    /// Evaluate source in the global scope and return its completion value
    pub fn eval(&self, source: &str) -> RuntimeResult<Value> {
        self.context.with(|ctx| {
            let value: JsValue = ctx
                .eval(source)
                .catch(&ctx)
                .map_err(|e| self.error(e.to_string()))?;
            js_to_json(&ctx, value).map_err(|e| self.error(e.to_string()))
        })
    }

    /// Evaluate source, interrupting it if it runs longer than `limit`
    pub fn eval_within(&self, source: &str, limit: Duration) -> RuntimeResult<Value> {
        *self.deadline.lock() = Some(Instant::now() + limit);
        let result = self.eval(source);
        let expired = self.deadline.lock().take().is_some_and(|deadline| Instant::now() >= deadline);

        match result {
            Err(_) if expired => Err(self.error(format!("evaluation did not finish within {:?}", limit))),
            other => other,
        }
    }

    /// Check if a global function exists
    pub fn has_function(&self, name: &str) -> bool {
        self.context
            .with(|ctx| ctx.globals().get::<_, Function>(name).is_ok())
    }

    /// Call a global function and wait for its result to settle
    pub fn call(&self, function: &str, args: &[Value]) -> RuntimeResult<Value> {
        self.context.with(|ctx| -> RuntimeResult<()> {
            let settle: Function = ctx
                .globals()
                .get("__settle")
                .map_err(|e| self.error(e.to_string()))?;
            let js_args =
                json_to_js(&ctx, &Value::Array(args.to_vec())).map_err(|e| self.error(e.to_string()))?;
            let _: JsValue = settle
                .call((function, js_args))
                .catch(&ctx)
                .map_err(|e| self.error(e.to_string()))?;
            Ok(())
        })?;

        self.run_pending_jobs()?;

        let outcome = self.context.with(|ctx| -> RuntimeResult<Value> {
            let outcome: JsValue = ctx
                .globals()
                .get("__outcome")
                .map_err(|e| self.error(e.to_string()))?;
            js_to_json(&ctx, outcome).map_err(|e| self.error(e.to_string()))
        })?;

        match outcome {
            Value::Object(mut fields) => {
                if fields.get("ok").and_then(Value::as_bool) == Some(true) {
                    Ok(fields.remove("value").unwrap_or(Value::Null))
                } else {
                    let error = fields
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    Err(self.error(error))
                }
            }
            _ => Err(self.error(format!("{} did not settle", function))),
        }
    }

    fn run_pending_jobs(&self) -> RuntimeResult<()> {
        let mut executed = 0;
        while self.runtime.is_job_pending() {
            if self.runtime.execute_pending_job().is_err() {
                return Err(self.error("uncaught exception in pending job"));
            }
            executed += 1;
            if executed > MAX_PENDING_JOBS {
                return Err(self.error("too many pending jobs"));
            }
        }
        Ok(())
    }

    /// Dependency names declared by `getDependencies()`, if defined
    pub fn declared_dependencies(&self) -> RuntimeResult<Vec<String>> {
        if !self.has_function("getDependencies") {
            return Ok(Vec::new());
        }

        match self.call("getDependencies", &[])? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(self.error(format!(
                "getDependencies must return an array of names, got {}",
                other
            ))),
        }
    }

    /// Expose services to the script as the `deps` argument of `handleMessage`
    pub fn bind_services(&self, services: HashMap<String, Arc<dyn Service>>) -> RuntimeResult<()> {
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        let services = Arc::new(services);

        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                let bridge = Function::new(
                    ctx.clone(),
                    move |service: String, method: String, args: String| -> String {
                        bridge_call(&services, &service, &method, &args)
                    },
                )?;
                ctx.globals().set("__serviceCall", bridge)?;
                Ok(())
            })
            .map_err(|e| self.error(e.to_string()))?;

        self.call("__installDeps", &[json!(names)])?;
        Ok(())
    }

    /// Run `handleMessage(message, deps)`
    pub fn invoke_handler(&self, message: &Message) -> RuntimeResult<Value> {
        if !self.has_function("handleMessage") {
            return Err(self.error("handleMessage is not defined"));
        }
        let message = serde_json::to_value(message).map_err(|e| self.error(e.to_string()))?;
        self.call("__invokeHandler", &[message])
    }
}

/// Route one `deps.<service>.<method>(...)` call from script to Rust
fn bridge_call(
    services: &HashMap<String, Arc<dyn Service>>,
    service: &str,
    method: &str,
    args: &str,
) -> String {
    let reply = serde_json::from_str::<Vec<Value>>(args)
        .map_err(|e| ServiceError::InvalidArguments(e.to_string()))
        .and_then(|args| {
            services
                .get(service)
                .ok_or_else(|| ServiceError::NotFound(service.to_string()))?
                .call(method, &args)
        });

    match reply {
        Ok(value) => json!({ "ok": true, "value": value }).to_string(),
        Err(e) => json!({ "ok": false, "error": e.to_string() }).to_string(),
    }
}

/// Convert a handler's return value into the text pushed as its result
pub fn result_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    }
}
