//! Script-backed services
//!
//! A discovered `<name>_service.js` file defines a global `service` object.
//! The object lives in its own engine on a dedicated thread, and calls reach
//! it over a command channel, so state kept in the object persists between
//! calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{PluginError, RuntimeResult, ServiceError, ServiceResult};
use crate::outbound::{OutboundSink, OutboundSlot};
use crate::registry::Service;
use crate::script::{ScriptEngine, ScriptGlobals};

/// How long a service file may take to evaluate
pub const STARTUP_LIMIT: Duration = Duration::from_secs(5);

enum ServiceCommand {
    Call {
        method: String,
        args: Vec<Value>,
        reply: mpsc::Sender<ServiceResult<Value>>,
    },
}

pub struct ScriptService {
    name: String,
    path: Option<PathBuf>,
    commands: mpsc::Sender<ServiceCommand>,
    outbound: OutboundSlot,
}

impl ScriptService {
    /// Start a service worker running `source`
    ///
    /// Fails if the source does not evaluate or does not define `service`.
    pub fn spawn(name: impl Into<String>, source: String) -> RuntimeResult<Self> {
        let name = name.into();
        let outbound = OutboundSlot::new();
        let (cmd_tx, cmd_rx) = mpsc::channel::<ServiceCommand>();
        let (init_tx, init_rx) = mpsc::sync_channel::<RuntimeResult<()>>(1);

        let globals = ScriptGlobals::new(name.clone()).with_outbound(outbound.clone());
        let worker_name = name.clone();

        thread::Builder::new()
            .name(format!("service-{}", name))
            .spawn(move || {
                let engine = match start_engine(globals, &source) {
                    Ok(engine) => {
                        let _ = init_tx.send(Ok(()));
                        engine
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = cmd_rx.recv() {
                    match command {
                        ServiceCommand::Call { method, args, reply } => {
                            let _ = reply.send(call_method(&engine, &worker_name, &method, args));
                        }
                    }
                }

                tracing::debug!("Script service {} stopped", worker_name);
            })
            .map_err(PluginError::Spawn)?;

        match init_rx.recv_timeout(STARTUP_LIMIT + Duration::from_secs(1)) {
            Ok(started) => started?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(PluginError::script(&name, "service worker did not start in time"));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(PluginError::script(&name, "service worker exited during startup"));
            }
        }

        Ok(Self {
            name,
            path: None,
            commands: cmd_tx,
            outbound,
        })
    }

    /// Start a service worker from a file
    pub fn from_file(name: impl Into<String>, path: &Path) -> RuntimeResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|source| PluginError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut service = Self::spawn(name, source)?;
        service.path = Some(path.to_path_buf());
        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn start_engine(globals: ScriptGlobals, source: &str) -> RuntimeResult<ScriptEngine> {
    let engine = ScriptEngine::new(globals)?;
    engine.eval_within(source, STARTUP_LIMIT)?;

    let defined = engine.eval("typeof globalThis.service === 'object' && globalThis.service !== null")?;
    if defined != Value::Bool(true) {
        return Err(PluginError::script(engine.name(), "no service definition found"));
    }
    Ok(engine)
}

fn call_method(engine: &ScriptEngine, service: &str, method: &str, args: Vec<Value>) -> ServiceResult<Value> {
    let supported = engine
        .call("__hasServiceMethod", &[json!(method)])
        .map_err(|e| ServiceError::Failed(e.to_string()))?;
    if supported != Value::Bool(true) {
        return Err(ServiceError::UnsupportedMethod {
            service: service.to_string(),
            method: method.to_string(),
        });
    }

    engine
        .call("__callServiceMethod", &[json!(method), Value::Array(args)])
        .map_err(|e| ServiceError::Failed(e.to_string()))
}

impl Service for ScriptService {
    fn kind(&self) -> &str {
        "script"
    }

    fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink);
    }

    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(ServiceCommand::Call {
                method: method.to_string(),
                args: args.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| ServiceError::Failed(format!("service {} is not running", self.name)))?;

        reply_rx
            .recv()
            .map_err(|_| ServiceError::Failed(format!("service {} stopped mid-call", self.name)))?
    }
}
