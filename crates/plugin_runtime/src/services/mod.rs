//! Built-in Services
//!
//! The services every bot starts with, plus the script-backed service type
//! created by discovery.

mod config;
mod database;
mod logger;
mod queue;
mod script;

pub use config::*;
pub use database::*;
pub use logger::*;
pub use queue::*;
pub use script::*;

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};
use crate::outbound::OutboundSlot;
use crate::registry::ServiceRegistry;

/// Register `logger`, `database`, `config` and `queue_manager`
pub fn register_builtins(registry: &ServiceRegistry, config: ConfigService, queue: QueueManager) {
    registry.register("logger", Arc::new(LoggerService::new()));
    registry.register("database", Arc::new(DatabaseService::new()));
    registry.register("config", Arc::new(config));
    registry.register("queue_manager", Arc::new(queue));
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn arg_str<'a>(args: &'a [Value], index: usize, what: &str) -> ServiceResult<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::InvalidArguments(format!("expected {} as argument {}", what, index + 1)))
}

pub(crate) fn unsupported(service: &str, method: &str) -> ServiceError {
    ServiceError::UnsupportedMethod {
        service: service.to_string(),
        method: method.to_string(),
    }
}

/// `send_message(channel, content)`, shared by every built-in service
pub(crate) fn call_send_message(outbound: &OutboundSlot, args: &[Value]) -> ServiceResult<Value> {
    let channel = arg_str(args, 0, "channel id")?;
    let content = arg_str(args, 1, "content")?;
    Ok(Value::Bool(outbound.send_message(channel, content)))
}
