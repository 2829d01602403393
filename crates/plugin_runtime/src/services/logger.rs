//! Logger service: plugin log lines routed to tracing

use std::sync::Arc;

use serde_json::Value;

use super::{call_send_message, unsupported};
use crate::error::ServiceResult;
use crate::outbound::{OutboundSink, OutboundSlot};
use crate::registry::Service;

#[derive(Default)]
pub struct LoggerService {
    outbound: OutboundSlot,
}

impl LoggerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(target: "plugin", "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(target: "plugin", "{}", message);
    }

    pub fn warning(&self, message: &str) {
        tracing::warn!(target: "plugin", "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "plugin", "{}", message);
    }
}

fn join(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl Service for LoggerService {
    fn kind(&self) -> &str {
        "logger"
    }

    fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink);
    }

    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value> {
        match method {
            "debug" => self.debug(&join(args)),
            "info" | "log" => self.info(&join(args)),
            "warning" | "warn" => self.warning(&join(args)),
            "error" => self.error(&join(args)),
            "send_message" => return call_send_message(&self.outbound, args),
            _ => return Err(unsupported("logger", method)),
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_methods() {
        let logger = LoggerService::new();
        for method in ["debug", "info", "log", "warning", "warn", "error"] {
            assert_eq!(logger.call(method, &[json!("hello"), json!(1)]).unwrap(), Value::Null);
        }
        assert!(logger.call("trace", &[]).is_err());
    }
}
