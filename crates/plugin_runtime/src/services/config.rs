//! Config service: key/value settings readable by plugins

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value, json};

use super::{arg_str, call_send_message, unsupported};
use crate::error::ServiceResult;
use crate::outbound::{OutboundSink, OutboundSlot};
use crate::registry::Service;

/// Environment variable overriding `echo_wait_time`
pub const ECHO_WAIT_TIME_ENV: &str = "ECHO_WAIT_TIME";

/// Default seconds the echo plugin waits before replying
pub const DEFAULT_ECHO_WAIT_TIME: f64 = 2.0;

pub struct ConfigService {
    values: RwLock<Map<String, Value>>,
    outbound: OutboundSlot,
}

impl Default for ConfigService {
    fn default() -> Self {
        let mut values = Map::new();
        values.insert("echo_wait_time".into(), json!(DEFAULT_ECHO_WAIT_TIME));
        values.insert("bot_name".into(), json!("Pluggable Bot"));
        values.insert("log_level".into(), json!("INFO"));

        Self {
            values: RwLock::new(values),
            outbound: OutboundSlot::new(),
        }
    }
}

impl ConfigService {
    /// Defaults only
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let service = Self::new();
        if let Ok(raw) = std::env::var(ECHO_WAIT_TIME_ENV) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs >= 0.0 => service.set("echo_wait_time", json!(secs)),
                _ => tracing::warn!("Ignoring invalid {}={}", ECHO_WAIT_TIME_ENV, raw),
            }
        }
        service
    }

    /// Builder: set a value
    pub fn with_value(self, key: &str, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }

    /// Seconds the echo plugin should wait
    pub fn echo_wait_time(&self) -> f64 {
        self.get("echo_wait_time")
            .and_then(|v| v.as_f64())
            .filter(|secs| *secs >= 0.0)
            .unwrap_or(DEFAULT_ECHO_WAIT_TIME)
    }
}

impl Service for ConfigService {
    fn kind(&self) -> &str {
        "config"
    }

    fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink);
    }

    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value> {
        match method {
            "get" => {
                let key = arg_str(args, 0, "key")?;
                let default = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(self.get_or(key, default))
            }
            "set" => {
                let key = arg_str(args, 0, "key")?;
                self.set(key, args.get(1).cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            }
            "all" => Ok(Value::Object(self.values.read().clone())),
            "send_message" => call_send_message(&self.outbound, args),
            _ => Err(unsupported("config", method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigService::new();
        assert_eq!(config.echo_wait_time(), 2.0);
        assert_eq!(config.get("bot_name"), Some(json!("Pluggable Bot")));
        assert_eq!(config.get("missing"), None);
    }

    #[test]
    fn test_call_get_with_default() {
        let config = ConfigService::new().with_value("echo_wait_time", json!(0));
        assert_eq!(config.call("get", &[json!("echo_wait_time")]).unwrap(), json!(0));
        assert_eq!(
            config.call("get", &[json!("nope"), json!("fallback")]).unwrap(),
            json!("fallback")
        );
        assert_eq!(config.echo_wait_time(), 0.0);
    }

    #[test]
    fn test_negative_wait_falls_back() {
        let config = ConfigService::new().with_value("echo_wait_time", json!(-1));
        assert_eq!(config.echo_wait_time(), DEFAULT_ECHO_WAIT_TIME);
    }
}
