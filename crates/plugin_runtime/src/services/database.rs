//! Database service: in-memory store of plugin responses

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{arg_str, call_send_message, unsupported};
use crate::error::{ServiceError, ServiceResult};
use crate::outbound::{OutboundSink, OutboundSlot};
use crate::registry::Service;

/// One stored response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub timestamp: String,
    pub message: Value,
    pub response: String,
}

#[derive(Default)]
pub struct DatabaseService {
    responses: Mutex<Vec<StoredResponse>>,
    outbound: OutboundSlot,
}

impl DatabaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_response(&self, timestamp: impl Into<String>, message: Value, response: impl Into<String>) {
        self.responses.lock().push(StoredResponse {
            timestamp: timestamp.into(),
            message,
            response: response.into(),
        });
    }

    pub fn get_responses(&self) -> Vec<StoredResponse> {
        self.responses.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.responses.lock().len()
    }
}

impl Service for DatabaseService {
    fn kind(&self) -> &str {
        "database"
    }

    fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink);
    }

    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value> {
        match method {
            "store_response" => {
                let timestamp = arg_str(args, 0, "timestamp")?;
                let message = args.get(1).cloned().unwrap_or(Value::Null);
                let response = arg_str(args, 2, "response")?;
                self.store_response(timestamp, message, response);
                Ok(Value::Null)
            }
            "get_responses" => serde_json::to_value(self.get_responses())
                .map_err(|e| ServiceError::Failed(e.to_string())),
            "count" => Ok(Value::from(self.count())),
            "send_message" => call_send_message(&self.outbound, args),
            _ => Err(unsupported("database", method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_and_list() {
        let db = DatabaseService::new();
        db.call(
            "store_response",
            &[json!("2024-01-01T00:00:00Z"), json!({"content": "hi"}), json!("Echo: hi")],
        )
        .unwrap();

        assert_eq!(db.count(), 1);
        assert_eq!(db.call("count", &[]).unwrap(), json!(1));
        let listed = db.call("get_responses", &[]).unwrap();
        assert_eq!(listed[0]["response"], json!("Echo: hi"));
        assert_eq!(listed[0]["message"]["content"], json!("hi"));
    }

    #[test]
    fn test_store_requires_response_text() {
        let db = DatabaseService::new();
        let err = db.call("store_response", &[json!("t"), json!({})]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments(_)));
        assert_eq!(db.count(), 0);
    }
}
