//! Queue manager service
//!
//! Accepts one task request at a time. While a request is in flight the busy
//! flag is held by a [`BusyGuard`], and further requests are turned away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::{Value, json};

use plugin_types::{Message, extract_json_block, wrap_json_block};

use super::{call_send_message, unsupported};
use crate::error::{ServiceError, ServiceResult};
use crate::outbound::{OutboundSink, OutboundSlot};
use crate::registry::Service;

pub const BUSY_REPLY: &str = "I am currently busy. Please wait for me to finish the task.";

/// Holds the busy flag until dropped
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct QueueManager {
    busy: AtomicBool,
    downstream: RwLock<Vec<String>>,
    outbound: OutboundSlot,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: bots that receive a task when `start_task` is requested
    pub fn with_downstream<I, S>(self, bots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.downstream.write() = bots.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the busy flag, or `None` if another request holds it
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { flag: &self.busy })
    }

    /// Handle a task request
    ///
    /// The request is the first value of the message's structured data, or a
    /// `[json]` block in its content when no structured data is attached.
    pub fn process_request(&self, message: &Message) -> String {
        let Some(_guard) = self.try_begin() else {
            return BUSY_REPLY.to_string();
        };

        let Some(request) = task_request(message) else {
            return "No task payload found. Send a [json]...[/json] block with an action.".to_string();
        };

        match request.get("action").and_then(Value::as_str) {
            Some("start_task") => {
                let data = request.get("data").cloned().unwrap_or_else(|| json!({}));
                self.start_task(&message.channel_id, &data);
                "Tasks started!!".to_string()
            }
            Some(other) => format!("Unknown action: {}", other),
            None => "Request is missing an action".to_string(),
        }
    }

    fn start_task(&self, channel: &str, data: &Value) {
        let block = wrap_json_block(data);
        self.outbound.send_message(
            channel,
            &format!("Request Accepted. Starting Tasks for the following {}", block),
        );

        let downstream = self.downstream.read().clone();
        for bot in &downstream {
            self.outbound
                .send_message(channel, &format!("{} start processing for {}", bot, block));
        }

        let order = data.get("order_number").map_or_else(
            || "n/a".to_string(),
            |n| n.as_str().map_or_else(|| n.to_string(), str::to_string),
        );
        self.outbound
            .send_message(channel, &format!("All Tasks initiated for order: {}", order));
        tracing::info!(order = %order, "Dispatched task to {} downstream bot(s)", downstream.len());
    }
}

fn task_request(message: &Message) -> Option<Value> {
    message
        .json_array
        .first()
        .or_else(|| message.first_json_value())
        .cloned()
        .or_else(|| message.json_block.clone())
        .or_else(|| extract_json_block(&message.content))
}

impl Service for QueueManager {
    fn kind(&self) -> &str {
        "queue_manager"
    }

    fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink);
    }

    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value> {
        match method {
            "process_request" => {
                let raw = args
                    .first()
                    .cloned()
                    .ok_or_else(|| ServiceError::InvalidArguments("expected a message".into()))?;
                let message = Message::from_value(raw)
                    .map_err(|e| ServiceError::InvalidArguments(e.to_string()))?;
                Ok(Value::String(self.process_request(&message)))
            }
            "is_busy" => Ok(Value::Bool(self.is_busy())),
            "send_message" => call_send_message(&self.outbound, args),
            _ => Err(unsupported("queue_manager", method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::testing::RecordingSink;

    fn task_message() -> Message {
        Message::new(
            "user",
            "general",
            r#"go [json]{"action":"start_task","data":{"order_number":"A-17","item":"prep"}}[/json]"#,
        )
    }

    #[test]
    fn test_busy_guard_releases_on_drop() {
        let queue = QueueManager::new();
        {
            let _guard = queue.try_begin().unwrap();
            assert!(queue.is_busy());
            assert!(queue.try_begin().is_none());
        }
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_busy_reply_while_held() {
        let queue = QueueManager::new();
        let _guard = queue.try_begin().unwrap();
        assert_eq!(queue.process_request(&task_message()), BUSY_REPLY);
    }

    #[test]
    fn test_start_task_fans_out() {
        let sink = Arc::new(RecordingSink::default());
        let queue = QueueManager::new().with_downstream(["bot-a", "bot-b"]);
        queue.attach_outbound(sink.clone());

        assert_eq!(queue.process_request(&task_message()), "Tasks started!!");
        assert!(!queue.is_busy());

        let data = json!({"order_number": "A-17", "item": "prep"});
        let sent = sink.messages.lock();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].1.starts_with("Request Accepted. Starting Tasks for the following [json]"));
        assert!(sent[1].1.starts_with("bot-a start processing for [json]"));
        assert_eq!(extract_json_block(&sent[2].1), Some(data));
        assert_eq!(sent[3].1, "All Tasks initiated for order: A-17");
        assert!(sent.iter().all(|(channel, _)| channel == "general"));
    }

    #[test]
    fn test_structured_data_is_the_request() {
        let sink = Arc::new(RecordingSink::default());
        let queue = QueueManager::new().with_downstream(["bot-b"]);
        queue.attach_outbound(sink.clone());

        let mut data = serde_json::Map::new();
        data.insert("request".into(), json!({"action": "start_task", "data": {"sku": 4}}));
        let message = Message::new("user", "general", "no block here").with_json_data(data);

        assert_eq!(queue.process_request(&message), "Tasks started!!");
        let sent = sink.messages.lock();
        assert_eq!(extract_json_block(&sent[1].1), Some(json!({"sku": 4})));
        assert_eq!(sent[2].1, "All Tasks initiated for order: n/a");
    }

    #[test]
    fn test_missing_data_sends_empty_object() {
        let sink = Arc::new(RecordingSink::default());
        let queue = QueueManager::new().with_downstream(["bot-b"]);
        queue.attach_outbound(sink.clone());

        let message = Message::new("u", "c", r#"[json]{"action":"start_task"}[/json]"#);
        assert_eq!(queue.process_request(&message), "Tasks started!!");
        assert_eq!(sink.messages.lock()[1].1, "bot-b start processing for [json]{}[/json]");
    }

    #[test]
    fn test_unknown_action() {
        let queue = QueueManager::new();
        let message = Message::new("u", "c", r#"[json]{"action":"dance"}[/json]"#);
        assert_eq!(queue.process_request(&message), "Unknown action: dance");
    }
}
