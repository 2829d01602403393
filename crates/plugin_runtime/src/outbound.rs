//! Outbound Sends
//!
//! Services and plugins never talk to the transport directly. They hold an
//! `OutboundSink`, which the bot implements on top of its single-writer
//! transport.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Something that can deliver chat messages and raw events to the server
pub trait OutboundSink: Send + Sync {
    /// Send `content` to `channel_id`. Returns `false` if it could not be queued.
    fn send_message(&self, channel_id: &str, content: &str) -> bool;

    /// Emit a raw transport event
    fn emit(&self, event: &str, payload: Value) -> bool;
}

/// A late-bound slot for an outbound sink
///
/// Services embed one of these so the registry can attach the transport after
/// construction.
#[derive(Default, Clone)]
pub struct OutboundSlot {
    sink: Arc<RwLock<Option<Arc<dyn OutboundSink>>>>,
}

impl OutboundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn OutboundSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn is_attached(&self) -> bool {
        self.sink.read().is_some()
    }

    pub fn get(&self) -> Option<Arc<dyn OutboundSink>> {
        self.sink.read().clone()
    }

    /// Send through the attached sink, logging when none is attached
    pub fn send_message(&self, channel_id: &str, content: &str) -> bool {
        match self.get() {
            Some(sink) => sink.send_message(channel_id, content),
            None => {
                tracing::warn!(channel = %channel_id, "No transport attached, dropping message");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records everything sent through it
    #[derive(Default)]
    pub struct RecordingSink {
        pub messages: Mutex<Vec<(String, String)>>,
        pub events: Mutex<Vec<(String, Value)>>,
    }

    impl OutboundSink for RecordingSink {
        fn send_message(&self, channel_id: &str, content: &str) -> bool {
            self.messages
                .lock()
                .push((channel_id.to_string(), content.to_string()));
            true
        }

        fn emit(&self, event: &str, payload: Value) -> bool {
            self.events.lock().push((event.to_string(), payload));
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn test_slot_without_sink_drops() {
        let slot = OutboundSlot::new();
        assert!(!slot.is_attached());
        assert!(!slot.send_message("general", "hi"));
    }

    #[test]
    fn test_slot_forwards_after_attach() {
        let slot = OutboundSlot::new();
        let sink = Arc::new(RecordingSink::default());
        slot.attach(sink.clone());

        assert!(slot.send_message("general", "hi"));
        assert_eq!(
            sink.messages.lock().as_slice(),
            &[("general".to_string(), "hi".to_string())]
        );
    }
}
