//! In-memory transport
//!
//! Records everything emitted and lets the caller inject server events.
//! Useful for running the bot without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{EventSink, Transport, TransportEvent};
use crate::error::{ConnectionError, ConnectionResult};

#[derive(Default)]
pub struct MemoryTransport {
    connected: AtomicBool,
    connecting: AtomicBool,
    connect_delay: Duration,
    events: Mutex<Option<EventSink>>,
    emitted: Mutex<Vec<(String, Value)>>,
    replies: Mutex<HashMap<String, Value>>,
    refuse_with: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: answer every `request(event, ..)` with `reply`
    pub fn with_reply(self, event: impl Into<String>, reply: Value) -> Self {
        self.replies.lock().insert(event.into(), reply);
        self
    }

    /// Builder: let every connect take `delay` before it settles
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make the next connects fail with `error`; `None` lets them succeed
    pub fn refuse_connections(&self, error: Option<&str>) {
        *self.refuse_with.lock() = error.map(str::to_string);
    }

    /// Deliver a server event as if it came over the wire
    pub fn inject(&self, event: TransportEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Lose the connection from the server side
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.inject(TransportEvent::Disconnected {
            reason: Some(reason.to_string()),
        })
    }

    /// Everything emitted so far, oldest first
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().clone()
    }

    /// Payloads emitted under `event`
    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.emitted.lock().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, events: EventSink) -> ConnectionResult<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::InProgress);
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.connecting.store(false, Ordering::SeqCst);

        let refused = self.refuse_with.lock().clone();
        if let Some(error) = refused {
            let _ = events.send(TransportEvent::ConnectError(error.clone()));
            *self.events.lock() = Some(events);
            return Err(ConnectionError::ConnectFailed {
                attempts: 1,
                message: error,
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Connected);
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.inject(TransportEvent::Disconnected {
            reason: Some("client disconnect".to_string()),
        });
        Ok(())
    }

    fn emit(&self, event: &str, data: Value) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.emitted.lock().push((event.to_string(), data));
        Ok(())
    }

    fn request(&self, event: &str, data: Value) -> ConnectionResult<oneshot::Receiver<Value>> {
        self.emit(event, data)?;
        let (tx, rx) = oneshot::channel();
        if let Some(reply) = self.replies.lock().get(event).cloned() {
            let _ = tx.send(reply);
        }
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }
}
