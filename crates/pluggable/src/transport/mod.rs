//! Chat Transport
//!
//! The dispatcher talks to the chat server through the [`Transport`] trait.
//! Implementations push everything they receive into an [`EventSink`] as
//! [`TransportEvent`]s; the dispatcher is the only consumer.

mod memory;
mod websocket;

pub use memory::*;
pub use websocket::*;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::ConnectionResult;

/// Something the server told us
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    /// A lost connection is being re-established; `ConnectError`s and then
    /// `Connected` follow
    Reconnecting,
    ConnectError(String),
    /// A named server event such as `new_message` or `channel_status`
    Event { name: String, data: Value },
}

impl TransportEvent {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        TransportEvent::Event {
            name: name.into(),
            data,
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Connection to the chat server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and start delivering events to `events`
    ///
    /// Each failed attempt is reported as a `ConnectError` event before the
    /// next one starts.
    async fn connect(&self, events: EventSink) -> ConnectionResult<()>;

    /// Close the connection; a `Disconnected` event follows
    async fn disconnect(&self) -> ConnectionResult<()>;

    /// Queue a fire-and-forget event
    fn emit(&self, event: &str, data: Value) -> ConnectionResult<()>;

    /// Queue an event whose acknowledgement carries a reply
    fn request(&self, event: &str, data: Value) -> ConnectionResult<oneshot::Receiver<Value>>;

    fn is_connected(&self) -> bool;

    /// A connect loop is currently running
    fn is_connecting(&self) -> bool {
        false
    }
}
