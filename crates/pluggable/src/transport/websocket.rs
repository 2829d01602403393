//! WebSocket Transport
//!
//! JSON envelopes over a single WebSocket:
//!
//! ```text
//! {"event": "join_channel", "data": "general"}
//! {"event": "get_channel_details", "data": "general", "ackId": 7}
//! {"event": "ack", "ackId": 7, "data": {...}}
//! ```
//!
//! One task owns the socket. Outgoing envelopes reach it through an unbounded
//! channel, so writes are serialized no matter how many callers emit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{EventSink, Transport, TransportEvent};
use crate::error::{ConnectionError, ConnectionResult};

const ACK_EVENT: &str = "ack";

/// Wire envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_id: Option<u64>,
}

/// Build the socket URL from the server URL and socket path
///
/// `http` becomes `ws` and `https` becomes `wss`.
pub fn socket_url(server_url: &str, socket_path: &str) -> ConnectionResult<Url> {
    let invalid = |reason: &str| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(server_url).map_err(|e| invalid(&e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("expected an http, https, ws or wss URL")),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme"))?;
    url.set_path(socket_path);
    Ok(url)
}

/// The socket currently in use
///
/// `generation` grows with every established socket, so a socket task that
/// was replaced can tell it no longer owns the connection state.
#[derive(Default)]
struct Link {
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Envelope>>,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    connecting: AtomicBool,
    link: Mutex<Link>,
    pending: DashMap<u64, oneshot::Sender<Value>>,
}

impl Shared {
    /// Make a freshly opened socket the current one
    fn install(&self) -> (u64, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = self.link.lock();
        link.generation += 1;
        link.outgoing = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        (link.generation, rx)
    }

    /// Clear the connection state if `generation` is still current
    ///
    /// `Disconnected` is sent under the lock so it cannot overtake the
    /// `Connected` of a newer socket.
    fn retire(&self, generation: u64, reason: Option<String>, events: &EventSink) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            tracing::debug!("Socket generation {} was replaced", generation);
            return false;
        }
        link.outgoing = None;
        self.connected.store(false, Ordering::SeqCst);
        self.pending.clear();
        let _ = events.send(TransportEvent::Disconnected { reason });
        true
    }
}

/// Held while a connect loop runs
struct ConnectingGuard {
    shared: Arc<Shared>,
}

impl ConnectingGuard {
    fn acquire(shared: &Arc<Shared>) -> Option<Self> {
        shared
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { shared: shared.clone() })
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.shared.connecting.store(false, Ordering::SeqCst);
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
struct Settings {
    url: Url,
    max_attempts: u32,
    retry_delay: Duration,
    auto_reconnect: bool,
}

impl Settings {
    /// Backoff before attempt `attempt + 1`, capped at five times the base
    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        let factor = (attempt as f64 + jitter).min(5.0);
        self.retry_delay.mul_f64(factor)
    }

    /// Try up to `max_attempts` times, reporting each failure
    async fn open(&self, events: &EventSink) -> ConnectionResult<Socket> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            tracing::info!("Connecting to {} (attempt {}/{})", self.url, attempt, self.max_attempts);

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                    let _ = events.send(TransportEvent::ConnectError(last_error.clone()));
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(ConnectionError::ConnectFailed {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}

/// WebSocket client with bounded connect retries
///
/// A connection lost without [`Transport::disconnect`] is re-established with
/// the same retry budget.
pub struct WebSocketTransport {
    settings: Settings,
    shared: Arc<Shared>,
    next_ack: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(url: Url, max_attempts: u32) -> Self {
        Self {
            settings: Settings {
                url,
                max_attempts: max_attempts.max(1),
                retry_delay: Duration::from_secs(1),
                auto_reconnect: true,
            },
            shared: Arc::new(Shared::default()),
            next_ack: AtomicU64::new(1),
        }
    }

    /// Builder: base delay between connect attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.settings.retry_delay = delay;
        self
    }

    /// Builder: whether a dropped connection is re-established (default: yes)
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.settings.auto_reconnect = enabled;
        self
    }

    pub fn url(&self) -> &Url {
        &self.settings.url
    }

    fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let link = self.shared.link.lock();
        let tx = link.outgoing.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(envelope).map_err(|_| ConnectionError::Closed)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, events: EventSink) -> ConnectionResult<()> {
        let Some(guard) = ConnectingGuard::acquire(&self.shared) else {
            return Err(ConnectionError::InProgress);
        };

        let stream = self.settings.open(&events).await?;
        let (generation, outgoing) = self.shared.install();
        let _ = events.send(TransportEvent::Connected);
        drop(guard);

        tokio::spawn(supervise(
            self.settings.clone(),
            self.shared.clone(),
            stream,
            outgoing,
            generation,
            events,
        ));
        Ok(())
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        // Dropping the sender makes the socket task close the connection
        let sender = self.shared.link.lock().outgoing.take();
        if sender.is_none() {
            return Err(ConnectionError::NotConnected);
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn emit(&self, event: &str, data: Value) -> ConnectionResult<()> {
        self.send(Envelope {
            event: event.to_string(),
            data,
            ack_id: None,
        })
    }

    fn request(&self, event: &str, data: Value) -> ConnectionResult<oneshot::Receiver<Value>> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        let sent = self.send(Envelope {
            event: event.to_string(),
            data,
            ack_id: Some(id),
        });
        if let Err(e) = sent {
            self.shared.pending.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::SeqCst)
    }
}

/// Run sockets until the client disconnects or reconnecting gives up
async fn supervise(
    settings: Settings,
    shared: Arc<Shared>,
    mut stream: Socket,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
    mut generation: u64,
    events: EventSink,
) {
    loop {
        let end = run_socket(stream, outgoing, &shared, &events).await;
        if !shared.retire(generation, end.reason, &events) {
            return;
        }
        if end.by_client || !settings.auto_reconnect {
            return;
        }

        let Some(_guard) = ConnectingGuard::acquire(&shared) else {
            return;
        };
        tracing::info!("Connection to {} lost, reconnecting", settings.url);
        let _ = events.send(TransportEvent::Reconnecting);

        match settings.open(&events).await {
            Ok(next) => {
                (generation, outgoing) = shared.install();
                stream = next;
                let _ = events.send(TransportEvent::Connected);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Giving up on reconnecting");
                return;
            }
        }
    }
}

struct SocketEnd {
    reason: Option<String>,
    by_client: bool,
}

/// Own one socket until either side closes it
async fn run_socket(
    stream: Socket,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
    shared: &Shared,
    events: &EventSink,
) -> SocketEnd {
    let (mut sink, mut stream) = stream.split();

    loop {
        tokio::select! {
            envelope = outgoing.recv() => {
                let Some(envelope) = envelope else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SocketEnd {
                        reason: Some("client disconnect".to_string()),
                        by_client: true,
                    };
                };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to encode {}: {}", envelope.event, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    return SocketEnd { reason: Some(e.to_string()), by_client: false };
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => handle_frame(text.as_str(), shared, events),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = sink.send(WsMessage::Pong(data)).await {
                            tracing::error!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!("WebSocket closed by server");
                        let reason = frame.map(|f| f.reason.as_str().to_string());
                        return SocketEnd { reason, by_client: false };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return SocketEnd { reason: Some(e.to_string()), by_client: false };
                    }
                    None => return SocketEnd { reason: None, by_client: false },
                }
            }
        }
    }
}

fn handle_frame(text: &str, shared: &Shared, events: &EventSink) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Ignoring malformed frame: {} - {}", e, text);
            return;
        }
    };

    if envelope.event == ACK_EVENT {
        let waiter = envelope.ack_id.and_then(|id| shared.pending.remove(&id));
        match waiter {
            Some((_, reply)) => {
                let _ = reply.send(envelope.data);
            }
            None => tracing::debug!("Ack {:?} has no waiter", envelope.ack_id),
        }
        return;
    }

    let _ = events.send(TransportEvent::Event {
        name: envelope.event,
        data: envelope.data,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("http://localhost:3000", "/api/socket").unwrap().as_str(),
            "ws://localhost:3000/api/socket"
        );
        assert_eq!(
            socket_url("https://chat.example.com", "/api/socket").unwrap().as_str(),
            "wss://chat.example.com/api/socket"
        );
        assert!(socket_url("ftp://example.com", "/x").is_err());
        assert!(socket_url("not a url", "/x").is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope {
            event: "get_channel_details".into(),
            data: json!("general"),
            ack_id: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"event": "get_channel_details", "data": "general", "ackId": 3})
        );
    }

    #[test]
    fn test_frames_route_to_events_and_acks() {
        let shared = Shared::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ack_tx, mut ack_rx) = oneshot::channel();
        shared.pending.insert(7, ack_tx);

        handle_frame(r#"{"event":"new_message","data":{"content":"hi"}}"#, &shared, &tx);
        handle_frame(r#"{"event":"ack","ackId":7,"data":{"active":true}}"#, &shared, &tx);
        handle_frame("garbage", &shared, &tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::event("new_message", json!({"content": "hi"}))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(ack_rx.try_recv().unwrap(), json!({"active": true}));
        assert!(shared.pending.is_empty());
    }

    #[tokio::test]
    async fn test_emit_requires_connection() {
        let transport = WebSocketTransport::new(socket_url("http://localhost:1", "/s").unwrap(), 1);
        assert!(matches!(
            transport.emit("message", json!({})),
            Err(ConnectionError::NotConnected)
        ));
        assert!(transport.request("get_channel_details", json!("general")).is_err());
        assert!(transport.shared.pending.is_empty());
    }

    #[tokio::test]
    async fn test_connect_reports_each_failure() {
        let transport = WebSocketTransport::new(socket_url("http://127.0.0.1:1", "/s").unwrap(), 2)
            .with_retry_delay(Duration::from_millis(1));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = transport.connect(tx).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { attempts: 2, .. }));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::ConnectError(_)));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::ConnectError(_)));
        assert!(!transport.is_connected());
    }

    async fn local_server() -> (String, mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        (format!("http://{}", addr), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_text(socket: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return text.as_str().to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_overlapping_connect_is_refused() {
        let (url, mut sockets) = local_server().await;
        let transport = WebSocketTransport::new(socket_url(&url, "/s").unwrap(), 1).with_auto_reconnect(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (first, second) = tokio::join!(transport.connect(tx.clone()), transport.connect(tx));
        assert!(first.is_ok());
        assert!(matches!(second, Err(ConnectionError::InProgress)));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert!(!transport.is_connecting());

        let mut server = sockets.recv().await.unwrap();
        transport.emit("register", json!({"botId": "b"})).unwrap();
        assert!(next_text(&mut server).await.contains("register"));
    }

    #[tokio::test]
    async fn test_replaced_socket_does_not_clear_state() {
        let (url, mut sockets) = local_server().await;
        let transport = WebSocketTransport::new(socket_url(&url, "/s").unwrap(), 1).with_auto_reconnect(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.connect(tx.clone()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        let _old = sockets.recv().await.unwrap();

        transport.connect(tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        let mut current = sockets.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(transport.is_connected());
        transport.emit("message", json!({"content": "still here"})).unwrap();
        assert!(next_text(&mut current).await.contains("still here"));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_reestablished() {
        let (url, mut sockets) = local_server().await;
        let transport = WebSocketTransport::new(socket_url(&url, "/s").unwrap(), 3)
            .with_retry_delay(Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.connect(tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        let mut first = sockets.recv().await.unwrap();
        first.close(None).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Disconnected { .. }));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Reconnecting);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert!(transport.is_connected());

        let mut second = sockets.recv().await.unwrap();
        transport.emit("register", json!({"botId": "b"})).unwrap();
        assert!(next_text(&mut second).await.contains("register"));
    }

    #[tokio::test]
    async fn test_client_disconnect_does_not_reconnect() {
        let (url, mut sockets) = local_server().await;
        let transport = WebSocketTransport::new(socket_url(&url, "/s").unwrap(), 3);
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.connect(tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        let _server = sockets.recv().await.unwrap();

        transport.disconnect().await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected {
                reason: Some("client disconnect".to_string())
            }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!transport.is_connected());
    }
}
