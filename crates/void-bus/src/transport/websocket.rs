//! WebSocket transport.
//!
//! Messages travel as JSON [`Envelope`] frames. Outbound frames go through a
//! bounded queue drained by a background connection task, so `send` never
//! waits on the network. While the connection is being re-established the
//! queue keeps filling and is flushed once the socket is back.
//!
//! Inbound frames are handed to a separate delivery task, so slow handlers
//! never hold up writes or pongs. Frames carrying this transport's own
//! `sender_id` are skipped.
//!
//! `send` cannot see remote handlers: it reports `1` when the frame was
//! queued and `0` when the queue was full and the frame dropped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Envelope, HandlerRegistry, Transport, TransportStats, TransportStatus, TransportSubscription};
use crate::channel::ChannelName;
use crate::config::{ConfigError, DEFAULT_HANDLER_TIMEOUT_MS};
use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::message::Message;

const KIND: &str = "websocket";

/// Reconnection attempts before the transport gives up for good.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Frames buffered while the socket is busy or reconnecting.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Maximum delay between reconnection attempts.
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub url: String,
    /// Written into every outbound envelope.
    pub sender_id: String,
    pub max_reconnect_attempts: u32,
    pub outbound_capacity: usize,
    pub handler_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            sender_id: format!("ws-{}", Uuid::new_v4()),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
        }
    }
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "url".into(),
                value: self.url.clone(),
            });
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "outbound_capacity cannot be 0".into(),
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "handler_timeout_ms cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Delay before reconnection attempt `attempt` (1-based): 2^attempt seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .min(MAX_RECONNECT_DELAY_SECS);
    Duration::from_secs(secs)
}

/// State shared with the connection task.
struct Shared {
    status: Mutex<TransportStatus>,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
}

impl Shared {
    fn status(&self) -> TransportStatus {
        *self.status.lock()
    }

    /// Destroyed is terminal; the task cannot move out of it.
    fn set_status(&self, next: TransportStatus) {
        let mut status = self.status.lock();
        if *status != TransportStatus::Destroyed {
            *status = next;
        }
    }
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    registry: Arc<HandlerRegistry>,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
    init_lock: tokio::sync::Mutex<()>,
    message_count: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = HandlerRegistry::new(Duration::from_millis(config.handler_timeout_ms));
        Ok(Self {
            config,
            registry: Arc::new(registry),
            shared: Arc::new(Shared {
                status: Mutex::new(TransportStatus::Uninitialized),
                reconnect_attempts: AtomicU32::new(0),
                frames_received: AtomicU64::new(0),
            }),
            outbound: Mutex::new(None),
            shutdown: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            message_count: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected {
            endpoint: self.config.url.clone(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let _guard = self.init_lock.lock().await;
        match self.status() {
            TransportStatus::Active | TransportStatus::Reconnecting => return Ok(()),
            TransportStatus::Destroyed => return Err(TransportError::Destroyed { kind: KIND }),
            TransportStatus::Disconnected => return Err(self.disconnected()),
            TransportStatus::Uninitialized => {}
        }

        let (ws_stream, _) =
            connect_async(self.config.url.as_str())
                .await
                .map_err(|e| TransportError::Connection {
                    endpoint: self.config.url.clone(),
                    reason: e.to_string(),
                })?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.outbound_capacity);
        *self.outbound.lock() = Some(outbound_tx);
        *self.shutdown.lock() = Some(shutdown_tx);
        self.shared.set_status(TransportStatus::Active);

        let task = ConnectionTask {
            url: self.config.url.clone(),
            sender_id: self.config.sender_id.clone(),
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            shared: self.shared.clone(),
            inbound_tx,
            outbound_rx,
            shutdown_rx,
        };
        tokio::spawn(deliver_inbound(self.registry.clone(), inbound_rx));
        tokio::spawn(task.run(ws_stream));

        info!(endpoint = %self.config.url, sender = %self.config.sender_id, "WebSocket transport connected");
        Ok(())
    }

    async fn send(&self, message: Arc<Message>, channel: ChannelName) -> Result<usize, TransportError> {
        match self.status() {
            TransportStatus::Active | TransportStatus::Reconnecting => {}
            TransportStatus::Uninitialized => return Err(TransportError::NotInitialized { kind: KIND }),
            TransportStatus::Destroyed => return Err(TransportError::Destroyed { kind: KIND }),
            TransportStatus::Disconnected => return Err(self.disconnected()),
        }

        let frame = Envelope::new(&message, channel, self.config.sender_id.as_str()).to_json()?;
        let Some(outbound) = self.outbound.lock().clone() else {
            return Err(TransportError::NotInitialized { kind: KIND });
        };

        match outbound.try_send(frame) {
            Ok(()) => {
                self.message_count.fetch_add(1, Ordering::Relaxed);
                Ok(1)
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    message_type = %message.message_type(),
                    channel = %channel,
                    capacity = self.config.outbound_capacity,
                    "Outbound queue full, frame dropped"
                );
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => Err(self.disconnected()),
        }
    }

    fn subscribe(&self, handler: Arc<dyn MessageHandler>, channel: ChannelName) -> TransportSubscription {
        let id = self.registry.add(channel, handler);
        TransportSubscription { channel, id }
    }

    fn unsubscribe(&self, subscription: TransportSubscription) -> bool {
        self.registry.remove(subscription.channel, subscription.id)
    }

    fn stats(&self) -> TransportStats {
        let mut stats = TransportStats::from_registry(
            KIND,
            self.status(),
            self.message_count.load(Ordering::Relaxed),
            &self.registry,
        );
        stats.endpoint = Some(self.config.url.clone());
        stats.reconnect_attempts = self.shared.reconnect_attempts.load(Ordering::Relaxed);
        stats
    }

    async fn destroy(&self) {
        *self.shared.status.lock() = TransportStatus::Destroyed;
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.try_send(());
        }
        self.outbound.lock().take();
        self.registry.clear();
        debug!(endpoint = %self.config.url, "WebSocket transport destroyed");
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

/// Runs handlers for inbound envelopes in arrival order. Ends when the
/// connection task drops its side of the queue.
async fn deliver_inbound(registry: Arc<HandlerRegistry>, mut inbound_rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = inbound_rx.recv().await {
        let channel = envelope.channel;
        registry.deliver(Arc::new(envelope.message), channel).await;
    }
}

/// Parses an inbound text frame. Malformed frames and our own echoes yield `None`.
fn accept_frame(text: &str, own_sender: &str, shared: &Shared) -> Option<Envelope> {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Discarding malformed frame");
            return None;
        }
    };
    if envelope.sender == own_sender {
        return None;
    }
    shared.frames_received.fetch_add(1, Ordering::Relaxed);
    Some(envelope)
}

/// Owns the socket, the sending end of the inbound queue and the receiving
/// ends of the outbound and shutdown queues.
struct ConnectionTask {
    url: String,
    sender_id: String,
    max_reconnect_attempts: u32,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<Envelope>,
    outbound_rx: mpsc::Receiver<String>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ConnectionTask {
    async fn run(mut self, first: WsStream) {
        let mut next = Some(first);
        loop {
            let ws_stream = match next.take() {
                Some(ws_stream) => ws_stream,
                None => match self.reconnect().await {
                    Some(ws_stream) => ws_stream,
                    None => return,
                },
            };

            self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
            self.shared.set_status(TransportStatus::Active);

            match self.pump(ws_stream).await {
                PumpExit::Shutdown => {
                    debug!(endpoint = %self.url, "WebSocket connection task stopped");
                    return;
                }
                PumpExit::Lost(reason) => {
                    warn!(endpoint = %self.url, reason = %reason, "WebSocket connection lost");
                    self.shared.set_status(TransportStatus::Reconnecting);
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        loop {
            let attempt = self.shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > self.max_reconnect_attempts {
                error!(
                    endpoint = %self.url,
                    attempts = self.max_reconnect_attempts,
                    "Max reconnection attempts reached, giving up"
                );
                self.shared.set_status(TransportStatus::Disconnected);
                return None;
            }

            let delay = backoff_delay(attempt);
            info!(endpoint = %self.url, attempt, delay_secs = delay.as_secs(), "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => return None,
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!(endpoint = %self.url, attempt, "WebSocket reconnected");
                    return Some(ws_stream);
                }
                Err(e) => warn!(endpoint = %self.url, attempt, error = %e, "Reconnect failed"),
            }
        }
    }

    async fn pump(&mut self, ws_stream: WsStream) -> PumpExit {
        let (mut write, mut read) = ws_stream.split();
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return PumpExit::Shutdown;
                }
                frame = self.outbound_rx.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            return PumpExit::Lost(e.to_string());
                        }
                    }
                    None => return PumpExit::Shutdown,
                },
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.forward(&text),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return PumpExit::Lost("closed by peer".to_string());
                    }
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn forward(&self, text: &str) {
        let Some(envelope) = accept_frame(text, &self.sender_id, &self.shared) else {
            return;
        };
        if let Err(TrySendError::Full(envelope)) = self.inbound_tx.try_send(envelope) {
            warn!(
                endpoint = %self.url,
                message_type = %envelope.message.message_type(),
                "Inbound queue full, frame dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::message_handler;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    /// Re-stamps a client frame as if another node had sent it.
    fn relay_as(text: &str, sender: &str) -> String {
        let mut envelope = Envelope::from_json(text).unwrap();
        envelope.sender = sender.to_string();
        envelope.to_json().unwrap()
    }

    fn shared() -> Shared {
        Shared {
            status: Mutex::new(TransportStatus::Active),
            reconnect_attempts: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(64), Duration::from_secs(60));
    }

    #[test]
    fn test_config_validation() {
        assert!(WebSocketConfig::new("ws://localhost:9000").validate().is_ok());
        assert!(WebSocketConfig::new("http://localhost:9000").validate().is_err());
        assert!(WebSocketConfig::new("ws://localhost:9000")
            .with_outbound_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_accept_frame_skips_own_and_malformed() {
        let shared = shared();
        let own = Envelope::new(&Message::notice("a", json!(1)), ChannelName::Notice, "node-a")
            .to_json()
            .unwrap();
        let peer = relay_as(&own, "node-b");

        assert!(accept_frame(&own, "node-a", &shared).is_none());
        assert!(accept_frame("{not json", "node-a", &shared).is_none());
        let envelope = accept_frame(&peer, "node-a", &shared).unwrap();

        assert_eq!(envelope.sender, "node-b");
        assert_eq!(envelope.message.message_type(), "a");
        assert_eq!(shared.frames_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_before_initialize() {
        let transport = WebSocketTransport::new(WebSocketConfig::new("ws://127.0.0.1:1")).unwrap();
        let result = transport
            .send(Arc::new(Message::notice("a", json!(null))), ChannelName::Default)
            .await;
        assert!(matches!(result, Err(TransportError::NotInitialized { .. })));
    }

    #[tokio::test]
    async fn test_initialize_fails_without_server() {
        let (listener, url) = local_listener().await;
        drop(listener);

        let transport = WebSocketTransport::new(WebSocketConfig::new(url)).unwrap();
        let result = transport.initialize().await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
        assert_eq!(transport.status(), TransportStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_frames_echoed_by_server_reach_handlers() {
        let (listener, url) = local_listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                let WsMessage::Text(text) = frame else { continue };
                let relayed = relay_as(&text, "node-b");
                if ws.send(WsMessage::Text(text)).await.is_err()
                    || ws.send(WsMessage::Text(relayed.into())).await.is_err()
                {
                    break;
                }
            }
        });

        let transport = WebSocketTransport::new(WebSocketConfig::new(url).with_sender_id("node-a")).unwrap();
        transport.initialize().await.unwrap();
        transport.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::channel::<Arc<Message>>(4);
        transport.subscribe(
            Arc::new(message_handler(move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg).await;
                    Ok(())
                }
            })),
            ChannelName::Notice,
        );

        let sent = Message::notice("plugin.heartbeat", json!({"seq": 9}));
        let queued = transport
            .send(Arc::new(sent.clone()), ChannelName::Notice)
            .await
            .unwrap();
        assert_eq!(queued, 1);

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        assert_eq!(*received, sent);
        assert_eq!(transport.frames_received(), 1);
        assert!(rx.try_recv().is_err());

        transport.destroy().await;
        assert_eq!(transport.status(), TransportStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_stuck_handler_does_not_block_pongs() {
        let (listener, url) = local_listener().await;
        let (pong_tx, pong_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut pong_tx = Some(pong_tx);
            while let Some(Ok(frame)) = ws.next().await {
                match frame {
                    WsMessage::Text(text) => {
                        let relayed = relay_as(&text, "node-b");
                        ws.send(WsMessage::Text(relayed.into())).await.unwrap();
                        ws.send(WsMessage::Ping(vec![7u8].into())).await.unwrap();
                    }
                    WsMessage::Pong(_) => {
                        if let Some(tx) = pong_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    _ => {}
                }
            }
        });

        let transport = WebSocketTransport::new(
            WebSocketConfig::new(url)
                .with_sender_id("node-a")
                .with_handler_timeout(Duration::from_secs(60)),
        )
        .unwrap();
        transport.initialize().await.unwrap();

        let (entered_tx, mut entered_rx) = mpsc::channel::<()>(1);
        transport.subscribe(
            Arc::new(message_handler(move |_msg| {
                let entered_tx = entered_tx.clone();
                async move {
                    let _ = entered_tx.send(()).await;
                    std::future::pending::<()>().await;
                    Ok(())
                }
            })),
            ChannelName::Default,
        );

        transport
            .send(Arc::new(Message::notice("slow", json!(null))), ChannelName::Default)
            .await
            .unwrap();

        timeout(Duration::from_secs(5), entered_rx.recv())
            .await
            .expect("handler never ran");
        timeout(Duration::from_secs(5), pong_rx)
            .await
            .expect("pong stalled behind a running handler")
            .unwrap();

        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_reconnect_budget() {
        let (listener, url) = local_listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });

        let transport = WebSocketTransport::new(
            WebSocketConfig::new(url).with_max_reconnect_attempts(0),
        )
        .unwrap();
        transport.initialize().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while transport.status() != TransportStatus::Disconnected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transport never reported Disconnected");

        let result = transport
            .send(Arc::new(Message::notice("a", json!(null))), ChannelName::Default)
            .await;
        assert!(matches!(result, Err(TransportError::Disconnected { .. })));
    }
}
