//! Broadcast-group transport.
//!
//! Every [`BroadcastTransport`] joined to the same group of a
//! [`BroadcastHub`] sees every other member's messages. A member never
//! receives its own frames. The hub is passed in explicitly, so separate
//! hubs are fully isolated from each other.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Envelope, HandlerRegistry, Transport, TransportStats, TransportStatus, TransportSubscription};
use crate::channel::ChannelName;
use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::message::Message;

const KIND: &str = "broadcast";

/// Frames buffered per group before slow members start lagging.
pub const DEFAULT_GROUP_CAPACITY: usize = 1000;

type Frame = Arc<Envelope>;

/// Named broadcast groups shared by cooperating transports.
#[derive(Clone)]
pub struct BroadcastHub {
    groups: Arc<DashMap<String, broadcast::Sender<Frame>>>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GROUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn join(&self, group: &str) -> (broadcast::Sender<Frame>, broadcast::Receiver<Frame>) {
        let sender = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let receiver = sender.subscribe();
        (sender, receiver)
    }

    /// Live members of a group.
    pub fn member_count(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

pub struct BroadcastTransport {
    hub: BroadcastHub,
    group: String,
    sender_id: String,
    registry: Arc<HandlerRegistry>,
    status: Mutex<TransportStatus>,
    sender: Mutex<Option<broadcast::Sender<Frame>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    message_count: AtomicU64,
}

impl BroadcastTransport {
    pub fn new(hub: BroadcastHub, group: impl Into<String>) -> Self {
        Self::with_sender_id(hub, group, format!("bc-{}", Uuid::new_v4()))
    }

    pub fn with_sender_id(hub: BroadcastHub, group: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            hub,
            group: group.into(),
            sender_id: sender_id.into(),
            registry: Arc::new(HandlerRegistry::default()),
            status: Mutex::new(TransportStatus::Uninitialized),
            sender: Mutex::new(None),
            listener: Mutex::new(None),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.registry = Arc::new(HandlerRegistry::new(timeout));
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.lock()
    }
}

async fn listen(mut receiver: broadcast::Receiver<Frame>, registry: Arc<HandlerRegistry>, own_id: String) {
    loop {
        match receiver.recv().await {
            Ok(frame) => {
                if frame.sender == own_id {
                    continue;
                }
                registry
                    .deliver(Arc::new(frame.message.clone()), frame.channel)
                    .await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(sender = %own_id, skipped, "Broadcast member lagging, frames skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let mut status = self.status.lock();
        match *status {
            TransportStatus::Destroyed => return Err(TransportError::Destroyed { kind: KIND }),
            TransportStatus::Active => return Ok(()),
            _ => {}
        }

        let (sender, receiver) = self.hub.join(&self.group);
        let handle = tokio::spawn(listen(receiver, self.registry.clone(), self.sender_id.clone()));
        *self.sender.lock() = Some(sender);
        *self.listener.lock() = Some(handle);
        *status = TransportStatus::Active;

        info!(group = %self.group, sender = %self.sender_id, "Joined broadcast group");
        Ok(())
    }

    /// Returns the number of other group members the frame reached.
    async fn send(&self, message: Arc<Message>, channel: ChannelName) -> Result<usize, TransportError> {
        match self.status() {
            TransportStatus::Active => {}
            TransportStatus::Destroyed => return Err(TransportError::Destroyed { kind: KIND }),
            _ => return Err(TransportError::NotInitialized { kind: KIND }),
        }
        let Some(sender) = self.sender.lock().clone() else {
            return Err(TransportError::NotInitialized { kind: KIND });
        };

        self.message_count.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Envelope::new(&message, channel, self.sender_id.as_str()));
        match sender.send(frame) {
            // Our own listener is one of the receivers.
            Ok(receivers) => Ok(receivers.saturating_sub(1)),
            Err(_) => {
                debug!(group = %self.group, "Frame dropped (no receivers)");
                Ok(0)
            }
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
        stats.endpoint = Some(self.group.clone());
        stats
    }

    async fn destroy(&self) {
        *self.status.lock() = TransportStatus::Destroyed;
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.sender.lock().take();
        self.registry.clear();
        debug!(group = %self.group, sender = %self.sender_id, "Left broadcast group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::message_handler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn forwarding(tx: mpsc::Sender<Arc<Message>>) -> Arc<dyn MessageHandler> {
        Arc::new(message_handler(move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg).await;
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn test_peers_receive_but_sender_does_not() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::with_sender_id(hub.clone(), "void", "a");
        let b = BroadcastTransport::with_sender_id(hub.clone(), "void", "b");
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        assert_eq!(hub.member_count("void"), 2);

        let own_hits = Arc::new(AtomicUsize::new(0));
        let own = own_hits.clone();
        a.subscribe(
            Arc::new(message_handler(move |_msg| {
                let own = own.clone();
                async move {
                    own.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
            ChannelName::Default,
        );
        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(forwarding(tx), ChannelName::Default);

        let msg = Message::notice("layout.changed", json!({"w": 3}));
        let reached = a.send(Arc::new(msg.clone()), ChannelName::Default).await.unwrap();
        assert_eq!(reached, 1);

        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(*received, msg);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(own_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_separate_groups_are_isolated() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::new(hub.clone(), "alpha");
        let b = BroadcastTransport::new(hub.clone(), "beta");
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(forwarding(tx), ChannelName::Default);

        let reached = a
            .send(Arc::new(Message::notice("x", json!(null))), ChannelName::Default)
            .await
            .unwrap();
        assert_eq!(reached, 0);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert_eq!(hub.group_count(), 2);
    }

    #[tokio::test]
    async fn test_channels_are_respected() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::new(hub.clone(), "g");
        let b = BroadcastTransport::new(hub.clone(), "g");
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(forwarding(tx), ChannelName::Proposal);

        a.send(Arc::new(Message::notice("n", json!(null))), ChannelName::Notice)
            .await
            .unwrap();
        a.send(Arc::new(Message::proposal("p", json!(null))), ChannelName::Proposal)
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.message_type(), "p");
    }

    #[tokio::test]
    async fn test_destroy_leaves_group() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::new(hub.clone(), "g");
        a.initialize().await.unwrap();
        assert_eq!(hub.member_count("g"), 1);

        a.destroy().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.member_count("g"), 0);
        assert!(matches!(
            a.send(Arc::new(Message::notice("x", json!(null))), ChannelName::Default)
                .await,
            Err(TransportError::Destroyed { .. })
        ));
    }
}
