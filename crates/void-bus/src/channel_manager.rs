//! Channel manager: owns the live transport and every subscription.
//!
//! ## Responsibilities
//!
//! - Lazy, single-flight transport initialization
//! - Routing each message to one virtual channel
//! - Tracking subscriptions so they survive transport swaps and mode changes
//! - Aggregated per-channel statistics
//!
//! Lock order is `subscriptions`, `taps`, `mode`, then `live`. No lock is
//! held across an await point.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::channel::{ChannelMode, ChannelName};
use crate::config::DEFAULT_HANDLER_TIMEOUT_MS;
use crate::error::TransportError;
use crate::handler::{MessageHandler, TypeFilter};
use crate::message::Message;
use crate::transport::{InProcessTransport, Transport, TransportStats, TransportSubscription};

/// Identifier of a subscription made through the channel manager.
pub type SubscriptionId = u64;

/// A transport plus its one-shot initialization state.
struct LiveTransport {
    transport: Arc<dyn Transport>,
    ready: OnceCell<()>,
    generation: u64,
}

impl LiveTransport {
    fn new(transport: Arc<dyn Transport>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            transport,
            ready: OnceCell::new(),
            generation,
        })
    }

    async fn ensure_ready(&self) -> Result<(), TransportError> {
        self.ready
            .get_or_try_init(|| async {
                self.transport.initialize().await?;
                info!(
                    transport = self.transport.kind(),
                    generation = self.generation,
                    "Transport ready"
                );
                Ok::<(), TransportError>(())
            })
            .await?;
        Ok(())
    }
}

struct TrackedSubscription {
    id: SubscriptionId,
    handler: Arc<dyn MessageHandler>,
    attachments: Vec<TransportSubscription>,
}

fn attach(transport: &dyn Transport, handler: &Arc<dyn MessageHandler>, mode: ChannelMode) -> Vec<TransportSubscription> {
    mode.channels()
        .iter()
        .map(|channel| transport.subscribe(handler.clone(), *channel))
        .collect()
}

/// Internal handler pinned to fixed channels. Not counted as a subscription.
struct Tap {
    handler: Arc<dyn MessageHandler>,
    channels: &'static [ChannelName],
    attachments: Vec<TransportSubscription>,
}

fn attach_tap(transport: &dyn Transport, tap: &Tap) -> Vec<TransportSubscription> {
    tap.channels
        .iter()
        .map(|channel| transport.subscribe(tap.handler.clone(), *channel))
        .collect()
}

fn detach(transport: &dyn Transport, attachments: &[TransportSubscription]) {
    for attachment in attachments {
        transport.unsubscribe(*attachment);
    }
}

/// Aggregate view of one virtual channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualChannelStats {
    pub name: ChannelName,
    pub message_types: usize,
    pub total_subscribers: usize,
    pub message_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelManagerStats {
    pub mode: ChannelMode,
    pub transport: TransportStats,
    pub channels: Vec<VirtualChannelStats>,
    pub total_message_types: usize,
    pub total_subscribers: usize,
    pub total_messages: u64,
}

pub struct ChannelManager {
    live: RwLock<Arc<LiveTransport>>,
    mode: RwLock<ChannelMode>,
    subscriptions: RwLock<HashMap<String, Vec<TrackedSubscription>>>,
    taps: RwLock<Vec<Tap>>,
    next_subscription: AtomicU64,
    generation: AtomicU64,
    swap_lock: tokio::sync::Mutex<()>,
    handler_timeout: Duration,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, mode: ChannelMode) -> Self {
        Self {
            live: RwLock::new(LiveTransport::new(transport, 0)),
            mode: RwLock::new(mode),
            subscriptions: RwLock::new(HashMap::new()),
            taps: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            swap_lock: tokio::sync::Mutex::new(()),
            handler_timeout: Duration::from_millis(DEFAULT_HANDLER_TIMEOUT_MS),
        }
    }

    /// Timeout given to the in-process transport installed by [`reset`](Self::reset).
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    fn live(&self) -> Arc<LiveTransport> {
        self.live.read().clone()
    }

    /// Initialize the live transport. Concurrent callers share one attempt;
    /// a failed attempt can be retried.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        self.live().ensure_ready().await
    }

    pub fn mode(&self) -> ChannelMode {
        *self.mode.read()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.live().transport.clone()
    }

    pub fn select_channel_name(&self, message: &Message) -> ChannelName {
        self.mode().select(message)
    }

    /// Attach an internal handler to `channels` of the live transport and of
    /// every transport installed later, including after [`reset`](Self::reset).
    pub(crate) fn add_tap(&self, handler: Arc<dyn MessageHandler>, channels: &'static [ChannelName]) {
        let mut taps = self.taps.write();
        let mut tap = Tap {
            handler,
            channels,
            attachments: Vec::new(),
        };
        let live = self.live();
        tap.attachments = attach_tap(live.transport.as_ref(), &tap);
        taps.push(tap);
    }

    /// Deliver `handler` for every message of `message_type`.
    pub async fn subscribe(
        self: &Arc<Self>,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError> {
        self.initialize().await?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let filtered: Arc<dyn MessageHandler> = Arc::new(TypeFilter::new(message_type, handler));
        {
            let mut subscriptions = self.subscriptions.write();
            let mode = *self.mode.read();
            let live = self.live();
            let attachments = attach(live.transport.as_ref(), &filtered, mode);
            subscriptions
                .entry(message_type.to_string())
                .or_default()
                .push(TrackedSubscription {
                    id,
                    handler: filtered,
                    attachments,
                });
        }

        debug!(message_type, subscription = id, "Subscribed");
        Ok(Subscription {
            id,
            message_type: message_type.to_string(),
            manager: Arc::downgrade(self),
        })
    }

    /// Returns false if the subscription is already gone.
    pub fn unsubscribe(&self, message_type: &str, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(list) = subscriptions.get_mut(message_type) else {
            return false;
        };
        let Some(index) = list.iter().position(|tracked| tracked.id == id) else {
            return false;
        };
        let tracked = list.remove(index);
        if list.is_empty() {
            subscriptions.remove(message_type);
        }

        let live = self.live();
        detach(live.transport.as_ref(), &tracked.attachments);
        debug!(message_type, subscription = id, "Unsubscribed");
        true
    }

    /// Send a message on the channel chosen by the current mode.
    ///
    /// A message without a routable type is rejected with a warning and
    /// reaches nobody.
    pub async fn publish(&self, message: Arc<Message>) -> Result<usize, TransportError> {
        if !message.has_routable_type() {
            warn!(
                message_id = %message.id(),
                category = %message.category(),
                "Rejected message with missing type"
            );
            return Ok(0);
        }

        self.initialize().await?;
        let channel = self.select_channel_name(&message);
        let live = self.live();
        let delivered = live.transport.send(message.clone(), channel).await?;
        debug!(
            message_type = %message.message_type(),
            channel = %channel,
            delivered,
            "Published"
        );
        Ok(delivered)
    }

    /// Replace the live transport.
    ///
    /// The new transport is initialized first; if that fails the old one
    /// stays in place. Every tracked subscription is then re-attached to
    /// the new transport and the old one is destroyed.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        let _swap = self.swap_lock.lock().await;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let next = LiveTransport::new(transport, generation);
        next.ensure_ready().await?;

        let (previous, reattached) = {
            let mut subscriptions = self.subscriptions.write();
            let mut taps = self.taps.write();
            let mode = *self.mode.read();
            let previous = std::mem::replace(&mut *self.live.write(), next.clone());
            let mut reattached = 0;
            for tracked in subscriptions.values_mut().flatten() {
                tracked.attachments = attach(next.transport.as_ref(), &tracked.handler, mode);
                reattached += 1;
            }
            for tap in taps.iter_mut() {
                tap.attachments = attach_tap(next.transport.as_ref(), tap);
            }
            (previous, reattached)
        };

        previous.transport.destroy().await;
        info!(
            from = previous.transport.kind(),
            to = next.transport.kind(),
            generation,
            reattached,
            "Transport swapped"
        );
        Ok(())
    }

    /// Switch routing mode, moving every subscription to the new channel set.
    pub fn set_mode(&self, mode: ChannelMode) {
        let mut subscriptions = self.subscriptions.write();
        let mut current = self.mode.write();
        if *current == mode {
            return;
        }
        *current = mode;

        let live = self.live();
        for tracked in subscriptions.values_mut().flatten() {
            detach(live.transport.as_ref(), &tracked.attachments);
            tracked.attachments = attach(live.transport.as_ref(), &tracked.handler, mode);
        }
        info!(mode = %mode, "Channel mode changed");
    }

    pub fn enable_multi_channel(&self) {
        self.set_mode(ChannelMode::MultiChannel);
    }

    pub fn disable_multi_channel(&self) {
        self.set_mode(ChannelMode::SingleChannel);
    }

    /// Message types with at least one subscription, sorted.
    pub fn tracked_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn subscriber_count(&self, message_type: &str) -> usize {
        self.subscriptions
            .read()
            .get(message_type)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> ChannelManagerStats {
        let (total_message_types, total_subscribers) = {
            let subscriptions = self.subscriptions.read();
            (
                subscriptions.len(),
                subscriptions.values().map(Vec::len).sum::<usize>(),
            )
        };
        let mode = self.mode();
        let transport = self.live().transport.stats();
        let total_messages = transport.message_count;

        let channels = match mode {
            ChannelMode::SingleChannel => vec![VirtualChannelStats {
                name: ChannelName::Default,
                message_types: total_message_types,
                total_subscribers,
                message_count: total_messages,
            }],
            ChannelMode::MultiChannel => {
                let n = ChannelName::ALL.len();
                let share = |total: usize| total.div_ceil(n);
                ChannelName::ALL
                    .into_iter()
                    .map(|name| VirtualChannelStats {
                        name,
                        message_types: share(total_message_types),
                        total_subscribers: share(total_subscribers),
                        message_count: total_messages.div_ceil(n as u64),
                    })
                    .collect()
            }
        };

        ChannelManagerStats {
            mode,
            transport,
            channels,
            total_message_types,
            total_subscribers,
            total_messages,
        }
    }

    /// Drop every subscription and start over on a fresh in-process transport.
    pub async fn reset(&self) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.write();
            let live = self.live();
            for tracked in subscriptions.values().flatten() {
                detach(live.transport.as_ref(), &tracked.attachments);
            }
            subscriptions.clear();
        }
        let fresh = InProcessTransport::with_handler_timeout(self.handler_timeout);
        self.set_transport(Arc::new(fresh)).await
    }

    pub async fn shutdown(&self) {
        let live = self.live();
        live.transport.destroy().await;
        info!(transport = live.transport.kind(), "Channel manager shut down");
    }
}

/// Handle returned by [`ChannelManager::subscribe`].
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    message_type: String,
    manager: Weak<ChannelManager>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns true the first time, false afterwards.
    pub fn unsubscribe(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| manager.unsubscribe(&self.message_type, self.id))
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("mode", &self.mode())
            .field("transport", &self.live().transport.kind())
            .field("tracked_types", &self.tracked_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::handler::message_handler;
    use crate::message::CorrelationId;
    use crate::transport::TransportStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager(mode: ChannelMode) -> Arc<ChannelManager> {
        Arc::new(ChannelManager::new(Arc::new(InProcessTransport::new()), mode))
    }

    fn counting(hits: &Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        let hits = hits.clone();
        Arc::new(message_handler(move |_msg| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    /// Transport wrapper counting how often `initialize` really runs.
    struct CountingInit {
        inner: InProcessTransport,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingInit {
        fn new(fail: bool) -> Self {
            Self {
                inner: InProcessTransport::new(),
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Transport for CountingInit {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn initialize(&self) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(TransportError::Connection {
                    endpoint: "test".into(),
                    reason: "refused".into(),
                });
            }
            self.inner.initialize().await
        }

        async fn send(&self, message: Arc<Message>, channel: ChannelName) -> Result<usize, TransportError> {
            self.inner.send(message, channel).await
        }

        fn subscribe(&self, handler: Arc<dyn MessageHandler>, channel: ChannelName) -> TransportSubscription {
            self.inner.subscribe(handler, channel)
        }

        fn unsubscribe(&self, subscription: TransportSubscription) -> bool {
            self.inner.unsubscribe(subscription)
        }

        fn stats(&self) -> TransportStats {
            self.inner.stats()
        }

        async fn destroy(&self) {
            self.inner.destroy().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_initialize_runs_once() {
        let transport = Arc::new(CountingInit::new(false));
        let manager = Arc::new(ChannelManager::new(transport.clone(), ChannelMode::SingleChannel));

        let (a, b, c) = tokio::join!(manager.initialize(), manager.initialize(), manager.initialize());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        manager.initialize().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_retry() {
        let transport = Arc::new(CountingInit::new(true));
        let manager = Arc::new(ChannelManager::new(transport.clone(), ChannelMode::SingleChannel));

        assert!(manager.initialize().await.is_err());
        assert!(manager.initialize().await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_type() {
        let manager = manager(ChannelMode::SingleChannel);
        let wanted = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));
        manager.subscribe("plugin.ready", counting(&wanted)).await.unwrap();
        manager.subscribe("plugin.gone", counting(&other)).await.unwrap();

        let delivered = manager
            .publish(Arc::new(Message::notice("plugin.ready", json!({}))))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(wanted.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_type_reaches_nobody() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("", counting(&hits)).await.unwrap();

        let delivered = manager
            .publish(Arc::new(Message::notice("  ", json!(null))))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_still_counted() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("evt", counting(&hits)).await.unwrap();
        manager
            .subscribe(
                "evt",
                Arc::new(message_handler(|_msg| async {
                    Err::<(), BoxError>("nope".into())
                })),
            )
            .await
            .unwrap();
        manager.subscribe("evt", counting(&hits)).await.unwrap();

        let delivered = manager
            .publish(Arc::new(Message::notice("evt", json!(null))))
            .await
            .unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_multi_channel_delivers_once() {
        let manager = manager(ChannelMode::MultiChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("evt", counting(&hits)).await.unwrap();

        assert_eq!(manager.transport().stats().total_subscribers, 5);
        for msg in [
            Message::notice("evt", json!(null)),
            Message::proposal("evt", json!(null)),
            Message::intent_request("evt", json!(null)),
        ] {
            assert_eq!(manager.publish(Arc::new(msg)).await.unwrap(), 1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_handle() {
        let manager = manager(ChannelMode::MultiChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = manager.subscribe("evt", counting(&hits)).await.unwrap();
        assert_eq!(manager.subscriber_count("evt"), 1);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(manager.subscriber_count("evt"), 0);
        assert!(manager.tracked_types().is_empty());
        assert_eq!(manager.transport().stats().total_subscribers, 0);

        let delivered = manager
            .publish(Arc::new(Message::notice("evt", json!(null))))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_set_transport_keeps_subscriptions() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("evt", counting(&hits)).await.unwrap();
        let old = manager.transport();

        manager
            .set_transport(Arc::new(InProcessTransport::new()))
            .await
            .unwrap();

        assert_eq!(old.stats().status, TransportStatus::Destroyed);
        assert_eq!(manager.transport().stats().status, TransportStatus::Active);
        let delivered = manager
            .publish(Arc::new(Message::notice("evt", json!(null))))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_swap_keeps_old_transport() {
        let manager = manager(ChannelMode::SingleChannel);
        manager.initialize().await.unwrap();
        let before = manager.transport().kind();

        let result = manager.set_transport(Arc::new(CountingInit::new(true))).await;
        assert!(result.is_err());
        assert_eq!(manager.transport().kind(), before);
        assert_eq!(manager.transport().stats().status, TransportStatus::Active);
    }

    #[tokio::test]
    async fn test_mode_switch_moves_subscriptions() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("evt", counting(&hits)).await.unwrap();

        manager.enable_multi_channel();
        assert_eq!(manager.transport().stats().total_subscribers, 5);
        assert_eq!(
            manager.publish(Arc::new(Message::notice("evt", json!(null)))).await.unwrap(),
            1
        );

        manager.disable_multi_channel();
        assert_eq!(manager.transport().stats().total_subscribers, 1);
        assert_eq!(
            manager.publish(Arc::new(Message::proposal("evt", json!(null)))).await.unwrap(),
            1
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stats_single_and_multi() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.subscribe("a", counting(&hits)).await.unwrap();
        manager.subscribe("a", counting(&hits)).await.unwrap();
        manager.subscribe("b", counting(&hits)).await.unwrap();
        manager
            .publish(Arc::new(Message::notice("a", json!(null))))
            .await
            .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.mode, ChannelMode::SingleChannel);
        assert_eq!(stats.channels.len(), 1);
        assert_eq!(stats.total_message_types, 2);
        assert_eq!(stats.total_subscribers, 3);
        assert_eq!(stats.total_messages, 1);

        manager.enable_multi_channel();
        let stats = manager.stats();
        assert_eq!(stats.channels.len(), 5);
        assert!(stats.channels.iter().all(|c| c.total_subscribers == 1));
        assert!(stats.channels.iter().all(|c| c.message_types == 1));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = manager.subscribe("evt", counting(&hits)).await.unwrap();

        manager.reset().await.unwrap();
        assert!(manager.tracked_types().is_empty());
        assert!(!sub.unsubscribe());
        assert_eq!(
            manager.publish(Arc::new(Message::notice("evt", json!(null)))).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_tap_follows_transport_swaps() {
        let manager = manager(ChannelMode::SingleChannel);
        let hits = Arc::new(AtomicUsize::new(0));
        manager.add_tap(counting(&hits), &[ChannelName::Default, ChannelName::IntentResponse]);

        manager
            .publish(Arc::new(Message::notice("any.type", json!(1))))
            .await
            .unwrap();
        manager.set_transport(Arc::new(InProcessTransport::new())).await.unwrap();
        manager.enable_multi_channel();
        manager
            .publish(Arc::new(Message::intent_response("any.type", CorrelationId::new(), json!(2))))
            .await
            .unwrap();
        manager.reset().await.unwrap();
        manager.disable_multi_channel();
        manager
            .publish(Arc::new(Message::notice("any.type", json!(3))))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(manager.tracked_types().is_empty());
        assert_eq!(manager.stats().total_subscribers, 0);
        assert_eq!(manager.transport().stats().total_subscribers, 2);
    }
}
