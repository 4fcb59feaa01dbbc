//! Per-channel handler bookkeeping shared by every transport backend.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::channel::ChannelName;
use crate::config::DEFAULT_HANDLER_TIMEOUT_MS;
use crate::handler::MessageHandler;
use crate::message::Message;

use super::ChannelSubscribers;

/// Identifier of a handler within one registry.
pub type HandlerId = u64;

type Slot = (HandlerId, Arc<dyn MessageHandler>);

/// Channel to handler table with concurrent, failure-isolated delivery.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<ChannelName, Vec<Slot>>>,
    next_id: AtomicU64,
    handler_timeout: Duration,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_HANDLER_TIMEOUT_MS))
    }
}

impl HandlerRegistry {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler_timeout,
            handler_failures: AtomicU64::new(0),
            handler_timeouts: AtomicU64::new(0),
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub fn add(&self, channel: ChannelName, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(channel)
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns false if the handler was already removed.
    pub fn remove(&self, channel: ChannelName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(slots) = handlers.get_mut(&channel) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            handlers.remove(&channel);
        }
        removed
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn count(&self, channel: ChannelName) -> usize {
        self.handlers.read().get(&channel).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Non-empty channels in canonical order.
    pub fn channel_counts(&self) -> Vec<ChannelSubscribers> {
        let handlers = self.handlers.read();
        ChannelName::ALL
            .into_iter()
            .filter_map(|name| {
                handlers
                    .get(&name)
                    .filter(|slots| !slots.is_empty())
                    .map(|slots| ChannelSubscribers {
                        name,
                        subscriber_count: slots.len(),
                    })
            })
            .collect()
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn handler_timeouts(&self) -> u64 {
        self.handler_timeouts.load(Ordering::Relaxed)
    }

    /// Invoke every accepting handler on `channel` concurrently.
    ///
    /// Returns how many handlers accepted the message. A handler that
    /// fails, panics or times out is logged and still counted.
    pub async fn deliver(&self, message: Arc<Message>, channel: ChannelName) -> usize {
        let targets: Vec<Arc<dyn MessageHandler>> = {
            let handlers = self.handlers.read();
            match handlers.get(&channel) {
                Some(slots) => slots
                    .iter()
                    .filter(|(_, handler)| handler.accepts(&message))
                    .map(|(_, handler)| handler.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            return 0;
        }

        let delivered = targets.len();
        join_all(
            targets
                .into_iter()
                .map(|handler| self.invoke(handler, message.clone(), channel)),
        )
        .await;

        debug!(
            message_type = %message.message_type(),
            channel = %channel,
            delivered,
            "Message delivered"
        );
        delivered
    }

    async fn invoke(&self, handler: Arc<dyn MessageHandler>, message: Arc<Message>, channel: ChannelName) {
        let call = AssertUnwindSafe(handler.handle(message.clone())).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_type = %message.message_type(),
                    channel = %channel,
                    error = %e,
                    "Message handler failed"
                );
            }
            Ok(Err(_)) => {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    message_type = %message.message_type(),
                    channel = %channel,
                    "Message handler panicked"
                );
            }
            Err(_) => {
                self.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_type = %message.message_type(),
                    channel = %channel,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "Message handler timed out"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::handler::message_handler;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

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

    fn notice() -> Arc<Message> {
        Arc::new(Message::notice("test.event", Value::Null))
    }

    #[tokio::test]
    async fn test_deliver_counts_all_accepting_handlers() {
        let registry = HandlerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            registry.add(ChannelName::Default, counting(&hits));
        }

        let delivered = registry.deliver(notice(), ChannelName::Default).await;
        assert_eq!(delivered, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let registry = HandlerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add(
            ChannelName::Default,
            Arc::new(message_handler(|_msg| async {
                Err::<(), BoxError>("handler blew up".into())
            })),
        );
        registry.add(ChannelName::Default, counting(&hits));

        let delivered = registry.deliver(notice(), ChannelName::Default).await;
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_failures(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let registry = HandlerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add(
            ChannelName::Default,
            Arc::new(message_handler(|_msg| async {
                if true {
                    panic!("handler panicked");
                }
                Ok(())
            })),
        );
        registry.add(ChannelName::Default, counting(&hits));

        let delivered = registry.deliver(notice(), ChannelName::Default).await;
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let registry = HandlerRegistry::new(Duration::from_millis(50));
        registry.add(
            ChannelName::Default,
            Arc::new(message_handler(|_msg| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })),
        );

        let delivered = registry.deliver(notice(), ChannelName::Default).await;
        assert_eq!(delivered, 1);
        assert_eq!(registry.handler_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_other_channels_untouched() {
        let registry = HandlerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add(ChannelName::Notice, counting(&hits));

        assert_eq!(registry.deliver(notice(), ChannelName::Default).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = HandlerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = registry.add(ChannelName::Proposal, counting(&hits));
        registry.add(ChannelName::Default, counting(&hits));

        assert_eq!(registry.total(), 2);
        assert!(registry.remove(ChannelName::Proposal, id));
        assert!(!registry.remove(ChannelName::Proposal, id));
        assert_eq!(registry.count(ChannelName::Proposal), 0);

        let counts = registry.channel_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].name, ChannelName::Default);
    }
}
