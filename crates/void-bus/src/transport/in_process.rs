//! In-memory transport. Handlers run on the publisher's task.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{HandlerRegistry, Transport, TransportStats, TransportStatus, TransportSubscription};
use crate::channel::ChannelName;
use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::message::Message;

const KIND: &str = "in-process";

pub struct InProcessTransport {
    registry: HandlerRegistry,
    status: Mutex<TransportStatus>,
    message_count: AtomicU64,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::with_registry(HandlerRegistry::default())
    }

    pub fn with_handler_timeout(timeout: Duration) -> Self {
        Self::with_registry(HandlerRegistry::new(timeout))
    }

    fn with_registry(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            status: Mutex::new(TransportStatus::Uninitialized),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.lock()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let mut status = self.status.lock();
        match *status {
            TransportStatus::Destroyed => Err(TransportError::Destroyed { kind: KIND }),
            TransportStatus::Active => Ok(()),
            _ => {
                *status = TransportStatus::Active;
                info!(transport = KIND, "Transport initialized");
                Ok(())
            }
        }
    }

    async fn send(&self, message: Arc<Message>, channel: ChannelName) -> Result<usize, TransportError> {
        match self.status() {
            TransportStatus::Active => {}
            TransportStatus::Destroyed => return Err(TransportError::Destroyed { kind: KIND }),
            _ => return Err(TransportError::NotInitialized { kind: KIND }),
        }

        self.message_count.fetch_add(1, Ordering::Relaxed);
        let delivered = self.registry.deliver(message.clone(), channel).await;
        if delivered == 0 {
            debug!(
                message_type = %message.message_type(),
                channel = %channel,
                "Message dropped (no subscribers)"
            );
        }
        Ok(delivered)
    }

    fn subscribe(&self, handler: Arc<dyn MessageHandler>, channel: ChannelName) -> TransportSubscription {
        let id = self.registry.add(channel, handler);
        TransportSubscription { channel, id }
    }

    fn unsubscribe(&self, subscription: TransportSubscription) -> bool {
        self.registry.remove(subscription.channel, subscription.id)
    }

    fn stats(&self) -> TransportStats {
        TransportStats::from_registry(
            KIND,
            self.status(),
            self.message_count.load(Ordering::Relaxed),
            &self.registry,
        )
    }

    async fn destroy(&self) {
        *self.status.lock() = TransportStatus::Destroyed;
        self.registry.clear();
        debug!(transport = KIND, "Transport destroyed");
    }
}
