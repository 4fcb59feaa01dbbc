//! Transport backends.
//!
//! A transport moves messages between publishers and handlers on named
//! virtual channels. Three backends ship with the crate:
//!
//! - [`InProcessTransport`]: direct in-memory delivery (the default)
//! - [`WebSocketTransport`]: JSON frames over a WebSocket connection
//! - [`BroadcastTransport`]: peers sharing a [`BroadcastHub`] group
//!
//! Every backend keeps its handlers in a [`HandlerRegistry`], so delivery
//! semantics (concurrency, failure isolation, timeouts) are identical.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channel::ChannelName;
use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::message::{now_millis, Message};

pub mod broadcast;
pub mod in_process;
mod registry;
pub mod websocket;

pub use broadcast::{BroadcastHub, BroadcastTransport};
pub use in_process::InProcessTransport;
pub use registry::{HandlerId, HandlerRegistry};
pub use websocket::{WebSocketConfig, WebSocketTransport};

/// Lifecycle of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStatus {
    Uninitialized,
    Active,
    Reconnecting,
    /// Gave up reconnecting. Sends fail until the transport is replaced.
    Disconnected,
    Destroyed,
}

impl TransportStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Reconnecting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSubscribers {
    pub name: ChannelName,
    pub subscriber_count: usize,
}

/// Snapshot returned by [`Transport::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub kind: &'static str,
    pub status: TransportStatus,
    pub message_count: u64,
    pub channels: Vec<ChannelSubscribers>,
    pub total_subscribers: usize,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub reconnect_attempts: u32,
}

impl TransportStats {
    pub(crate) fn from_registry(
        kind: &'static str,
        status: TransportStatus,
        message_count: u64,
        registry: &HandlerRegistry,
    ) -> Self {
        Self {
            kind,
            status,
            message_count,
            channels: registry.channel_counts(),
            total_subscribers: registry.total(),
            handler_failures: registry.handler_failures(),
            handler_timeouts: registry.handler_timeouts(),
            endpoint: None,
            reconnect_attempts: 0,
        }
    }
}

/// Frame exchanged by network-capable transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub channel: ChannelName,
    pub timestamp: u64,
    pub sender: String,
}

impl Envelope {
    pub fn new(message: &Message, channel: ChannelName, sender: impl Into<String>) -> Self {
        Self {
            message: message.clone(),
            channel,
            timestamp: now_millis(),
            sender: sender.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Handle for one handler attached to one channel of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportSubscription {
    pub channel: ChannelName,
    pub id: HandlerId,
}

/// A pluggable message transport.
///
/// `initialize` must be idempotent. `send` returns how many handlers the
/// message reached; backends that cannot observe remote handlers document
/// what they count instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name used in logs and stats.
    fn kind(&self) -> &'static str;

    async fn initialize(&self) -> Result<(), TransportError>;

    async fn send(&self, message: Arc<Message>, channel: ChannelName) -> Result<usize, TransportError>;

    fn subscribe(&self, handler: Arc<dyn MessageHandler>, channel: ChannelName) -> TransportSubscription;

    /// Returns false if the subscription was already removed.
    fn unsubscribe(&self, subscription: TransportSubscription) -> bool;

    fn stats(&self) -> TransportStats;

    /// Release connections and drop every handler.
    async fn destroy(&self);
}
