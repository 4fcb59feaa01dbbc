//! # Void Bus - Message Bus and Intent Dispatch Core
//!
//! Publish/subscribe over a hot-swappable transport, request/response
//! intents routed to exactly one handler, and a plugin registry with
//! hierarchy, pending-request correlation and resource accounting.
//!
//! ## Message Paths
//!
//! ```text
//!  publish(Notice)                        send_intent(type, payload)
//!        │                                          │
//!        ▼                                          ▼
//! ┌────────────────┐                       ┌────────────────┐
//! │ ChannelManager │ type filter           │  IntentRouter  │ exact, then
//! │  (mode select) │ per subscription      │                │ longest prefix*
//! └───────┬────────┘                       └───────┬────────┘
//!         │ send(channel)                          │ one handler
//!         ▼                                        ▼
//! ┌────────────────┐                       value or the handler's
//! │   Transport    │ in-process            own error
//! │                │ websocket
//! │                │ broadcast group
//! └───────┬────────┘
//!         ▼
//!   every accepting handler (failures isolated, count returned)
//! ```
//!
//! ## Guarantees
//!
//! - **Single-flight init:** concurrent `initialize()` calls run the
//!   transport's initialization once
//! - **Heart-transplant:** `set_transport` moves every subscription to the
//!   new transport
//! - **Bounded handlers:** notice handlers and intent handlers run under a
//!   deadline

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod channel;
pub mod channel_manager;
pub mod config;
pub mod error;
pub mod handler;
pub mod intent;
pub mod message;
pub mod metrics;
pub mod plugin_store;
pub mod transport;

// Re-export main types
pub use bus::{is_parallel_safe, BatchReport, BusStats, VoidCore, SAFE_PARALLEL_TYPES};
pub use channel::{ChannelMode, ChannelName};
pub use channel_manager::{ChannelManager, ChannelManagerStats, Subscription, SubscriptionId, VirtualChannelStats};
pub use config::{BusConfig, ConfigError};
pub use error::{BoxError, BusError, IntentError, PluginError, TransportError};
pub use handler::{intent_handler, message_handler, HandlerResult, IntentHandler, IntentResult, MessageHandler};
pub use intent::{
    IntentEvent, IntentMiddleware, IntentObserver, IntentOutcome, IntentPattern, IntentRecord, IntentRouter, IntentStats,
    DEFAULT_INTENT_HISTORY,
};
pub use message::{CorrelationId, Message, MessageBuilder, MessageCategory};
pub use metrics::{BusMetrics, BusMetricsSnapshot, MetricsRecorder, NoOpMetrics, RequestOutcome};
pub use plugin_store::{AdmissionPolicy, AllowAll, PluginRecord, PluginStore, PluginStoreStats, QuotaPolicy};
pub use transport::{
    BroadcastHub, BroadcastTransport, Envelope, InProcessTransport, Transport, TransportStats, TransportStatus,
    TransportSubscription, WebSocketConfig, WebSocketTransport,
};
