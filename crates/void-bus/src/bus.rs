//! `VoidCore`: the bus facade.
//!
//! Ties the channel manager, intent router and plugin store together behind
//! one context object. Components receive the core explicitly; there is no
//! process-wide instance.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelMode, ChannelName};
use crate::channel_manager::{ChannelManager, ChannelManagerStats, Subscription};
use crate::config::BusConfig;
use crate::error::{BusError, IntentError, PluginError};
use crate::handler::{intent_handler, message_handler, HandlerResult, IntentHandler, IntentResult, MessageHandler};
use crate::intent::{IntentMiddleware, IntentObserver, IntentRecord, IntentRouter, IntentStats};
use crate::message::{CorrelationId, Message, MessageCategory};
use crate::metrics::{BusMetrics, BusMetricsSnapshot, MetricsRecorder, NoOpMetrics, RequestOutcome};
use crate::plugin_store::{AdmissionPolicy, PluginRecord, PluginStore, PluginStoreStats, QuotaPolicy};
use crate::transport::{InProcessTransport, Transport};

/// Message types that are always safe to publish concurrently in a batch.
pub const SAFE_PARALLEL_TYPES: &[&str] = &[
    "core.lifecycle.migrated",
    "core.lifecycle.fused",
    "stats.memory_usage",
    "log.debug",
    "plugin.heartbeat",
    "config.theme_changed",
    "plugin.initialized",
    "plugin.shutdown",
    "system.process.declared",
    "system.process.terminating",
];

/// Whether a batch may publish `message` concurrently with others.
pub fn is_parallel_safe(message: &Message) -> bool {
    message.is_parallel_safe() || SAFE_PARALLEL_TYPES.contains(&message.message_type())
}

/// Channels a peer may answer a correlated request on, depending on its mode.
const RESPONSE_CHANNELS: &[ChannelName] = &[ChannelName::Default, ChannelName::IntentResponse];

/// Resolves pending requests from intent responses arriving through the
/// transport, including those published by other cores.
struct ResponseCorrelator {
    core_id: String,
    plugins: Arc<Mutex<PluginStore>>,
}

#[async_trait]
impl MessageHandler for ResponseCorrelator {
    async fn handle(&self, message: Arc<Message>) -> HandlerResult {
        if let Some(correlation_id) = message.correlation_id() {
            let resolved = self
                .plugins
                .lock()
                .resolve_pending_request(&correlation_id, message.payload().clone());
            if resolved {
                debug!(
                    core_id = %self.core_id,
                    correlation_id = %correlation_id,
                    message_type = %message.message_type(),
                    "Resolved request from transport response"
                );
            }
        }
        Ok(())
    }

    /// Only responses this core is still waiting for.
    fn accepts(&self, message: &Message) -> bool {
        message.category() == MessageCategory::IntentResponse
            && message
                .correlation_id()
                .is_some_and(|id| self.plugins.lock().is_pending(&id))
    }
}

/// Outcome of [`VoidCore::publish_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub parallel: usize,
    pub sequential: usize,
    pub delivered: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub core_id: String,
    #[serde(flatten)]
    pub channels: ChannelManagerStats,
    pub plugins: PluginStoreStats,
    pub intents: IntentStats,
    pub metrics: BusMetricsSnapshot,
}

pub struct VoidCore {
    core_id: String,
    config: BusConfig,
    channels: Arc<ChannelManager>,
    intents: IntentRouter,
    plugins: Arc<Mutex<PluginStore>>,
    metrics: BusMetrics,
    recorder: Arc<dyn MetricsRecorder>,
}

impl VoidCore {
    /// Core on the default in-process transport.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let transport = InProcessTransport::with_handler_timeout(config.handler_timeout());
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;

        let channels = ChannelManager::new(transport, config.channel_mode())
            .with_handler_timeout(config.handler_timeout());
        let mut plugins = PluginStore::new(config.max_plugin_depth);
        if let Some(quota) = config.resource_quota {
            plugins = plugins.with_admission_policy(Arc::new(QuotaPolicy::new(quota)));
        }

        let core_id = format!("core-{}", Uuid::new_v4());
        let plugins = Arc::new(Mutex::new(plugins));
        channels.add_tap(
            Arc::new(ResponseCorrelator {
                core_id: core_id.clone(),
                plugins: plugins.clone(),
            }),
            RESPONSE_CHANNELS,
        );
        info!(
            core_id = %core_id,
            mode = %config.channel_mode(),
            "VoidCore created"
        );

        Ok(Self {
            core_id,
            intents: IntentRouter::new(config.intent_timeout()),
            channels: Arc::new(channels),
            plugins,
            metrics: BusMetrics::new(),
            recorder: Arc::new(NoOpMetrics),
            config,
        })
    }

    /// Export bus activity to an external recorder as well.
    pub fn with_metrics_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Replace the resource admission policy (overrides `resource_quota`).
    pub fn with_admission_policy(self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        let store = PluginStore::new(self.config.max_plugin_depth).with_admission_policy(policy);
        *self.plugins.lock() = store;
        self
    }

    pub fn core_id(&self) -> &str {
        &self.core_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Initialize the live transport. Safe to call concurrently and
    /// repeatedly; publish and subscribe call it on demand.
    pub async fn initialize(&self) -> Result<(), BusError> {
        self.channels.initialize().await?;
        Ok(())
    }

    // === Notices ===

    /// Publish a message and return how many subscribers received it.
    ///
    /// A message without a type is logged and reaches nobody. An intent
    /// response carrying a correlation ID also resolves the matching
    /// pending request.
    pub async fn publish(&self, message: Message) -> Result<usize, BusError> {
        if !message.has_routable_type() {
            warn!(
                core_id = %self.core_id,
                message_id = %message.id(),
                "Rejected message with missing type"
            );
            self.metrics.record_publish_rejected();
            self.recorder.record_publish_rejected();
            return Ok(0);
        }

        if message.category() == MessageCategory::IntentResponse {
            if let Some(correlation_id) = message.correlation_id() {
                self.plugins
                    .lock()
                    .resolve_pending_request(&correlation_id, message.payload().clone());
            }
        }

        let message = Arc::new(message);
        let channel = self.channels.select_channel_name(&message);
        let delivered = self.channels.publish(message.clone()).await?;

        self.metrics
            .record_publish(message.message_type(), channel, delivered);
        self.recorder
            .record_publish(message.message_type(), channel, delivered);
        if self.config.debug {
            debug!(
                core_id = %self.core_id,
                message_type = %message.message_type(),
                category = %message.category(),
                channel = %channel,
                delivered,
                "Message published"
            );
        }
        Ok(delivered)
    }

    /// Publish many messages. Parallel-safe ones go out concurrently, the
    /// rest one after another in their original order.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<BatchReport, BusError> {
        let started = Instant::now();
        let processed = messages.len();
        let (parallel, sequential): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(is_parallel_safe);
        let (parallel_count, sequential_count) = (parallel.len(), sequential.len());

        let concurrent = futures::future::join_all(parallel.into_iter().map(|m| self.publish(m)));
        let in_order = async {
            let mut results = Vec::with_capacity(sequential_count);
            for message in sequential {
                results.push(self.publish(message).await);
            }
            results
        };
        let (parallel_results, sequential_results) = tokio::join!(concurrent, in_order);

        let mut delivered = 0;
        for result in parallel_results.into_iter().chain(sequential_results) {
            delivered += result?;
        }

        let report = BatchReport {
            processed,
            parallel: parallel_count,
            sequential: sequential_count,
            delivered,
            elapsed: started.elapsed(),
        };
        debug!(
            core_id = %self.core_id,
            processed,
            parallel = parallel_count,
            sequential = sequential_count,
            delivered,
            "Batch published"
        );
        Ok(report)
    }

    /// Subscribe an async closure to one message type.
    pub async fn subscribe<F, Fut>(&self, message_type: &str, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(message_type, Arc::new(message_handler(handler)))
            .await
    }

    pub async fn subscribe_handler(
        &self,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let subscription = self.channels.subscribe(message_type, handler).await?;
        if self.config.debug {
            debug!(
                core_id = %self.core_id,
                message_type,
                subscription = subscription.id(),
                "Subscribed"
            );
        }
        Ok(subscription)
    }

    pub fn subscriber_count(&self, message_type: &str) -> usize {
        self.channels.subscriber_count(message_type)
    }

    /// Message types with live subscriptions, sorted.
    pub fn tracked_types(&self) -> Vec<String> {
        self.channels.tracked_types()
    }

    // === Intents ===

    /// Register an async closure for an exact intent type or a `prefix*`
    /// pattern. Returns true if it replaced an earlier handler.
    pub fn register_intent_handler<F, Fut>(&self, pattern: &str, handler: F) -> bool
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IntentResult> + Send + 'static,
    {
        self.register_intent_handler_arc(pattern, Arc::new(intent_handler(handler)))
    }

    pub fn register_intent_handler_arc(&self, pattern: &str, handler: Arc<dyn IntentHandler>) -> bool {
        self.intents.register(pattern, handler).is_some()
    }

    pub fn unregister_intent_handler(&self, pattern: &str) -> bool {
        self.intents.unregister(pattern)
    }

    pub fn intent_patterns(&self) -> Vec<String> {
        self.intents.patterns()
    }

    pub fn on_intent(&self, observer: IntentObserver) {
        self.intents.add_observer(observer);
    }

    /// Add a middleware around every intent handler, after those already
    /// installed.
    pub fn add_intent_middleware(&self, middleware: Arc<dyn IntentMiddleware>) {
        self.intents.add_middleware(middleware);
    }

    /// Up to `limit` most recent intent dispatches, oldest first.
    pub fn recent_intents(&self, limit: usize) -> Vec<IntentRecord> {
        self.intents.recent_intents(limit)
    }

    pub fn intent_stats(&self) -> IntentStats {
        self.intents.stats()
    }

    /// Run the one handler matching `intent_type` and return its result.
    ///
    /// Handler errors reach the caller unchanged.
    pub async fn send_intent(&self, intent_type: &str, payload: Value) -> Result<Value, IntentError> {
        self.dispatch_intent(Message::intent_request(intent_type, payload))
            .await
    }

    /// Like [`send_intent`](Self::send_intent) for a prebuilt envelope.
    pub async fn dispatch_intent(&self, intent: Message) -> Result<Value, IntentError> {
        let intent_type = intent.message_type().to_string();
        let started = Instant::now();
        let result = self.intents.dispatch(Arc::new(intent)).await;

        let elapsed = started.elapsed();
        self.metrics.record_intent(&intent_type, result.is_ok(), elapsed);
        self.recorder.record_intent(&intent_type, result.is_ok(), elapsed);
        if self.config.debug {
            debug!(
                core_id = %self.core_id,
                intent_type = %intent_type,
                ok = result.is_ok(),
                elapsed_us = elapsed.as_micros() as u64,
                "Intent dispatched"
            );
        }
        result
    }

    // === Correlated requests ===

    /// Publish an intent request and wait for the matching response.
    ///
    /// Any party may answer with [`respond`](Self::respond). Unanswered
    /// requests are removed from the pending table after `request_timeout`.
    pub async fn request(&self, intent_type: &str, payload: Value) -> Result<Value, IntentError> {
        let correlation_id = CorrelationId::new();
        let message = Message::builder(intent_type)
            .category(MessageCategory::IntentRequest)
            .correlation_id(correlation_id)
            .payload(payload)
            .build();

        let (resolver, response) = oneshot::channel();
        self.plugins
            .lock()
            .add_pending_request(correlation_id, resolver);

        if let Err(e) = self.publish(message).await {
            self.plugins.lock().cancel_pending_request(&correlation_id);
            return Err(e.into());
        }

        let timeout = self.config.request_timeout();
        let (outcome, result) = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(value)) => (RequestOutcome::Resolved, Ok(value)),
            Ok(Err(_)) => (
                RequestOutcome::Dropped,
                Err(IntentError::RequestDropped { correlation_id }),
            ),
            Err(_) => {
                self.plugins.lock().cancel_pending_request(&correlation_id);
                warn!(
                    core_id = %self.core_id,
                    intent_type,
                    correlation_id = %correlation_id,
                    "Request timed out"
                );
                (
                    RequestOutcome::TimedOut,
                    Err(IntentError::RequestTimeout {
                        intent_type: intent_type.to_string(),
                        correlation_id,
                        timeout,
                    }),
                )
            }
        };

        self.metrics.record_request(intent_type, outcome);
        self.recorder.record_request(intent_type, outcome);
        result
    }

    /// Answer a correlated request.
    ///
    /// Requests without a correlation ID cannot be answered; that is logged
    /// and nothing is published.
    pub async fn respond(&self, request: &Message, payload: Value) -> Result<usize, BusError> {
        let Some(correlation_id) = request.correlation_id() else {
            warn!(
                core_id = %self.core_id,
                message_type = %request.message_type(),
                "Cannot respond to a message without correlation ID"
            );
            return Ok(0);
        };
        self.publish(Message::intent_response(request.message_type(), correlation_id, payload))
            .await
    }

    pub fn pending_request_count(&self) -> usize {
        self.plugins.lock().pending_count()
    }

    // === Plugins ===

    /// Returns false (and logs why) if the store refuses the plugin.
    pub fn register_plugin(&self, plugin: PluginRecord) -> bool {
        let plugin_id = plugin.plugin_id.clone();
        match self.try_register_plugin(plugin) {
            Ok(()) => true,
            Err(e) => {
                warn!(core_id = %self.core_id, plugin_id = %plugin_id, error = %e, "Plugin registration refused");
                false
            }
        }
    }

    pub fn try_register_plugin(&self, plugin: PluginRecord) -> Result<(), PluginError> {
        self.plugins.lock().add_plugin(plugin)
    }

    pub fn unregister_plugin(&self, plugin_id: &str) -> bool {
        self.plugins.lock().remove_plugin(plugin_id).is_some()
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.plugins.lock().get_plugin(plugin_id).cloned()
    }

    pub fn get_all_plugins(&self) -> Vec<PluginRecord> {
        self.plugins.lock().get_all_plugins()
    }

    pub fn get_children(&self, plugin_id: &str) -> Vec<PluginRecord> {
        self.plugins
            .lock()
            .get_children(plugin_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_parent(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.plugins.lock().get_parent(plugin_id).cloned()
    }

    pub fn get_descendants(&self, plugin_id: &str) -> Vec<PluginRecord> {
        self.plugins
            .lock()
            .get_descendants(plugin_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn reparent_plugin(&self, plugin_id: &str, new_parent_id: Option<&str>) -> Result<(), PluginError> {
        self.plugins.lock().reparent(plugin_id, new_parent_id)
    }

    pub fn allocate_resource(&self, owner_id: &str, cost: u64) -> Result<u64, PluginError> {
        self.plugins.lock().allocate_resource(owner_id, cost)
    }

    pub fn release_resource(&self, owner_id: &str, cost: u64) -> u64 {
        self.plugins.lock().release_resource(owner_id, cost)
    }

    pub fn resource_usage(&self, owner_id: &str) -> u64 {
        self.plugins.lock().get_resource_usage(owner_id)
    }

    pub fn plugin_store_stats(&self) -> PluginStoreStats {
        self.plugins.lock().stats()
    }

    // === Transport and routing ===

    /// Hot-swap the live transport. Existing subscriptions move over.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) -> Result<(), BusError> {
        let from = self.channels.transport().kind();
        let to = transport.kind();
        self.channels.set_transport(transport).await?;

        self.metrics.record_transport_swap(from, to);
        self.recorder.record_transport_swap(from, to);
        Ok(())
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.channels.transport()
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.channels.mode()
    }

    pub fn enable_multi_channel(&self) {
        self.channels.enable_multi_channel();
    }

    pub fn disable_multi_channel(&self) {
        self.channels.disable_multi_channel();
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            core_id: self.core_id.clone(),
            channels: self.channels.stats(),
            plugins: self.plugin_store_stats(),
            intents: self.intents.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Empty the plugin store, the intent history and every subscription.
    /// Intent handlers and middleware stay registered.
    pub async fn clear(&self) -> Result<(), BusError> {
        self.plugins.lock().clear();
        self.intents.reset_history();
        self.channels.reset().await?;
        info!(core_id = %self.core_id, "VoidCore cleared");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.channels.shutdown().await;
        info!(core_id = %self.core_id, "VoidCore shut down");
    }
}

impl std::fmt::Debug for VoidCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoidCore")
            .field("core_id", &self.core_id)
            .field("channels", &self.channels)
            .field("plugins", &*self.plugins.lock())
            .finish()
    }
}
