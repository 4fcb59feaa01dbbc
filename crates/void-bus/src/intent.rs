//! Intent dispatch.
//!
//! Handlers register under an exact intent type (`plugin.create`) or a
//! wildcard prefix (`plugin.*`, or a lone `*` for everything). An exact
//! match wins; otherwise the longest matching prefix is used.
//!
//! ## Pipeline
//!
//! ```text
//! payload -> pre_process (each middleware, in order)
//!         -> handler
//!         -> post_process (each middleware, in order) -> result
//! ```
//!
//! The whole pipeline runs under the intent timeout. Every dispatch lands in
//! a bounded history and the per-outcome counters of [`IntentStats`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_INTENT_TIMEOUT_MS;
use crate::error::{BoxError, IntentError};
use crate::handler::IntentHandler;
use crate::message::{now_millis, CorrelationId, Message};

/// Dispatches kept in the intent history.
pub const DEFAULT_INTENT_HISTORY: usize = 200;

/// Most recent dispatches included in [`IntentStats`].
const RECENT_INTENTS: usize = 10;

/// A registered intent pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IntentPattern {
    Exact(String),
    /// Matches every intent type starting with the prefix.
    Prefix(String),
}

impl IntentPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, intent_type: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == intent_type,
            Self::Prefix(prefix) => intent_type.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for IntentPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Lifecycle notifications emitted around each dispatch.
#[derive(Debug)]
pub enum IntentEvent<'a> {
    Sent {
        intent_type: &'a str,
        correlation_id: Option<CorrelationId>,
    },
    Processed {
        intent_type: &'a str,
        elapsed: Duration,
    },
    Failed {
        intent_type: &'a str,
        error: &'a IntentError,
    },
}

pub type IntentObserver = Arc<dyn Fn(&IntentEvent<'_>) + Send + Sync>;

/// Rewrites intent payloads before the handler and results after it.
#[async_trait]
pub trait IntentMiddleware: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_process(&self, _intent_type: &str, payload: Value) -> Result<Value, BoxError> {
        Ok(payload)
    }

    async fn post_process(&self, _intent_type: &str, result: Value) -> Result<Value, BoxError> {
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IntentOutcome {
    Succeeded,
    Failed,
    Unknown,
    TimedOut,
}

impl IntentOutcome {
    fn of(result: &Result<Value, IntentError>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(IntentError::UnknownIntent { .. }) => Self::Unknown,
            Err(IntentError::Timeout { .. }) => Self::TimedOut,
            Err(_) => Self::Failed,
        }
    }
}

/// One entry of the intent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRecord {
    pub intent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub outcome: IntentOutcome,
    pub processing_us: u64,
    pub timestamp: u64,
}

/// Dispatch counters by outcome and by intent family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unknown: u64,
    pub timed_out: u64,
    /// `system.boot.*`
    pub boot: u64,
    /// `system.plugin.*`
    pub plugin: u64,
    /// Other `system.*`
    pub system: u64,
    pub custom: u64,
    pub total_processing_us: u64,
    pub registered_handlers: usize,
    pub middleware: usize,
    pub recent_intents: Vec<IntentRecord>,
}

impl IntentStats {
    fn count(&mut self, record: &IntentRecord) {
        self.total += 1;
        self.total_processing_us = self.total_processing_us.saturating_add(record.processing_us);
        match record.outcome {
            IntentOutcome::Succeeded => self.succeeded += 1,
            IntentOutcome::Failed => self.failed += 1,
            IntentOutcome::Unknown => self.unknown += 1,
            IntentOutcome::TimedOut => self.timed_out += 1,
        }
        let family = record.intent_type.as_str();
        if family.starts_with("system.boot.") {
            self.boot += 1;
        } else if family.starts_with("system.plugin.") {
            self.plugin += 1;
        } else if family.starts_with("system.") {
            self.system += 1;
        } else {
            self.custom += 1;
        }
    }
}

#[derive(Default)]
struct IntentLedger {
    stats: IntentStats,
    history: VecDeque<IntentRecord>,
}

/// Routes intents to their handlers.
pub struct IntentRouter {
    exact: RwLock<HashMap<String, Arc<dyn IntentHandler>>>,
    prefixes: RwLock<Vec<(String, Arc<dyn IntentHandler>)>>,
    observers: RwLock<Vec<IntentObserver>>,
    middleware: RwLock<Vec<Arc<dyn IntentMiddleware>>>,
    ledger: Mutex<IntentLedger>,
    history_limit: usize,
    timeout: Duration,
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_INTENT_TIMEOUT_MS))
    }
}

impl IntentRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            exact: RwLock::new(HashMap::new()),
            prefixes: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            ledger: Mutex::new(IntentLedger::default()),
            history_limit: DEFAULT_INTENT_HISTORY,
            timeout,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Register a handler. A previous handler for the same pattern is
    /// replaced and returned.
    pub fn register(&self, pattern: &str, handler: Arc<dyn IntentHandler>) -> Option<Arc<dyn IntentHandler>> {
        let previous = match IntentPattern::parse(pattern) {
            IntentPattern::Exact(exact) => self.exact.write().insert(exact, handler),
            IntentPattern::Prefix(prefix) => {
                let mut prefixes = self.prefixes.write();
                let previous = match prefixes.iter().position(|(p, _)| *p == prefix) {
                    Some(index) => Some(std::mem::replace(&mut prefixes[index].1, handler)),
                    None => {
                        prefixes.push((prefix, handler));
                        None
                    }
                };
                // Longest prefix first.
                prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                previous
            }
        };

        if previous.is_some() {
            warn!(pattern, "Intent handler replaced");
        } else {
            info!(pattern, "Intent handler registered");
        }
        previous
    }

    pub fn unregister(&self, pattern: &str) -> bool {
        let removed = match IntentPattern::parse(pattern) {
            IntentPattern::Exact(exact) => self.exact.write().remove(&exact).is_some(),
            IntentPattern::Prefix(prefix) => {
                let mut prefixes = self.prefixes.write();
                let before = prefixes.len();
                prefixes.retain(|(p, _)| *p != prefix);
                prefixes.len() != before
            }
        };
        if removed {
            debug!(pattern, "Intent handler unregistered");
        }
        removed
    }

    /// Registered patterns, exact ones first, each group sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut exact: Vec<String> = self.exact.read().keys().cloned().collect();
        exact.sort();
        let mut prefixes: Vec<String> = self
            .prefixes
            .read()
            .iter()
            .map(|(prefix, _)| format!("{prefix}*"))
            .collect();
        prefixes.sort();
        exact.extend(prefixes);
        exact
    }

    pub fn has_handler(&self, intent_type: &str) -> bool {
        self.resolve(intent_type).is_some()
    }

    /// Handler for an intent type plus the pattern that matched.
    pub fn resolve(&self, intent_type: &str) -> Option<(IntentPattern, Arc<dyn IntentHandler>)> {
        if let Some(handler) = self.exact.read().get(intent_type) {
            return Some((IntentPattern::Exact(intent_type.to_string()), handler.clone()));
        }
        self.prefixes
            .read()
            .iter()
            .find(|(prefix, _)| intent_type.starts_with(prefix.as_str()))
            .map(|(prefix, handler)| (IntentPattern::Prefix(prefix.clone()), handler.clone()))
    }

    pub fn add_observer(&self, observer: IntentObserver) {
        self.observers.write().push(observer);
    }

    /// Append a middleware. Hooks run in the order middleware was added.
    pub fn add_middleware(&self, middleware: Arc<dyn IntentMiddleware>) {
        info!(middleware = middleware.name(), "Intent middleware added");
        self.middleware.write().push(middleware);
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.read().len()
    }

    /// Up to `limit` most recent dispatches, oldest first.
    pub fn recent_intents(&self, limit: usize) -> Vec<IntentRecord> {
        let ledger = self.ledger.lock();
        let skip = ledger.history.len().saturating_sub(limit);
        ledger.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> IntentStats {
        let registered_handlers = self.exact.read().len() + self.prefixes.read().len();
        let middleware = self.middleware_count();
        let mut stats = self.ledger.lock().stats.clone();
        stats.registered_handlers = registered_handlers;
        stats.middleware = middleware;
        stats.recent_intents = self.recent_intents(RECENT_INTENTS);
        stats
    }

    /// Forget the history and zero the counters.
    pub fn reset_history(&self) {
        *self.ledger.lock() = IntentLedger::default();
    }

    fn record(&self, intent: &Message, result: &Result<Value, IntentError>, elapsed: Duration) {
        let record = IntentRecord {
            intent_type: intent.message_type().to_string(),
            correlation_id: intent.correlation_id(),
            outcome: IntentOutcome::of(result),
            processing_us: elapsed.as_micros() as u64,
            timestamp: now_millis(),
        };
        let mut ledger = self.ledger.lock();
        ledger.stats.count(&record);
        if self.history_limit == 0 {
            return;
        }
        while ledger.history.len() >= self.history_limit {
            ledger.history.pop_front();
        }
        ledger.history.push_back(record);
    }

    fn notify(&self, event: IntentEvent<'_>) {
        let observers: Vec<IntentObserver> = self.observers.read().clone();
        for observer in observers {
            (*observer)(&event);
        }
    }

    /// Build an intent request and dispatch it.
    pub async fn send_intent(&self, intent_type: &str, payload: Value) -> Result<Value, IntentError> {
        self.dispatch(Arc::new(Message::intent_request(intent_type, payload)))
            .await
    }

    /// Run the handler for `intent` and return its result.
    ///
    /// Handler errors come back unchanged as [`IntentError::Handler`].
    pub async fn dispatch(&self, intent: Arc<Message>) -> Result<Value, IntentError> {
        let intent_type = intent.message_type().to_string();
        self.notify(IntentEvent::Sent {
            intent_type: &intent_type,
            correlation_id: intent.correlation_id(),
        });

        let started = Instant::now();
        let result = self.run(&intent_type, intent.clone()).await;
        let elapsed = started.elapsed();
        self.record(&intent, &result, elapsed);
        match &result {
            Ok(_) => self.notify(IntentEvent::Processed {
                intent_type: &intent_type,
                elapsed,
            }),
            Err(error) => {
                warn!(intent_type = %intent_type, error = %error, "Intent failed");
                self.notify(IntentEvent::Failed {
                    intent_type: &intent_type,
                    error,
                });
            }
        }
        result
    }

    async fn run(&self, intent_type: &str, intent: Arc<Message>) -> Result<Value, IntentError> {
        let Some((pattern, handler)) = self.resolve(intent_type) else {
            return Err(IntentError::UnknownIntent {
                intent_type: intent_type.to_string(),
            });
        };
        debug!(intent_type, pattern = %pattern, "Dispatching intent");

        let middleware: Vec<Arc<dyn IntentMiddleware>> = self.middleware.read().clone();
        match tokio::time::timeout(self.timeout, pipeline(&middleware, handler, intent)).await {
            Ok(result) => result,
            Err(_) => Err(IntentError::Timeout {
                intent_type: intent_type.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    pub fn clear(&self) {
        self.exact.write().clear();
        self.prefixes.write().clear();
    }
}

async fn pipeline(
    middleware: &[Arc<dyn IntentMiddleware>],
    handler: Arc<dyn IntentHandler>,
    intent: Arc<Message>,
) -> Result<Value, IntentError> {
    let intent = if middleware.is_empty() {
        intent
    } else {
        let mut payload = intent.payload().clone();
        for m in middleware {
            payload = m
                .pre_process(intent.message_type(), payload)
                .await
                .map_err(|source| middleware_error(m.as_ref(), source))?;
        }
        Arc::new(intent.with_payload(payload))
    };

    let mut result = handler
        .handle(intent.clone())
        .await
        .map_err(IntentError::Handler)?;

    for m in middleware {
        result = m
            .post_process(intent.message_type(), result)
            .await
            .map_err(|source| middleware_error(m.as_ref(), source))?;
    }
    Ok(result)
}

fn middleware_error(middleware: &dyn IntentMiddleware, source: BoxError) -> IntentError {
    IntentError::Middleware {
        name: middleware.name().to_string(),
        source,
    }
}
