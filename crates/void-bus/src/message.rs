//! The message envelope carried by every transport.
//!
//! A [`Message`] is immutable once built. Handlers receive it behind an
//! `Arc` so a single publish can fan out without copying the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier linking an intent request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Semantic class of a message. Drives virtual channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    IntentRequest,
    IntentResponse,
    Notice,
    Proposal,
    /// Legacy spelling of `IntentRequest`.
    Intent,
}

impl MessageCategory {
    pub fn is_intent_request(&self) -> bool {
        matches!(self, Self::IntentRequest | Self::Intent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentRequest => "IntentRequest",
            Self::IntentResponse => "IntentResponse",
            Self::Notice => "Notice",
            Self::Proposal => "Proposal",
            Self::Intent => "Intent",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A typed, categorized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(rename = "type", default)]
    message_type: String,
    category: MessageCategory,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    #[serde(default = "now_millis")]
    timestamp: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    parallel_safe: bool,
}

impl Message {
    pub fn builder(message_type: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(message_type)
    }

    pub fn notice(message_type: impl Into<String>, payload: Value) -> Self {
        Self::builder(message_type)
            .category(MessageCategory::Notice)
            .payload(payload)
            .build()
    }

    pub fn proposal(message_type: impl Into<String>, payload: Value) -> Self {
        Self::builder(message_type)
            .category(MessageCategory::Proposal)
            .payload(payload)
            .build()
    }

    /// Intent request with a freshly generated correlation id.
    pub fn intent_request(message_type: impl Into<String>, payload: Value) -> Self {
        Self::builder(message_type)
            .category(MessageCategory::IntentRequest)
            .correlation_id(CorrelationId::new())
            .payload(payload)
            .build()
    }

    pub fn intent_response(
        message_type: impl Into<String>,
        correlation_id: CorrelationId,
        payload: Value,
    ) -> Self {
        Self::builder(message_type)
            .category(MessageCategory::IntentResponse)
            .correlation_id(correlation_id)
            .payload(payload)
            .build()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn category(&self) -> MessageCategory {
        self.category
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_parallel_safe(&self) -> bool {
        self.parallel_safe
    }

    /// Same envelope (id, type, category, correlation) with another payload.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            id: self.id,
            message_type: self.message_type.clone(),
            category: self.category,
            payload,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
            parallel_safe: self.parallel_safe,
        }
    }

    /// Empty or whitespace-only types cannot be routed.
    pub fn has_routable_type(&self) -> bool {
        !self.message_type.trim().is_empty()
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message_type: String,
    category: MessageCategory,
    payload: Value,
    correlation_id: Option<CorrelationId>,
    parallel_safe: bool,
}

impl MessageBuilder {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            category: MessageCategory::Notice,
            payload: Value::Null,
            correlation_id: None,
            parallel_safe: false,
        }
    }

    pub fn category(mut self, category: MessageCategory) -> Self {
        self.category = category;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: self.message_type,
            category: self.category,
            payload: self.payload,
            correlation_id: self.correlation_id,
            timestamp: now_millis(),
            parallel_safe: self.parallel_safe,
        }
    }
}
