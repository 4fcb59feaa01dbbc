//! Error types for the message bus.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::message::CorrelationId;

/// Boxed error produced by message and intent handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport {kind} used before initialize()")]
    NotInitialized { kind: &'static str },

    #[error("Transport disconnected from {endpoint}")]
    Disconnected { endpoint: String },

    #[error("Transport {kind} has been destroyed")]
    Destroyed { kind: &'static str },

    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures surfaced by the bus facade and channel manager.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures of intent dispatch and correlated requests.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("No intent handler registered for {intent_type}")]
    UnknownIntent { intent_type: String },

    /// The handler's own error, unchanged.
    #[error("{0}")]
    Handler(BoxError),

    #[error("Intent middleware {name} failed: {source}")]
    Middleware { name: String, source: BoxError },

    #[error("Intent {intent_type} did not complete within {timeout:?}")]
    Timeout {
        intent_type: String,
        timeout: Duration,
    },

    #[error("Request {correlation_id} ({intent_type}) got no response within {timeout:?}")]
    RequestTimeout {
        intent_type: String,
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    #[error("Request {correlation_id} was dropped before a response arrived")]
    RequestDropped { correlation_id: CorrelationId },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl IntentError {
    /// The error returned by the intent handler, if that is what failed.
    pub fn handler_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    pub fn is_unknown_intent(&self) -> bool {
        matches!(self, Self::UnknownIntent { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RequestTimeout { .. })
    }
}

impl From<TransportError> for IntentError {
    fn from(err: TransportError) -> Self {
        Self::Bus(BusError::Transport(err))
    }
}

/// Plugin hierarchy and resource ledger failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin already registered: {0}")]
    Duplicate(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Parent {parent_id} of plugin {plugin_id} is not registered")]
    DanglingParent { plugin_id: String, parent_id: String },

    #[error("Moving {plugin_id} under {new_parent_id} would create a cycle")]
    CircularReference {
        plugin_id: String,
        new_parent_id: String,
    },

    #[error("Plugin {plugin_id} would sit at depth {depth}, maximum is {max_depth}")]
    MaxDepthExceeded {
        plugin_id: String,
        depth: usize,
        max_depth: usize,
    },

    #[error("Allocation of {cost} for {owner_id} rejected at usage {current}")]
    AdmissionRejected {
        owner_id: String,
        cost: u64,
        current: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_handler_error_is_preserved() {
        let err = IntentError::Handler(Box::new(Boom));
        assert_eq!(err.to_string(), "boom");
        let inner = err.handler_error().unwrap();
        assert!(inner.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn test_transport_error_converts_to_intent_error() {
        let err: IntentError = TransportError::NotInitialized { kind: "in-process" }.into();
        assert!(matches!(
            err,
            IntentError::Bus(BusError::Transport(TransportError::NotInitialized { .. }))
        ));
    }

    #[test]
    fn test_plugin_error_messages() {
        let err = PluginError::CircularReference {
            plugin_id: "a".into(),
            new_parent_id: "b".into(),
        };
        assert_eq!(err.to_string(), "Moving a under b would create a cycle");
    }
}
