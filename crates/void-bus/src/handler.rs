//! Handler traits for published messages and intents.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::BoxError;
use crate::message::Message;

pub type HandlerResult = Result<(), BoxError>;
pub type IntentResult = Result<Value, BoxError>;

/// Receives messages delivered on a channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> HandlerResult;

    /// Whether this handler wants the message at all. Only accepting
    /// handlers are invoked and counted as delivered.
    fn accepts(&self, _message: &Message) -> bool {
        true
    }
}

/// Handles one intent type (or pattern) and produces a result value.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(&self, intent: Arc<Message>) -> IntentResult;
}

/// [`MessageHandler`] backed by an async closure.
pub struct FnMessageHandler<F>(F);

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> FnMessageHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnMessageHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>) -> HandlerResult {
        (self.0)(message).await
    }
}

/// [`IntentHandler`] backed by an async closure.
pub struct FnIntentHandler<F>(F);

/// Wrap an async closure as an [`IntentHandler`].
pub fn intent_handler<F, Fut>(f: F) -> FnIntentHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = IntentResult> + Send + 'static,
{
    FnIntentHandler(f)
}

#[async_trait]
impl<F, Fut> IntentHandler for FnIntentHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = IntentResult> + Send + 'static,
{
    async fn handle(&self, intent: Arc<Message>) -> IntentResult {
        (self.0)(intent).await
    }
}

/// Restricts a handler to one message type. Every subscription made
/// through the channel manager is wrapped in one of these.
pub(crate) struct TypeFilter {
    message_type: String,
    inner: Arc<dyn MessageHandler>,
}

impl TypeFilter {
    pub(crate) fn new(message_type: impl Into<String>, inner: Arc<dyn MessageHandler>) -> Self {
        Self {
            message_type: message_type.into(),
            inner,
        }
    }
}

#[async_trait]
impl MessageHandler for TypeFilter {
    async fn handle(&self, message: Arc<Message>) -> HandlerResult {
        if message.message_type() != self.message_type {
            return Ok(());
        }
        self.inner.handle(message).await
    }

    fn accepts(&self, message: &Message) -> bool {
        message.message_type() == self.message_type && self.inner.accepts(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = message_handler(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler
            .handle(Arc::new(Message::notice("a", Value::Null)))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let inner: Arc<dyn MessageHandler> = Arc::new(message_handler(|_msg| async {
            Err::<(), BoxError>("should not run".into())
        }));
        let filter = TypeFilter::new("wanted", inner);

        let other = Message::notice("other", Value::Null);
        assert!(!filter.accepts(&other));
        assert!(filter.handle(Arc::new(other)).await.is_ok());
        assert!(filter.accepts(&Message::notice("wanted", Value::Null)));
    }

    #[tokio::test]
    async fn test_intent_closure_sees_envelope() {
        let handler = intent_handler(|intent: Arc<Message>| async move {
            Ok(json!({
                "type": intent.message_type(),
                "echo": intent.payload().clone(),
            }))
        });

        let result = handler
            .handle(Arc::new(Message::intent_request("echo", json!(7))))
            .await
            .unwrap();
        assert_eq!(result, json!({"type": "echo", "echo": 7}));
    }
}
