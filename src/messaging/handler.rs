use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::backend::Attributes;

/// Processes the decoded payload of one message.
///
/// Return `Ok(true)` to acknowledge the message so it gets deleted. `Ok(false)`
/// leaves it on the queue; the backend hands it out again once its visibility
/// window expires. An `Err` stops the worker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: Value,
        receipt_token: &str,
        attributes: &Attributes,
    ) -> Result<bool, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Unusable payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Wraps a plain closure as a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value, &str, &Attributes) -> Result<bool, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Value, &str, &Attributes) -> Result<bool, HandlerError> + Send + Sync,
{
    async fn handle(
        &self,
        payload: Value,
        receipt_token: &str,
        attributes: &Attributes,
    ) -> Result<bool, HandlerError> {
        (self.0)(payload, receipt_token, attributes)
    }
}

/// Handlers addressable by name, for wiring queues to handlers from configuration.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_passes_arguments_through() {
        let handler = handler_fn(|payload, receipt, attributes| {
            assert_eq!(payload, json!({"id": 7}));
            assert_eq!(receipt, "myId");
            assert_eq!(attributes.get("origin").map(String::as_str), Some("tests"));
            Ok(true)
        });

        let mut attributes = Attributes::new();
        attributes.insert("origin".to_string(), "tests".to_string());

        let acked = handler.handle(json!({"id": 7}), "myId", &attributes).await.unwrap();
        assert!(acked);
    }

    #[tokio::test]
    async fn test_handler_fn_error() {
        let handler = handler_fn(|_, _, _| Err(HandlerError::failed("break the cycle")));

        let err = handler
            .handle(Value::Null, "myId", &Attributes::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Handler failed: break the cycle");
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = HandlerCatalog::new()
            .with_handler("log", handler_fn(|_, _, _| Ok(true)))
            .with_handler("audit", handler_fn(|_, _, _| Ok(false)));

        assert!(catalog.get("log").is_some());
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.names(), vec!["audit", "log"]);
    }
}
