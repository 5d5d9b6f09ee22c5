//! Queue client adapter.
//!
//! Resolves queue names to endpoints, encodes payloads and is the single place
//! where backend failures are split into "absorb and carry on" and "stop the
//! worker".
//!
//! Absorbed failures are counted per client. After [`ESCALATION_CEILING`]
//! absorbed failures every further transient failure is returned as an error,
//! so a worker stuck against a broken backend eventually stops instead of
//! looping silently forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use super::backend::{Attributes, BatchEntry, Message, QueueBackend, ReceiveOptions, ALL_ATTRIBUTES};
use crate::config::{ConfigError, QueueConfig};
use crate::contracts::BackendError;
use crate::metrics::Metrics;

/// Absorbed transient failures tolerated per client before escalating.
pub const ESCALATION_CEILING: u32 = 25;

const BATCH_ID_PREFIX: &str = "a";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendBatchOutcome {
    /// The backend processed the batch. Maps entry position to the error text
    /// of every entry it rejected; empty when everything was sent.
    Completed(BTreeMap<usize, String>),

    /// The whole call failed and the failure was absorbed. Nothing was sent.
    NotSent,
}

impl SendBatchOutcome {
    pub fn failures(&self) -> Option<&BTreeMap<usize, String>> {
        match self {
            Self::Completed(failures) => Some(failures),
            Self::NotSent => None,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        matches!(self, Self::Completed(failures) if failures.is_empty())
    }
}

pub struct QueueClient {
    backend: Arc<dyn QueueBackend>,
    queues: QueueConfig,
    exception_count: AtomicU32,
    metrics: Arc<Metrics>,
}

impl QueueClient {
    pub fn new(backend: Arc<dyn QueueBackend>, queues: QueueConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            queues,
            exception_count: AtomicU32::new(0),
            metrics,
        }
    }

    pub fn resolve_endpoint(&self, queue: &str) -> Result<String, ConfigError> {
        self.queues.resolve(queue).map(str::to_string)
    }

    /// Transient failures absorbed so far.
    pub fn escalation_count(&self) -> u32 {
        self.exception_count.load(Ordering::SeqCst)
    }

    /// Sends one message. `Ok(None)` means the message was not created: either
    /// the backend returned no message id or a transient failure was absorbed.
    pub async fn send<T>(&self, queue: &str, payload: &T) -> Result<Option<String>, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let endpoint = self.resolve_endpoint(queue)?;
        let body = serde_json::to_string(payload)?;

        match self.backend.send_message(&endpoint, body).await {
            Ok(Some(message_id)) if !message_id.is_empty() => {
                debug!(queue, message_id = %message_id, "Message sent");
                Ok(Some(message_id))
            }
            Ok(_) => {
                error!(queue, "Could not create background job, backend returned no message id");
                Ok(None)
            }
            Err(e) => {
                self.absorb("send", queue, e)?;
                Ok(None)
            }
        }
    }

    pub async fn send_batch<T>(&self, queue: &str, payloads: &[T]) -> Result<SendBatchOutcome, QueueError>
    where
        T: Serialize,
    {
        let endpoint = self.resolve_endpoint(queue)?;

        if payloads.is_empty() {
            return Ok(SendBatchOutcome::Completed(BTreeMap::new()));
        }

        let entries = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                Ok(BatchEntry {
                    id: format!("{}{}", BATCH_ID_PREFIX, index),
                    body: serde_json::to_string(payload)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let report = match self.backend.send_message_batch(&endpoint, entries).await {
            Ok(report) => report,
            Err(e) => {
                self.absorb("send_batch", queue, e)?;
                return Ok(SendBatchOutcome::NotSent);
            }
        };

        debug!(queue, sent = report.successful.len(), total = payloads.len(), "Batch sent");

        let mut failed = BTreeMap::new();
        for failure in report.failed {
            match batch_index(&failure.id) {
                Some(index) => {
                    failed.insert(index, failure.message);
                }
                None => {
                    warn!(queue, id = %failure.id, "Backend reported a failure for an unknown batch entry");
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                queue,
                failed = failed.len(),
                total = payloads.len(),
                "Failed sending {} messages for queue {}",
                failed.len(),
                queue
            );
        }

        Ok(SendBatchOutcome::Completed(failed))
    }

    /// Receives pending messages, always asking for every message attribute.
    pub async fn receive(&self, queue: &str, options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        let endpoint = self.resolve_endpoint(queue)?;
        let options = ReceiveOptions {
            message_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            ..options
        };

        match self.backend.receive_message(&endpoint, options).await {
            Ok(messages) => {
                debug!(queue, count = messages.len(), "Received messages");
                Ok(messages)
            }
            Err(e) => {
                self.absorb("receive", queue, e)?;
                Ok(Vec::new())
            }
        }
    }

    /// Acknowledges a delivery. `Ok(false)` when a transient failure was absorbed.
    pub async fn delete(&self, queue: &str, receipt_token: &str) -> Result<bool, QueueError> {
        let endpoint = self.resolve_endpoint(queue)?;

        match self.backend.delete_message(&endpoint, receipt_token).await {
            Ok(()) => {
                debug!(queue, receipt = receipt_token, "Message deleted");
                Ok(true)
            }
            Err(e) => {
                self.absorb("delete", queue, e)?;
                Ok(false)
            }
        }
    }

    pub async fn get_attributes(
        &self,
        queue: &str,
        attribute_names: &[&str],
    ) -> Result<Option<Attributes>, QueueError> {
        let endpoint = self.resolve_endpoint(queue)?;
        let names = attribute_names.iter().map(|name| name.to_string()).collect();

        match self.backend.get_queue_attributes(&endpoint, names).await {
            Ok(attributes) => Ok(Some(attributes)),
            Err(e) => {
                self.absorb("get_attributes", queue, e)?;
                Ok(None)
            }
        }
    }

    /// Decides whether a backend failure may be swallowed. Returns the
    /// original error when it is fatal or the ceiling has been reached.
    fn absorb(&self, operation: &'static str, queue: &str, err: BackendError) -> Result<(), QueueError> {
        let classification = err.classification();
        self.metrics
            .backend_errors_total
            .with_label_values(&[operation, classification.as_str()])
            .inc();

        if classification.is_fatal() {
            error!(queue, operation, code = %err.code, error = %err.message, "Fatal queue backend error");
            return Err(err.into());
        }

        let absorbed = self
            .exception_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < ESCALATION_CEILING).then_some(count + 1)
            });

        match absorbed {
            Ok(previous) => {
                let count = previous + 1;
                self.metrics.escalation_count.set(f64::from(count));
                error!(
                    queue,
                    operation,
                    code = %err.code,
                    error = %err.message,
                    escalation_count = count,
                    "Transient queue backend error"
                );
                Ok(())
            }
            Err(count) => {
                error!(
                    queue,
                    operation,
                    code = %err.code,
                    error = %err.message,
                    escalation_count = count,
                    ceiling = ESCALATION_CEILING,
                    "Too many transient queue backend errors, escalating"
                );
                Err(err.into())
            }
        }
    }
}

fn batch_index(id: &str) -> Option<usize> {
    id.strip_prefix(BATCH_ID_PREFIX)?.parse().ok()
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Queue backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::backend::{BatchFailure, BatchReport, MockQueueBackend};
    use serde_json::json;

    const URL: &str = "https://queue.local/925075006686/testQueue1";

    fn client(backend: MockQueueBackend) -> QueueClient {
        QueueClient::new(
            Arc::new(backend),
            QueueConfig::new().with_queue("testQueue1", URL),
            Metrics::new().unwrap(),
        )
    }

    fn transient() -> BackendError {
        BackendError::new("ServiceUnavailable", "try again later")
    }

    #[tokio::test]
    async fn test_send_encodes_payload() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send_message()
            .withf(|endpoint, body| endpoint == URL && body == r#"{"key1":"value1","key2":"value2"}"#)
            .times(1)
            .returning(|_, _| Ok(Some("msg-1".to_string())));

        let client = client(backend);
        let id = client
            .send("testQueue1", &json!({"key1": "value1", "key2": "value2"}))
            .await
            .unwrap();

        assert_eq!(id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn test_send_without_message_id_is_soft_failure() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send_message()
            .times(1)
            .returning(|_, _| Ok(None));

        let client = client(backend);
        let id = client.send("testQueue1", "payload").await.unwrap();

        assert_eq!(id, None);
        assert_eq!(client.escalation_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_queue_fails_before_backend_call() {
        let client = client(MockQueueBackend::new());

        let err = client.send("foo", "payload").await.unwrap_err();
        assert!(matches!(err, QueueError::Config(ConfigError::NotConfigured { ref queue }) if queue == "foo"));

        let err = client.receive("foo", ReceiveOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert_eq!(client.escalation_count(), 0);
    }

    #[tokio::test]
    async fn test_send_batch_without_failures() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send_message_batch()
            .withf(|endpoint, entries| {
                endpoint == URL
                    && entries
                        == &vec![
                            BatchEntry {
                                id: "a0".to_string(),
                                body: r#"{"message1":"value1"}"#.to_string(),
                            },
                            BatchEntry {
                                id: "a1".to_string(),
                                body: r#"{"message3":"value2"}"#.to_string(),
                            },
                        ]
            })
            .times(1)
            .returning(|_, _| {
                Ok(BatchReport {
                    successful: vec!["a0".to_string(), "a1".to_string()],
                    failed: vec![],
                })
            });

        let client = client(backend);
        let outcome = client
            .send_batch("testQueue1", &[json!({"message1": "value1"}), json!({"message3": "value2"})])
            .await
            .unwrap();

        assert!(outcome.is_complete_success());
        assert_eq!(outcome, SendBatchOutcome::Completed(BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_send_batch_maps_failed_ids_to_indices() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send_message_batch()
            .times(1)
            .returning(|_, _| {
                Ok(BatchReport {
                    successful: vec!["a0".to_string()],
                    failed: vec![BatchFailure {
                        id: "a1".to_string(),
                        code: "InternalError".to_string(),
                        message: "you fail".to_string(),
                    }],
                })
            });

        let client = client(backend);
        let outcome = client
            .send_batch("testQueue1", &[json!({"message1": "value1"}), json!({"message3": "value2"})])
            .await
            .unwrap();

        let expected: BTreeMap<usize, String> = [(1, "you fail".to_string())].into_iter().collect();
        assert_eq!(outcome.failures(), Some(&expected));
        assert!(!outcome.is_complete_success());
    }

    #[tokio::test]
    async fn test_send_batch_total_failure_is_not_zero_failures() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send_message_batch()
            .times(1)
            .returning(|_, _| Err(transient()));

        let client = client(backend);
        let outcome = client.send_batch("testQueue1", &["a", "b"]).await.unwrap();

        assert_eq!(outcome, SendBatchOutcome::NotSent);
        assert_eq!(outcome.failures(), None);
        assert!(!outcome.is_complete_success());
        assert_eq!(client.escalation_count(), 1);
    }

    #[tokio::test]
    async fn test_send_batch_empty_skips_backend() {
        let client = client(MockQueueBackend::new());
        let outcome = client
            .send_batch::<serde_json::Value>("testQueue1", &[])
            .await
            .unwrap();
        assert!(outcome.is_complete_success());
    }

    #[tokio::test]
    async fn test_receive_requests_all_attributes() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_receive_message()
            .withf(|endpoint, options| {
                endpoint == URL
                    && options.message_attribute_names == vec!["All".to_string()]
                    && options.wait_time_seconds == 5
                    && options.max_messages == 3
            })
            .times(1)
            .returning(|_, _| Ok(vec![Message::new("myId", "\"foo\"")]));

        let client = client(backend);
        let options = ReceiveOptions {
            max_messages: 3,
            wait_time_seconds: 5,
            visibility_timeout_seconds: None,
            message_attribute_names: vec![],
        };
        let messages = client.receive("testQueue1", options).await.unwrap();

        assert_eq!(messages, vec![Message::new("myId", "\"foo\"")]);
    }

    #[tokio::test]
    async fn test_twenty_six_transient_failure_escalates() {
        let mut backend = MockQueueBackend::new();
        let mut call = 0;
        backend
            .expect_receive_message()
            .times(26)
            .returning(move |_, _| {
                call += 1;
                // Codes vary; the ceiling counts every transient failure.
                if call % 2 == 0 {
                    Err(BackendError::new("RequestThrottled", "slow down"))
                } else {
                    Err(transient())
                }
            });

        let client = client(backend);
        for _ in 0..ESCALATION_CEILING {
            let messages = client.receive("testQueue1", ReceiveOptions::default()).await.unwrap();
            assert!(messages.is_empty());
        }
        assert_eq!(client.escalation_count(), 25);

        let err = client
            .receive("testQueue1", ReceiveOptions::default())
            .await
            .unwrap_err();
        match err {
            QueueError::Backend(e) => assert_eq!(e.code, "RequestThrottled"),
            other => panic!("expected backend error, got {other:?}"),
        }
        assert_eq!(client.escalation_count(), 25);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_on_first_occurrence() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_receive_message()
            .times(1)
            .returning(|_, _| Err(BackendError::new("AccessDenied", "403 Forbidden")));

        let client = client(backend);
        let err = client
            .receive("testQueue1", ReceiveOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Backend(ref e) if e.code == "AccessDenied"));
        assert_eq!(client.escalation_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_counted_between_transients() {
        let mut backend = MockQueueBackend::new();
        let mut call = 0;
        backend
            .expect_delete_message()
            .times(3)
            .returning(move |_, _| {
                call += 1;
                if call == 2 {
                    Err(BackendError::new("QueueDoesNotExist", "gone"))
                } else {
                    Err(transient())
                }
            });

        let client = client(backend);
        assert!(!client.delete("testQueue1", "r1").await.unwrap());
        assert!(client.delete("testQueue1", "r2").await.is_err());
        assert!(!client.delete("testQueue1", "r3").await.unwrap());
        assert_eq!(client.escalation_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_passes_receipt_token() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_delete_message()
            .withf(|endpoint, receipt| endpoint == URL && receipt == "myId")
            .times(1)
            .returning(|_, _| Ok(()));

        let client = client(backend);
        assert!(client.delete("testQueue1", "myId").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_attributes() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_get_queue_attributes()
            .withf(|_, names| names == &vec!["ApproximateNumberOfMessages".to_string()])
            .times(2)
            .returning({
                let mut call = 0;
                move |_, _| {
                    call += 1;
                    if call == 1 {
                        Ok([("ApproximateNumberOfMessages".to_string(), "7".to_string())]
                            .into_iter()
                            .collect())
                    } else {
                        Err(transient())
                    }
                }
            });

        let client = client(backend);
        let attributes = client
            .get_attributes("testQueue1", &["ApproximateNumberOfMessages"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attributes["ApproximateNumberOfMessages"], "7");

        let attributes = client
            .get_attributes("testQueue1", &["ApproximateNumberOfMessages"])
            .await
            .unwrap();
        assert_eq!(attributes, None);
    }

    #[test]
    fn test_batch_index() {
        assert_eq!(batch_index("a0"), Some(0));
        assert_eq!(batch_index("a12"), Some(12));
        assert_eq!(batch_index("b1"), None);
        assert_eq!(batch_index("a"), None);
    }
}
