//! The polling loop.
//!
//! A [`Worker`] owns an ordered set of queue bindings. Every cycle visits each
//! binding in registration order: fire `Queue.beforeWork`, receive, hand every
//! message to the bound handler, delete the ones it acknowledged, fire
//! `Queue.afterWork`. Everything runs in sequence on the calling task.
//!
//! Errors are not caught here. A handler error, or a backend error the
//! [`QueueClient`] refused to absorb, ends the run and is returned to the
//! caller, which is expected to log it and restart the process.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::backend::{Message, ReceiveOptions};
use super::handler::{HandlerCatalog, HandlerError, MessageHandler};
use super::hooks::{Hook, Hooks, WorkEvent};
use super::queue::{QueueClient, QueueError};
use crate::config::ConfigError;
use crate::metrics::Metrics;

/// Default number of cycles a worker runs before handing control back, so a
/// supervisor can restart it with a fresh process.
pub const MAX_MESSAGES_PROCESSED: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterations {
    Unbounded,
    Limit(u64),
}

impl From<i64> for Iterations {
    /// Negative counts mean "run until stopped".
    fn from(count: i64) -> Self {
        u64::try_from(count).map_or(Self::Unbounded, Self::Limit)
    }
}

impl Default for Iterations {
    fn default() -> Self {
        Self::Limit(MAX_MESSAGES_PROCESSED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All requested cycles completed.
    IterationLimit,
    /// A hook listener requested a stop.
    Aborted { hook: Hook },
    /// Nothing was registered, so there was nothing to poll.
    NoBindings,
}

struct QueueBinding {
    name: String,
    handler: Arc<dyn MessageHandler>,
}

pub struct Worker {
    client: Arc<QueueClient>,
    bindings: Vec<QueueBinding>,
    hooks: Hooks,
    receive_options: ReceiveOptions,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(client: Arc<QueueClient>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            bindings: Vec::new(),
            hooks: Hooks::new(),
            receive_options: ReceiveOptions::default(),
            metrics,
        }
    }

    pub fn with_receive_options(mut self, options: ReceiveOptions) -> Self {
        self.receive_options = options;
        self
    }

    pub fn client(&self) -> &Arc<QueueClient> {
        &self.client
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Queue names in dispatch order.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|binding| binding.name.as_str())
    }

    /// Binds `handler` to `queue`. Registering a queue again replaces its
    /// handler but keeps its place in the dispatch order.
    pub fn register_handler(
        &mut self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), WorkerError> {
        let endpoint = self.client.resolve_endpoint(queue)?;
        info!(queue, endpoint = %endpoint, "Adding handler for queue");

        match self.bindings.iter_mut().find(|binding| binding.name == queue) {
            Some(binding) => binding.handler = handler,
            None => self.bindings.push(QueueBinding {
                name: queue.to_string(),
                handler,
            }),
        }

        Ok(())
    }

    pub fn register_named(
        &mut self,
        queue: &str,
        handler_name: &str,
        catalog: &HandlerCatalog,
    ) -> Result<(), WorkerError> {
        let handler = catalog
            .get(handler_name)
            .ok_or_else(|| WorkerError::InvalidHandler(handler_name.to_string()))?;
        self.register_handler(queue, handler)
    }

    /// Runs `max_iterations` full cycles over every registered queue, or
    /// until stopped when `max_iterations` is negative.
    pub async fn run(&self, label: &str, max_iterations: i64) -> Result<StopReason, WorkerError> {
        let iterations = Iterations::from(max_iterations);
        info!(
            worker = label,
            queues = self.bindings.len(),
            iterations = ?iterations,
            "Starting {} worker",
            label
        );

        if self.bindings.is_empty() {
            warn!(worker = label, "No queues registered, nothing to do");
            return Ok(StopReason::NoBindings);
        }

        self.metrics.active_workers.inc();
        let result = self.run_cycles(label, iterations).await;
        self.metrics.active_workers.dec();

        match &result {
            Ok(reason) => info!(worker = label, reason = ?reason, "Finished {} worker", label),
            Err(e) => error!(worker = label, error = %e, "Worker stopped on error"),
        }

        result
    }

    async fn run_cycles(&self, label: &str, iterations: Iterations) -> Result<StopReason, WorkerError> {
        let mut cycle: u64 = 0;

        loop {
            if let Iterations::Limit(limit) = iterations {
                if cycle >= limit {
                    return Ok(StopReason::IterationLimit);
                }
            }

            for binding in &self.bindings {
                if !self.trigger(Hook::BeforeWork, label, &binding.name, cycle) {
                    return Ok(StopReason::Aborted {
                        hook: Hook::BeforeWork,
                    });
                }

                let messages = self
                    .client
                    .receive(&binding.name, self.receive_options.clone())
                    .await?;
                if !messages.is_empty() {
                    self.work(binding, messages).await?;
                }

                if !self.trigger(Hook::AfterWork, label, &binding.name, cycle) {
                    return Ok(StopReason::Aborted {
                        hook: Hook::AfterWork,
                    });
                }
            }

            self.metrics.cycles_total.inc();
            cycle = cycle.saturating_add(1);
        }
    }

    fn trigger(&self, hook: Hook, label: &str, queue: &str, cycle: u64) -> bool {
        let mut event = WorkEvent::new(hook, label, queue, cycle);
        let proceed = self.hooks.dispatch(&mut event);
        if !proceed {
            info!(worker = label, queue, hook = %hook, "Stop requested by hook listener");
        }
        proceed
    }

    async fn work(&self, binding: &QueueBinding, messages: Vec<Message>) -> Result<(), WorkerError> {
        let queue = binding.name.as_str();

        for message in messages {
            self.metrics
                .messages_received_total
                .with_label_values(&[queue])
                .inc();

            let payload = decode_body(queue, &message);
            let start = Instant::now();

            let acknowledged = match binding
                .handler
                .handle(payload, &message.receipt_token, &message.attributes)
                .await
            {
                Ok(acknowledged) => acknowledged,
                Err(source) => {
                    self.observe(queue, "error", start);
                    error!(queue, receipt = %message.receipt_token, error = %source, "Handler failed");
                    return Err(WorkerError::Handler {
                        queue: queue.to_string(),
                        source,
                    });
                }
            };

            if acknowledged {
                if self.client.delete(queue, &message.receipt_token).await? {
                    self.observe(queue, "acknowledged", start);
                    self.metrics
                        .messages_acknowledged_total
                        .with_label_values(&[queue])
                        .inc();
                } else {
                    self.observe(queue, "delete_failed", start);
                    debug!(queue, receipt = %message.receipt_token, "Delete failed, message left for redelivery");
                }
            } else {
                self.observe(queue, "unacknowledged", start);
                self.metrics
                    .messages_unacknowledged_total
                    .with_label_values(&[queue])
                    .inc();
                debug!(queue, receipt = %message.receipt_token, "Message left for redelivery");
            }
        }

        Ok(())
    }

    fn observe(&self, queue: &str, outcome: &str, start: Instant) {
        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[queue, outcome])
            .observe(start.elapsed().as_secs_f64());
    }
}

/// Bodies that are not valid JSON reach the handler as `null`.
fn decode_body(queue: &str, message: &Message) -> Value {
    serde_json::from_str(&message.raw_body).unwrap_or_else(|e| {
        warn!(queue, receipt = %message.receipt_token, error = %e, "Message body is not valid JSON");
        Value::Null
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid handler {0:?}: no handler registered under that name")]
    InvalidHandler(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Handler for queue {queue} failed: {source}")]
    Handler {
        queue: String,
        #[source]
        source: HandlerError,
    },
}
