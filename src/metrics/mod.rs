use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_received_total: CounterVec,
    pub messages_acknowledged_total: CounterVec,
    pub messages_unacknowledged_total: CounterVec,
    pub backend_errors_total: CounterVec,
    pub escalation_count: Gauge,
    pub cycles_total: Counter,
    pub message_processing_duration_seconds: HistogramVec,
    pub active_workers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_received_total = CounterVec::new(
            Opts::new(
                "worker_messages_received_total",
                "Total number of messages received from the backend",
            ),
            &["queue"],
        )?;

        let messages_acknowledged_total = CounterVec::new(
            Opts::new(
                "worker_messages_acknowledged_total",
                "Total number of messages acknowledged by their handler and deleted",
            ),
            &["queue"],
        )?;

        let messages_unacknowledged_total = CounterVec::new(
            Opts::new(
                "worker_messages_unacknowledged_total",
                "Total number of messages left on the queue for redelivery",
            ),
            &["queue"],
        )?;

        let backend_errors_total = CounterVec::new(
            Opts::new(
                "worker_backend_errors_total",
                "Total number of failed queue backend calls",
            ),
            &["operation", "classification"],
        )?;

        let escalation_count = Gauge::new(
            "worker_escalation_count",
            "Transient backend errors absorbed since the process started",
        )?;

        let cycles_total = Counter::new(
            "worker_cycles_total",
            "Total number of completed polling cycles over all queues",
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "worker_message_processing_duration_seconds",
                "Time taken by a handler to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "outcome"],
        )?;

        let active_workers = Gauge::new("worker_active", "Number of running worker loops")?;

        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_acknowledged_total.clone()))?;
        registry.register(Box::new(messages_unacknowledged_total.clone()))?;
        registry.register(Box::new(backend_errors_total.clone()))?;
        registry.register(Box::new(escalation_count.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Arc::new(Self {
            messages_received_total,
            messages_acknowledged_total,
            messages_unacknowledged_total,
            backend_errors_total,
            escalation_count,
            cycles_total,
            message_processing_duration_seconds,
            active_workers,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.cycles_total.inc();

        assert_eq!(first.cycles_total.get(), 1.0);
        assert_eq!(second.cycles_total.get(), 0.0);
    }

    #[test]
    fn test_gather_exposes_worker_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics
            .messages_received_total
            .with_label_values(&["job1"])
            .inc();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"worker_messages_received_total".to_string()));
        assert!(names.contains(&"worker_escalation_count".to_string()));
    }
}
