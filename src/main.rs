use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use queue_worker::config::Config;
use queue_worker::messaging::{
    AmqpBackend, Attributes, HandlerCatalog, HandlerError, MessageHandler, QueueClient, Worker,
    MAX_MESSAGES_PROCESSED,
};
use queue_worker::metrics::{server::start_metrics_server, Metrics};

#[derive(Debug, Parser)]
#[command(name = "queue-worker", version, about = "Polls configured queues and dispatches messages to handlers")]
struct Cli {
    /// Name of this worker, used in logs
    #[arg(long, default_value = "default")]
    label: String,

    /// Full cycles over all queues before exiting, -1 to run until stopped
    #[arg(long, default_value_t = MAX_MESSAGES_PROCESSED as i64, allow_negative_numbers = true)]
    iterations: i64,
}

/// Logs the payload and acknowledges it.
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(
        &self,
        payload: Value,
        receipt_token: &str,
        attributes: &Attributes,
    ) -> Result<bool, HandlerError> {
        let preview: String = payload.to_string().chars().take(100).collect();
        info!(
            receipt = receipt_token,
            attributes = attributes.len(),
            payload_preview = %preview,
            "Handling message"
        );
        Ok(true)
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %cli.label,
        iterations = cli.iterations,
        "Queue worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let backend = Arc::new(AmqpBackend::new(config.amqp_url.clone()));
    if let Err(e) = backend.connect().await {
        eprintln!("Failed to connect to RabbitMQ: {}", e);
        std::process::exit(1);
    }

    let client = Arc::new(QueueClient::new(
        backend.clone(),
        config.queues.clone(),
        metrics.clone(),
    ));
    let mut worker = Worker::new(client, metrics.clone()).with_receive_options(config.receive.clone());

    let catalog = HandlerCatalog::new().with_handler("log", Arc::new(LogHandler));

    for (queue, handler) in &config.bindings {
        if let Err(e) = worker.register_named(queue, handler, &catalog) {
            eprintln!("Failed to register handler {} for queue {}: {}", handler, queue, e);
            eprintln!("Available handlers: {}", catalog.names().join(", "));
            std::process::exit(1);
        }
    }

    let stop_requested = Arc::new(AtomicBool::new(false));
    let stop_flag = stop_requested.clone();
    worker.hooks_mut().listen(move |event| {
        if stop_flag.load(Ordering::SeqCst) {
            event.stop();
        }
    });

    let signal_flag = stop_requested.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, stopping after the current queue");
                signal_flag.store(true, Ordering::SeqCst);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let outcome = worker.run(&cli.label, cli.iterations).await;

    if let Err(e) = backend.disconnect().await {
        warn!(error = %e, "Error during RabbitMQ shutdown");
    }

    match outcome {
        Ok(reason) => info!(reason = ?reason, "Queue worker stopped"),
        Err(e) => {
            error!(error = %e, "Queue worker terminated");
            std::process::exit(1);
        }
    }
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
