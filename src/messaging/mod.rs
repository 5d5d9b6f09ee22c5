pub mod amqp;
pub mod backend;
pub mod channel;
pub mod connection;
pub mod handler;
pub mod hooks;
pub mod queue;
pub mod worker;

pub use amqp::AmqpBackend;
pub use backend::{Attributes, Message, QueueBackend, ReceiveOptions};
pub use channel::ChannelProvider;
pub use connection::RabbitMqConnection;
pub use handler::{handler_fn, HandlerCatalog, HandlerError, MessageHandler};
pub use hooks::{Hook, Hooks, WorkEvent};
pub use queue::{QueueClient, QueueError, SendBatchOutcome, ESCALATION_CEILING};
pub use worker::{Iterations, StopReason, Worker, WorkerError, MAX_MESSAGES_PROCESSED};
