//! RabbitMQ implementation of [`QueueBackend`].
//!
//! Endpoints are queue names on the broker. Messages are published to the
//! default exchange, fetched with `basic.get` and deleted by acknowledging
//! their delivery tag, which doubles as the receipt token. A message that is
//! fetched and never acknowledged goes back to the queue when the channel
//! closes.

use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions},
    message::Delivery,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{
    Attributes, BatchEntry, BatchFailure, BatchReport, Message, QueueBackend, ReceiveOptions,
    ALL_ATTRIBUTES, MAX_RECEIVE_BATCH,
};
use super::channel::ChannelProvider;
use super::connection::RabbitMqConnection;
use crate::contracts::BackendError;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const PERSISTENT: u8 = 2;

pub const ATTRIBUTE_APPROXIMATE_MESSAGES: &str = "ApproximateNumberOfMessages";
pub const ATTRIBUTE_CONSUMER_COUNT: &str = "ConsumerCount";
pub const ATTRIBUTE_QUEUE_NAME: &str = "QueueName";

enum ConnectionState {
    Disconnected,
    Connected {
        connection: RabbitMqConnection,
        channel: Channel,
    },
}

pub struct AmqpBackend {
    url: String,
    state: Mutex<ConnectionState>,
}

impl AmqpBackend {
    /// Creates a disconnected backend. The connection is opened on first use.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub async fn connect(&self) -> Result<(), BackendError> {
        self.channel().await.map(|_| ())
    }

    /// Closes the connection. The next call opens a fresh one.
    pub async fn disconnect(&self) -> Result<(), BackendError> {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnectionState::Disconnected);

        if let ConnectionState::Connected {
            connection,
            channel,
        } = previous
        {
            ChannelProvider::close_channel(channel).await?;
            connection.shutdown().await?;
        }

        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        match &*self.state.lock().await {
            ConnectionState::Connected {
                connection,
                channel,
            } => connection.is_connected() && channel.status().connected(),
            ConnectionState::Disconnected => false,
        }
    }

    async fn channel(&self) -> Result<Channel, BackendError> {
        let mut state = self.state.lock().await;

        if let ConnectionState::Connected {
            connection,
            channel,
        } = &*state
        {
            if connection.is_connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
            warn!("RabbitMQ connection lost, reconnecting");
            close_stale(std::mem::replace(&mut *state, ConnectionState::Disconnected)).await;
        }

        let connection = RabbitMqConnection::connect(&self.url).await?;
        let channel = ChannelProvider::create_channel(connection.get_connection()).await?;
        *state = ConnectionState::Connected {
            connection,
            channel: channel.clone(),
        };

        Ok(channel)
    }

    /// Converts a lapin error, dropping the connection when it is no longer usable.
    async fn check<T>(&self, result: Result<T, lapin::Error>) -> Result<T, BackendError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if loses_connection(&e) {
                    warn!(error = %e, "Invalidating RabbitMQ connection");
                    let stale = std::mem::replace(
                        &mut *self.state.lock().await,
                        ConnectionState::Disconnected,
                    );
                    close_stale(stale).await;
                }
                Err(e.into())
            }
        }
    }

    /// Publishes one persistent message. `Ok(None)` when the broker nacked it.
    async fn publish(
        &self,
        channel: &Channel,
        endpoint: &str,
        body: &str,
    ) -> Result<Option<String>, BackendError> {
        let message_id = Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message_id.clone()))
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .check(
                channel
                    .basic_publish(
                        "",
                        endpoint,
                        BasicPublishOptions {
                            mandatory: true,
                            ..Default::default()
                        },
                        body.as_bytes(),
                        properties,
                    )
                    .await,
            )
            .await?;

        match self.check(confirm.await).await? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(Some(message_id)),
            Confirmation::Ack(Some(_)) => Err(BackendError::new(
                "QueueDoesNotExist",
                format!("message to {} was returned as unroutable", endpoint),
            )),
            Confirmation::Nack(_) => {
                warn!(endpoint, message_id = %message_id, "Broker rejected published message");
                Ok(None)
            }
        }
    }
}

/// Best-effort close of a connection that is being replaced.
async fn close_stale(state: ConnectionState) {
    if let ConnectionState::Connected {
        connection,
        channel,
    } = state
    {
        if let Err(e) = ChannelProvider::close_channel(channel).await {
            debug!(error = %e, "Stale channel did not close cleanly");
        }
        if let Err(e) = connection.shutdown().await {
            debug!(error = %e, "Stale connection did not close cleanly");
        }
    }
}

#[async_trait]
impl QueueBackend for AmqpBackend {
    async fn send_message(&self, endpoint: &str, body: String) -> Result<Option<String>, BackendError> {
        let channel = self.channel().await?;
        self.publish(&channel, endpoint, &body).await
    }

    async fn send_message_batch(
        &self,
        endpoint: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchReport, BackendError> {
        let channel = self.channel().await?;
        let mut report = BatchReport::default();

        for entry in entries {
            let published = self.publish(&channel, endpoint, &entry.body).await;
            record_published(&mut report, entry.id, published)?;
        }

        Ok(report)
    }

    async fn receive_message(
        &self,
        endpoint: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Message>, BackendError> {
        let channel = self.channel().await?;
        let max_messages = options.max_messages.clamp(1, MAX_RECEIVE_BATCH) as usize;
        let deadline = Instant::now() + Duration::from_secs(u64::from(options.wait_time_seconds));
        let mut messages = Vec::new();

        loop {
            let fetched = self
                .check(channel.basic_get(endpoint, BasicGetOptions::default()).await)
                .await?;

            match fetched {
                Some(message) => {
                    messages.push(to_message(message.delivery));
                    if messages.len() >= max_messages {
                        break;
                    }
                }
                None if !messages.is_empty() || Instant::now() >= deadline => break,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        debug!(endpoint, count = messages.len(), "Fetched messages");
        Ok(messages)
    }

    async fn delete_message(&self, endpoint: &str, receipt_token: &str) -> Result<(), BackendError> {
        let delivery_tag: u64 = receipt_token.parse().map_err(|_| {
            BackendError::new(
                "ReceiptHandleIsInvalid",
                format!("{:?} is not a delivery tag of {}", receipt_token, endpoint),
            )
        })?;

        let channel = self.channel().await?;
        self.check(
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await,
        )
        .await
    }

    async fn get_queue_attributes(
        &self,
        endpoint: &str,
        attribute_names: Vec<String>,
    ) -> Result<Attributes, BackendError> {
        let channel = self.channel().await?;
        let queue = self
            .check(
                channel
                    .queue_declare(
                        endpoint,
                        QueueDeclareOptions {
                            passive: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await,
            )
            .await?;

        let available = [
            (ATTRIBUTE_APPROXIMATE_MESSAGES, queue.message_count().to_string()),
            (ATTRIBUTE_CONSUMER_COUNT, queue.consumer_count().to_string()),
            (ATTRIBUTE_QUEUE_NAME, queue.name().as_str().to_string()),
        ];
        let wants_all = attribute_names.iter().any(|name| name == ALL_ATTRIBUTES);

        Ok(available
            .into_iter()
            .filter(|(name, _)| wants_all || attribute_names.iter().any(|wanted| wanted == name))
            .map(|(name, value)| (name.to_string(), value))
            .collect())
    }
}

impl From<lapin::Error> for BackendError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => {
                BackendError::new(error_code(amqp.get_id()), amqp.get_message().as_str())
            }
            lapin::Error::IOError(_) => BackendError::new("ServiceUnavailable", err.to_string()),
            _ => BackendError::new("InternalError", err.to_string()),
        }
    }
}

/// Folds one publish result into the batch report. Only broker nacks count as
/// per-entry failures; any other error aborts the whole batch.
fn record_published(
    report: &mut BatchReport,
    id: String,
    published: Result<Option<String>, BackendError>,
) -> Result<(), BackendError> {
    match published? {
        Some(_) => report.successful.push(id),
        None => report.failed.push(BatchFailure {
            id,
            code: "InternalError".to_string(),
            message: "message was rejected by the broker".to_string(),
        }),
    }
    Ok(())
}

fn loses_connection(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
    )
}

/// Maps AMQP reply codes onto backend error codes.
fn error_code(reply_code: u16) -> &'static str {
    match reply_code {
        311 => "ContentTooLarge",
        320 => "ServiceUnavailable",
        402 => "InvalidAddress",
        403 => "AccessDenied",
        404 => "QueueDoesNotExist",
        405 => "ResourceLocked",
        406 => "PreconditionFailed",
        502 => "InvalidRequest",
        503 | 540 => "InvalidAction",
        530 => "InvalidSecurity",
        _ => "InternalError",
    }
}

fn to_message(delivery: Delivery) -> Message {
    let properties = &delivery.properties;
    let mut attributes = Attributes::new();

    if let Some(headers) = properties.headers() {
        for (name, value) in headers.inner() {
            attributes.insert(name.as_str().to_string(), header_value(value));
        }
    }
    if let Some(message_id) = properties.message_id() {
        attributes.insert("MessageId".to_string(), message_id.as_str().to_string());
    }
    if let Some(content_type) = properties.content_type() {
        attributes.insert("ContentType".to_string(), content_type.as_str().to_string());
    }
    attributes.insert("Redelivered".to_string(), delivery.redelivered.to_string());

    Message {
        receipt_token: delivery.delivery_tag.to_string(),
        raw_body: String::from_utf8_lossy(&delivery.data).into_owned(),
        attributes,
    }
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortInt(n) => n.to_string(),
        AMQPValue::ShortUInt(n) => n.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongUInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        AMQPValue::Timestamp(n) => n.to_string(),
        other => format!("{:?}", other),
    }
}
