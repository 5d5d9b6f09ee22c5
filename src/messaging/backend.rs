use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::contracts::BackendError;

/// Longest long-poll wait a receive may ask for.
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Most messages a single receive may return.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Requests every message attribute the backend knows about.
pub const ALL_ATTRIBUTES: &str = "All";

pub type Attributes = HashMap<String, String>;

/// A message as handed out by a receive call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque handle needed to delete (acknowledge) this delivery.
    pub receipt_token: String,
    /// JSON encoded payload.
    pub raw_body: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Message {
    pub fn new(receipt_token: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Self {
            receipt_token: receipt_token.into(),
            raw_body: raw_body.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Long-poll parameters, passed through to the backend untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: u32,
    pub wait_time_seconds: u32,
    pub visibility_timeout_seconds: Option<u32>,
    pub message_attribute_names: Vec<String>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time_seconds: MAX_WAIT_TIME_SECONDS,
            visibility_timeout_seconds: None,
            message_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Per-entry result of a batch send that reached the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// The queue service RPC surface, keyed by endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Returns the message id assigned by the backend, if it reported one.
    async fn send_message(&self, endpoint: &str, body: String)
        -> Result<Option<String>, BackendError>;

    async fn send_message_batch(
        &self,
        endpoint: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchReport, BackendError>;

    async fn receive_message(
        &self,
        endpoint: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Message>, BackendError>;

    async fn delete_message(&self, endpoint: &str, receipt_token: &str) -> Result<(), BackendError>;

    async fn get_queue_attributes(
        &self,
        endpoint: &str,
        attribute_names: Vec<String>,
    ) -> Result<Attributes, BackendError>;
}
