use std::collections::BTreeMap;
use std::env;

use crate::messaging::backend::{ReceiveOptions, MAX_RECEIVE_BATCH, MAX_WAIT_TIME_SECONDS};

const DEFAULT_METRICS_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct Config {
    pub amqp_url: String,
    pub queues: QueueConfig,
    /// `(queue, handler name)` pairs in declaration order.
    pub bindings: Vec<(String, String)>,
    pub receive: ReceiveOptions,
    pub metrics_port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_url = lookup("AMQP_URL").ok_or(ConfigError::MissingRequired("AMQP_URL"))?;

        let queues_spec =
            lookup("WORKER_QUEUES").ok_or(ConfigError::MissingRequired("WORKER_QUEUES"))?;
        let mut queues = QueueConfig::new();
        let mut declared: Vec<String> = Vec::new();
        for (name, endpoint) in parse_pairs("WORKER_QUEUES", &queues_spec)? {
            if !declared.contains(&name) {
                declared.push(name.clone());
            }
            queues = queues.with_queue(name, endpoint);
        }

        let bindings = match lookup("WORKER_BINDINGS") {
            Some(spec) => parse_pairs("WORKER_BINDINGS", &spec)?,
            None => declared
                .into_iter()
                .map(|name| (name, "log".to_string()))
                .collect(),
        };

        let wait_time_seconds =
            parse_number(&lookup, "WORKER_WAIT_TIME_SECONDS", MAX_WAIT_TIME_SECONDS)?;
        if wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(ConfigError::Invalid {
                var: "WORKER_WAIT_TIME_SECONDS",
                reason: format!("must be at most {}", MAX_WAIT_TIME_SECONDS),
            });
        }

        let max_messages: u32 = parse_number(&lookup, "WORKER_MAX_MESSAGES", 1)?;
        if !(1..=MAX_RECEIVE_BATCH).contains(&max_messages) {
            return Err(ConfigError::Invalid {
                var: "WORKER_MAX_MESSAGES",
                reason: format!("must be between 1 and {}", MAX_RECEIVE_BATCH),
            });
        }

        let metrics_port = parse_number(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?;
        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            amqp_url,
            queues,
            bindings,
            receive: ReceiveOptions {
                max_messages,
                wait_time_seconds,
                ..ReceiveOptions::default()
            },
            metrics_port,
            rust_log,
        })
    }
}

/// Queue name to endpoint mapping.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    endpoints: BTreeMap<String, String>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.endpoints.insert(name.into(), endpoint.into());
        self
    }

    pub fn resolve(&self, name: &str) -> Result<&str, ConfigError> {
        self.endpoints
            .get(name)
            .map(String::as_str)
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| ConfigError::NotConfigured {
                queue: name.to_string(),
            })
    }
}

fn parse_pairs(var: &'static str, spec: &str) -> Result<Vec<(String, String)>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (key, value) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                var,
                reason: format!("expected name=value, got {:?}", entry),
            })?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(ConfigError::Invalid {
                    var,
                    reason: format!("empty name or value in {:?}", entry),
                });
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_number<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{queue} URL was not configured")]
    NotConfigured { queue: String },
}
