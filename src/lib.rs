//! Polls named queues, hands each message to the handler registered for its
//! queue and deletes the messages the handler acknowledged.

pub mod config;
pub mod contracts;
pub mod messaging;
pub mod metrics;
