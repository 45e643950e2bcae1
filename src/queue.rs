// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! This module provides the `QueueSpec` type describing a RabbitMQ queue:
//! declaration flags, the exchange it is bound to, and the retry policy
//! (whether failed deliveries are retried, how often, and how fast the
//! backoff grows). It also owns the naming convention for the per-queue
//! retry and dead companions.

use lapin::options::QueueDeclareOptions;
use serde::Deserialize;

/// Backoff growth applied to the previous delay on every retry cycle.
pub const DEFAULT_EXPONENTIAL_BACKOFF_FACTOR: f64 = 1.1;

/// Name of the retry companion of a queue.
pub fn retry_queue_name(queue_name: &str) -> String {
    format!("retry_{queue_name}")
}

/// Name of the dead companion of a queue.
pub fn dead_queue_name(queue_name: &str) -> String {
    format!("dead_{queue_name}")
}

/// Declaration parameters and retry policy of a queue.
///
/// `exchange` is required (an empty string means unmapped and fails
/// resolution); `routing_key` defaults to the queue name at resolution time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    pub exchange: String,
    pub routing_key: Option<String>,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub retriable: bool,
    pub max_retry_count: u32,
    pub exponential_backoff_factor: f64,
    pub message_ttl: Option<u32>,
    pub max_length: Option<u32>,
    pub max_length_bytes: Option<u32>,
}

impl Default for QueueSpec {
    fn default() -> QueueSpec {
        QueueSpec {
            exchange: String::new(),
            routing_key: None,
            durable: false,
            auto_delete: false,
            exclusive: false,
            passive: false,
            no_wait: false,
            retriable: false,
            max_retry_count: 0,
            exponential_backoff_factor: DEFAULT_EXPONENTIAL_BACKOFF_FACTOR,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
        }
    }
}

impl QueueSpec {
    /// Creates a queue specification bound to the given exchange.
    pub fn new(exchange: &str) -> QueueSpec {
        QueueSpec {
            exchange: exchange.to_owned(),
            ..QueueSpec::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Overrides the routing key used to bind the queue.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets the message Time-To-Live of the queue, in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Enables retry with the given budget and backoff growth factor.
    ///
    /// A retriable queue gets a `retry_<queue>` companion holding failed
    /// deliveries for their backoff delay and a `dead_<queue>` companion
    /// quarantining the ones that exhaust the budget.
    pub fn with_retry(mut self, max_retry_count: u32, exponential_backoff_factor: f64) -> Self {
        self.retriable = true;
        self.max_retry_count = max_retry_count;
        self.exponential_backoff_factor = exponential_backoff_factor;
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.no_wait,
        }
    }
}
