// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy for the AMQP resilience overlay.
//! The `AmqpError` enum covers configuration and payload defects (fatal,
//! caller-facing) as well as failures of the individual broker operations:
//! connecting, declaring topology, publishing, consuming and acknowledging.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Handler-reported failure is *not* represented here: a consumer handler
/// returning `false` is the signal driving the retry/dead-letter decision,
/// not an error.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Missing or invalid configuration, detected at validation or
    /// resolution time. Never retried.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A structured publish message without a payload. Fatal per-message at
    /// publish time; signals a caller defect.
    #[error("payload missing: {0}")]
    PayloadMissingError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing the broker connection
    #[error("failure to close the connection")]
    CloseConnectionError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer on the given queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerCreationError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error republishing a failed delivery to its retry queue
    #[error("failure to publish to retry queue")]
    PublishingToRetryError,

    /// Error quarantining a failed delivery into its dead queue
    #[error("failure to publish to dead queue")]
    PublishingToDeadError,
}
