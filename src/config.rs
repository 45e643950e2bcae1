// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! This module provides the validated, immutable configuration value that
//! every component of the overlay is constructed with: the broker URL, the
//! exchange and queue specifications, the names of the shared retry and dead
//! exchanges, and the channel-level settings (publisher confirms, consumer
//! prefetch, confirm timeout).
//!
//! Loading the configuration from a file is the host's job; this struct is
//! the already-parsed in-memory shape. `validate` must succeed before the
//! configuration is handed to a registry.

use crate::{errors::AmqpError, exchange::ExchangeSpec, queue::QueueSpec};
use serde::Deserialize;
use std::collections::HashMap;

/// Broker URL used when `broker_url` is unset.
pub const DEFAULT_BROKER_URL: &str = "amqp://127.0.0.1:5672/%2f";

/// Default upper bound on the publisher confirm wait, in milliseconds.
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 30_000;

/// Immutable settings for the overlay.
///
/// The exchange and queue maps are keyed by broker-side name. `exchanges`
/// and `queues` are required; all other fields have usable defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub broker_url: Option<String>,
    pub exchanges: Option<HashMap<String, ExchangeSpec>>,
    pub queues: Option<HashMap<String, QueueSpec>>,
    pub retry_exchange_name: Option<String>,
    pub dead_exchange_name: Option<String>,
    pub publisher_confirms: bool,
    pub consumer_prefetch_count: u16,
    /// Expiry of the confirm wait counts as a failed publish batch.
    pub confirm_timeout_ms: u64,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            broker_url: None,
            exchanges: None,
            queues: None,
            retry_exchange_name: None,
            dead_exchange_name: None,
            publisher_confirms: false,
            consumer_prefetch_count: 0,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
        }
    }
}

impl Configuration {
    /// Checks the required options are present.
    ///
    /// `exchanges` is checked before `queues`; the first missing option is
    /// the one reported.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchanges.is_none() {
            return Err(AmqpError::ConfigurationError(
                "Missing required option: exchanges".to_owned(),
            ));
        }

        if self.queues.is_none() {
            return Err(AmqpError::ConfigurationError(
                "Missing required option: queues".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn broker_url(&self) -> &str {
        self.broker_url.as_deref().unwrap_or(DEFAULT_BROKER_URL)
    }

    /// Looks up the specification of the given queue.
    pub fn queue_spec(&self, queue_name: &str) -> Result<&QueueSpec, AmqpError> {
        self.queues
            .as_ref()
            .and_then(|queues| queues.get(queue_name))
            .ok_or_else(|| {
                AmqpError::ConfigurationError(format!(
                    "No configuration for queue <{queue_name}>"
                ))
            })
    }

    /// Looks up the specification of the given exchange.
    pub fn exchange_spec(&self, exchange_name: &str) -> Result<&ExchangeSpec, AmqpError> {
        self.exchanges
            .as_ref()
            .and_then(|exchanges| exchanges.get(exchange_name))
            .ok_or_else(|| {
                AmqpError::ConfigurationError(format!(
                    "No configuration for exchange <{exchange_name}>"
                ))
            })
    }

    /// Resolves the exchange owning the given queue.
    pub fn exchange_for_queue(&self, queue_name: &str) -> Result<&str, AmqpError> {
        let spec = self.queue_spec(queue_name)?;

        if spec.exchange.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "No mapped exchange to queue <{queue_name}>"
            )));
        }

        Ok(&spec.exchange)
    }

    /// Name of the shared retry exchange, required for retriable queues.
    pub fn retry_exchange_name(&self) -> Result<&str, AmqpError> {
        self.retry_exchange_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AmqpError::ConfigurationError(
                    "Please specify the retry_exchange_name property when configuring retriable queues".to_owned(),
                )
            })
    }

    /// Name of the shared dead exchange, required for retriable queues.
    pub fn dead_exchange_name(&self) -> Result<&str, AmqpError> {
        self.dead_exchange_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AmqpError::ConfigurationError(
                    "Please specify the dead_exchange_name property when configuring retriable queues".to_owned(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_has_no_topology() {
        let config = Configuration::default();

        assert!(config.broker_url.is_none());
        assert!(config.exchanges.is_none());
        assert!(config.queues.is_none());
        assert!(!config.publisher_confirms);
        assert_eq!(config.consumer_prefetch_count, 0);
        assert_eq!(config.confirm_timeout_ms, DEFAULT_CONFIRM_TIMEOUT_MS);
        assert_eq!(config.broker_url(), DEFAULT_BROKER_URL);
    }

    #[test]
    fn validate_reports_exchanges_before_queues() {
        let config = Configuration::default();

        assert_eq!(
            config.validate(),
            Err(AmqpError::ConfigurationError(
                "Missing required option: exchanges".to_owned()
            ))
        );
    }

    #[test]
    fn validate_reports_missing_queues() {
        let config = Configuration {
            exchanges: Some(HashMap::new()),
            ..Configuration::default()
        };

        assert_eq!(
            config.validate(),
            Err(AmqpError::ConfigurationError(
                "Missing required option: queues".to_owned()
            ))
        );
    }

    #[test]
    fn validate_accepts_empty_maps() {
        let config = Configuration {
            exchanges: Some(HashMap::new()),
            queues: Some(HashMap::new()),
            ..Configuration::default()
        };

        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn queue_without_exchange_mapping_is_a_configuration_error() {
        let mut queues = HashMap::new();
        queues.insert("orders".to_owned(), QueueSpec::default());

        let config = Configuration {
            exchanges: Some(HashMap::new()),
            queues: Some(queues),
            ..Configuration::default()
        };

        assert_eq!(
            config.exchange_for_queue("orders"),
            Err(AmqpError::ConfigurationError(
                "No mapped exchange to queue <orders>".to_owned()
            ))
        );
    }

    #[test]
    fn unknown_queue_is_a_configuration_error() {
        let config = Configuration {
            exchanges: Some(HashMap::new()),
            queues: Some(HashMap::new()),
            ..Configuration::default()
        };

        assert_eq!(
            config.queue_spec("missing"),
            Err(AmqpError::ConfigurationError(
                "No configuration for queue <missing>".to_owned()
            ))
        );
    }

    #[test]
    fn retry_exchange_name_is_required_when_consulted() {
        let config = Configuration::default();

        assert!(matches!(
            config.retry_exchange_name(),
            Err(AmqpError::ConfigurationError(_))
        ));

        let config = Configuration {
            retry_exchange_name: Some("retry_exchange".to_owned()),
            ..Configuration::default()
        };

        assert_eq!(config.retry_exchange_name(), Ok("retry_exchange"));
    }
}
