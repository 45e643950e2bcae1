// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Provisioning
//!
//! This module declares exchanges, queues and bindings on a connection,
//! including the per-queue retry and dead companions. Every operation is
//! idempotent through the `RuntimeTopology` cache: a name already present in
//! the cache is never redeclared, so resolving the same queue twice touches
//! the broker exactly once per connection. The cache lives and dies with the
//! connection.
//!
//! A retry queue dead-letters back to the *owning* exchange with the queue
//! name as routing key, so a delayed message re-enters its normal queue once
//! its TTL expires. The queue-level TTL declared here is a placeholder; the
//! per-message `expiration` set when republishing takes precedence.

use crate::{
    config::Configuration,
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::{dead_queue_name, retry_queue_name, QueueSpec},
};
use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, Queue,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, error};

/// Queue argument naming the exchange expired/rejected messages re-route to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for the queue-level message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument for the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Placeholder TTL of retry queues, in milliseconds. Overridden per message
/// by the `expiration` computed from the backoff factor.
pub const DEFAULT_RETRY_TTL_MS: i32 = 30_000;

/// Per-connection record of what has already been declared.
///
/// The cache *is* the idempotence mechanism: entries are inserted after a
/// successful declare and never removed except by dropping the whole cache
/// when the connection closes.
#[derive(Default)]
pub struct RuntimeTopology {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
}

impl RuntimeTopology {
    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    fn mark_exchange(&mut self, name: &str) {
        self.exchanges.insert(name.to_owned());
    }

    fn mark_queue(&mut self, name: &str, queue: Queue) {
        self.queues.insert(name.to_owned(), queue);
    }
}

/// Declares topology on a channel, consulting and feeding the cache.
///
/// Constructed with the cache lock held, so concurrent first-time
/// declarations of the same name are serialized per connection.
pub struct TopologyProvisioner<'tp> {
    channel: &'tp Channel,
    cache: &'tp mut RuntimeTopology,
    config: &'tp Configuration,
}

impl<'tp> TopologyProvisioner<'tp> {
    pub fn new(
        channel: &'tp Channel,
        cache: &'tp mut RuntimeTopology,
        config: &'tp Configuration,
    ) -> TopologyProvisioner<'tp> {
        TopologyProvisioner {
            channel,
            cache,
            config,
        }
    }

    /// Declares the exchange unless this connection already did.
    pub async fn ensure_exchange(
        &mut self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), AmqpError> {
        if self.cache.has_exchange(name) {
            return Ok(());
        }

        debug!("creating exchange: {}", name);

        match self
            .channel
            .exchange_declare(
                name,
                spec.kind.clone().into(),
                spec.declare_options(),
                FieldTable::from(spec.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                self.cache.mark_exchange(name);
                debug!("exchange: {} was created", name);
                Ok(())
            }
        }
    }

    /// Declares the queue and binds it to its exchange, unless cached.
    pub async fn ensure_queue(
        &mut self,
        name: &str,
        spec: &QueueSpec,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        if self.cache.has_queue(name) {
            return Ok(());
        }

        debug!("creating queue: {}", name);

        let queue = self
            .declare_queue(name, spec.declare_options(), working_queue_arguments(spec))
            .await?;

        self.bind_queue(name, exchange, routing_key).await?;
        self.cache.mark_queue(name, queue);

        debug!("queue: {} was created", name);

        Ok(())
    }

    /// Ensures the shared retry exchange and the queue's retry companion.
    ///
    /// The retry queue holds a failed delivery for its per-message TTL, then
    /// dead-letters it back into the owning exchange under the queue name.
    pub async fn ensure_retry_topology(
        &mut self,
        queue_name: &str,
        owning_exchange: &str,
    ) -> Result<(), AmqpError> {
        let config = self.config;
        let retry_exchange = config.retry_exchange_name()?;

        self.ensure_exchange(retry_exchange, &ExchangeSpec::direct().durable())
            .await?;

        let retry_queue = retry_queue_name(queue_name);
        if self.cache.has_queue(&retry_queue) {
            return Ok(());
        }

        let queue = self
            .declare_queue(
                &retry_queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                retry_queue_arguments(owning_exchange, queue_name),
            )
            .await?;

        self.bind_queue(&retry_queue, retry_exchange, &retry_queue)
            .await?;
        self.cache.mark_queue(&retry_queue, queue);

        Ok(())
    }

    /// Ensures the shared dead exchange and the queue's quarantine companion.
    pub async fn ensure_dead_topology(&mut self, queue_name: &str) -> Result<(), AmqpError> {
        let config = self.config;
        let dead_exchange = config.dead_exchange_name()?;

        self.ensure_exchange(dead_exchange, &ExchangeSpec::direct().durable())
            .await?;

        let dead_queue = dead_queue_name(queue_name);
        if self.cache.has_queue(&dead_queue) {
            return Ok(());
        }

        let queue = self
            .declare_queue(
                &dead_queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                BTreeMap::new(),
            )
            .await?;

        self.bind_queue(&dead_queue, dead_exchange, &dead_queue)
            .await?;
        self.cache.mark_queue(&dead_queue, queue);

        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<Queue, AmqpError> {
        match self
            .channel
            .queue_declare(name, options, FieldTable::from(arguments))
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "failure to declare queue"
                );
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(queue),
        }
    }

    async fn bind_queue(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue_name, exchange_name, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue_name,
                exchange_name,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange_name.to_owned(),
                    queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Declare arguments of a working queue, from its optional limits.
pub(crate) fn working_queue_arguments(spec: &QueueSpec) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(ttl) = spec.message_ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl as i32)),
        );
    }

    if let Some(max) = spec.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max as i32)),
        );
    }

    if let Some(max_bytes) = spec.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes as i32)),
        );
    }

    args
}

/// Declare arguments of a retry queue: dead-letter back to the owning
/// exchange under the queue name, with the placeholder TTL.
pub(crate) fn retry_queue_arguments(
    owning_exchange: &str,
    queue_name: &str,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(owning_exchange)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue_name)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongInt(LongInt::from(DEFAULT_RETRY_TTL_MS)),
    );

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_queue_dead_letters_to_the_owning_exchange() {
        let args = retry_queue_arguments("orders_exchange", "orders");

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("orders_exchange")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(LongInt::from(DEFAULT_RETRY_TTL_MS)))
        );
    }

    #[test]
    fn working_queue_arguments_only_carry_configured_limits() {
        let spec = QueueSpec::new("orders_exchange");
        assert!(working_queue_arguments(&spec).is_empty());

        let spec = QueueSpec::new("orders_exchange")
            .ttl(60_000)
            .max_length(1_000);
        let args = working_queue_arguments(&spec);

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(LongInt::from(60_000)))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(LongInt::from(1_000)))
        );
        assert!(args
            .get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES))
            .is_none());
    }

    #[test]
    fn cache_reports_declared_names() {
        let mut cache = RuntimeTopology::default();

        assert!(!cache.has_exchange("orders_exchange"));
        cache.mark_exchange("orders_exchange");
        assert!(cache.has_exchange("orders_exchange"));
        assert!(!cache.has_queue("orders"));
    }
}
