// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Registry
//!
//! The registry is the single entry point of the overlay: constructed once
//! at process start from a validated configuration and passed by reference
//! to whoever needs a publisher or a consumer. It keeps the two logical
//! roles apart, so every publisher shares the publisher-role connection and
//! every consumer the consumer-role connection.
//!
//! Resolving a queue walks the configuration (queue spec, owning exchange,
//! exchange spec), re-opens the role connection when it was closed, ensures
//! the working exchange/queue/binding exist (plus the retry and dead
//! companions for retriable queues) and hands back an instance bound to
//! the resolved pair.

use crate::{
    config::Configuration,
    connection::{ConnectionManager, Role, RoleChannel},
    consumer::Consumer,
    errors::AmqpError,
    publisher::Publisher,
    queue::QueueSpec,
    topology::TopologyProvisioner,
};
use std::sync::Arc;
use tracing::debug;

/// The exchange/queue pair an instance was resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Owner of the per-role connections and the resolution logic.
pub struct AmqpRegistry {
    config: Arc<Configuration>,
    publishers: Arc<ConnectionManager>,
    consumers: Arc<ConnectionManager>,
}

impl AmqpRegistry {
    /// Builds a registry from a configuration, validating it once.
    pub fn new(config: Configuration) -> Result<AmqpRegistry, AmqpError> {
        config.validate()?;

        let config = Arc::new(config);

        Ok(AmqpRegistry {
            publishers: Arc::new(ConnectionManager::new(Role::Publisher, config.clone())),
            consumers: Arc::new(ConnectionManager::new(Role::Consumer, config.clone())),
            config,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Resolves a publisher bound to the given queue's exchange.
    pub async fn publisher_for_queue(&self, queue_name: &str) -> Result<Publisher, AmqpError> {
        let (bundle, binding, _spec) = self.resolve(&self.publishers, queue_name).await?;

        Ok(Publisher::new(self.config.clone(), bundle, binding))
    }

    /// Resolves a consumer bound to the given queue.
    pub async fn consumer_for_queue(&self, queue_name: &str) -> Result<Consumer, AmqpError> {
        let (bundle, binding, spec) = self.resolve(&self.consumers, queue_name).await?;

        Ok(Consumer::new(
            self.consumers.clone(),
            bundle.channel(),
            binding,
            spec,
        ))
    }

    /// Closes both role connections; the next resolution reconnects.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.publishers.close().await?;
        self.consumers.close().await
    }

    async fn resolve(
        &self,
        manager: &Arc<ConnectionManager>,
        queue_name: &str,
    ) -> Result<(Arc<RoleChannel>, QueueBinding, QueueSpec), AmqpError> {
        let queue_spec = self.config.queue_spec(queue_name)?.clone();
        let exchange_name = self.config.exchange_for_queue(queue_name)?.to_owned();
        let exchange_spec = self.config.exchange_spec(&exchange_name)?.clone();

        let routing_key = queue_spec
            .routing_key
            .clone()
            .unwrap_or_else(|| queue_name.to_owned());

        let bundle = manager.instance().await?;

        debug!(
            "resolving queue: {} on exchange: {}",
            queue_name, exchange_name
        );

        {
            let mut cache = bundle.topology.lock().await;
            let channel = bundle.channel();
            let mut provisioner = TopologyProvisioner::new(&channel, &mut cache, &self.config);

            provisioner
                .ensure_exchange(&exchange_name, &exchange_spec)
                .await?;
            provisioner
                .ensure_queue(queue_name, &queue_spec, &exchange_name, &routing_key)
                .await?;

            if queue_spec.retriable {
                provisioner
                    .ensure_retry_topology(queue_name, &exchange_name)
                    .await?;
                provisioner.ensure_dead_topology(queue_name).await?;
            }
        }

        let binding = QueueBinding {
            exchange: exchange_name,
            queue: queue_name.to_owned(),
            routing_key,
        };

        Ok((bundle, binding, queue_spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured() -> Configuration {
        Configuration {
            exchanges: Some(HashMap::new()),
            queues: Some(HashMap::new()),
            ..Configuration::default()
        }
    }

    #[test]
    fn construction_requires_a_valid_configuration() {
        assert!(AmqpRegistry::new(Configuration::default()).is_err());
        assert!(AmqpRegistry::new(configured()).is_ok());
    }

    #[tokio::test]
    async fn resolution_fails_fast_for_an_unknown_queue() {
        let registry = AmqpRegistry::new(configured()).unwrap();

        let err = registry.consumer_for_queue("missing").await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConfigurationError("No configuration for queue <missing>".to_owned())
        );
    }

    #[tokio::test]
    async fn resolution_fails_fast_for_an_unmapped_exchange() {
        let mut queues = HashMap::new();
        queues.insert("orders".to_owned(), QueueSpec::default());

        let config = Configuration {
            queues: Some(queues),
            ..configured()
        };
        let registry = AmqpRegistry::new(config).unwrap();

        let err = registry.publisher_for_queue("orders").await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConfigurationError("No mapped exchange to queue <orders>".to_owned())
        );
    }
}
