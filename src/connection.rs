// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! This module owns the broker connections. Each logical role (publisher,
//! consumer) shares one lazily-created connection and channel; the manager
//! guards initialization behind a mutex so concurrent first access cannot
//! race two connections into existence. `close` tears the connection down
//! together with its topology cache, and the next access re-initializes
//! everything from the configuration.

use crate::{config::Configuration, errors::AmqpError, topology::RuntimeTopology};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Logical role a connection serves.
///
/// All publishers share the publisher-role channel and all consumers the
/// consumer-role channel; the two never share a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Consumer,
}

impl Role {
    fn connection_name(&self) -> &'static str {
        match self {
            Role::Publisher => "amqp-resilience-publisher",
            Role::Consumer => "amqp-resilience-consumer",
        }
    }
}

/// The shared per-role bundle: connection, channel, and the caches scoped to
/// their lifetime.
pub struct RoleChannel {
    connection: Connection,
    pub(crate) channel: Arc<Channel>,
    /// Per-connection topology cache; holding this lock serializes
    /// first-time declarations on the connection.
    pub(crate) topology: Mutex<RuntimeTopology>,
    /// Serializes send-batch-then-wait-for-confirms on the shared channel.
    pub(crate) publish_gate: Mutex<()>,
}

impl RoleChannel {
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }
}

/// Lazy, mutex-guarded owner of one role's connection.
pub struct ConnectionManager {
    role: Role,
    config: Arc<Configuration>,
    slot: Mutex<Option<Arc<RoleChannel>>>,
}

impl ConnectionManager {
    pub fn new(role: Role, config: Arc<Configuration>) -> ConnectionManager {
        ConnectionManager {
            role,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Returns the live bundle for this role, connecting if absent or closed.
    pub async fn instance(&self) -> Result<Arc<RoleChannel>, AmqpError> {
        let mut slot = self.slot.lock().await;

        if let Some(bundle) = slot.as_ref() {
            return Ok(bundle.clone());
        }

        let bundle = Arc::new(self.open().await?);
        *slot = Some(bundle.clone());

        Ok(bundle)
    }

    /// Whether the role currently holds an open connection.
    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Closes the connection and drops the bundle with its caches.
    ///
    /// The next `instance` call re-initializes from the configuration.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut slot = self.slot.lock().await;

        let Some(bundle) = slot.take() else {
            return Ok(());
        };

        match bundle.connection.close(200, "client shutdown").await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::CloseConnectionError)
            }
        }
    }

    async fn open(&self) -> Result<RoleChannel, AmqpError> {
        debug!("creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.role.connection_name()));

        let connection = match Connection::connect(self.config.broker_url(), options).await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        match self.role {
            Role::Consumer => {
                if let Err(err) = channel
                    .basic_qos(
                        self.config.consumer_prefetch_count,
                        BasicQosOptions::default(),
                    )
                    .await
                {
                    error!(error = err.to_string(), "error to configure the prefetch");
                    return Err(AmqpError::QoSDeclarationError(err.to_string()));
                }
            }
            Role::Publisher => {
                if self.config.publisher_confirms {
                    if let Err(err) = channel
                        .confirm_select(ConfirmSelectOptions::default())
                        .await
                    {
                        error!(error = err.to_string(), "error to enter confirm mode");
                        return Err(AmqpError::ChannelError);
                    }
                }
            }
        }
        debug!("channel created");

        Ok(RoleChannel {
            connection,
            channel: Arc::new(channel),
            topology: Mutex::new(RuntimeTopology::default()),
            publish_gate: Mutex::new(()),
        })
    }
}
