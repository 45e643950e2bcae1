// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module implements the publishing side of the overlay. A publisher is
//! bound to one provisioned exchange/queue pair and sends batches of opaque
//! payloads through it, with per-message parameter merging (call defaults,
//! then caller overrides, then message-specific overrides) and, when confirm
//! mode is on, a single confirm wait gating the whole batch.
//!
//! Messages are either a bare payload or a structured payload carrying its
//! own publishing parameters; a structured message without a payload is a
//! caller defect and fails before anything is sent.

use crate::{
    config::Configuration, connection::RoleChannel, errors::AmqpError, otel,
    registry::QueueBinding,
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{error, warn};
use uuid::Uuid;

/// Default content type of published messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Parameters of a publish operation.
///
/// Unset fields fall back to the next layer: message params over call
/// params over the bound defaults. Merging never mutates the caller's
/// values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishParams {
    pub routing_key: Option<String>,
    pub content_type: Option<String>,
    pub persistent: Option<bool>,
    pub expiration_ms: Option<u64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Option<BTreeMap<ShortString, AMQPValue>>,
}

impl PublishParams {
    pub fn new() -> PublishParams {
        PublishParams::default()
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn header(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.headers.get_or_insert_with(BTreeMap::new).insert(key, value);
        self
    }

    /// These params with every unset field filled from `base`.
    pub(crate) fn merged_over(&self, base: &PublishParams) -> PublishParams {
        PublishParams {
            routing_key: self.routing_key.clone().or_else(|| base.routing_key.clone()),
            content_type: self
                .content_type
                .clone()
                .or_else(|| base.content_type.clone()),
            persistent: self.persistent.or(base.persistent),
            expiration_ms: self.expiration_ms.or(base.expiration_ms),
            correlation_id: self
                .correlation_id
                .clone()
                .or_else(|| base.correlation_id.clone()),
            reply_to: self.reply_to.clone().or_else(|| base.reply_to.clone()),
            headers: self.headers.clone().or_else(|| base.headers.clone()),
        }
    }
}

/// One message to publish.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    /// The value is the payload.
    Bare(Vec<u8>),
    /// A payload carrying its own publishing parameter overrides. A `None`
    /// payload is a caller defect.
    Structured {
        payload: Option<Vec<u8>>,
        publishing_params: PublishParams,
    },
}

impl OutgoingMessage {
    pub fn bare(payload: impl Into<Vec<u8>>) -> OutgoingMessage {
        OutgoingMessage::Bare(payload.into())
    }

    pub fn structured(
        payload: impl Into<Vec<u8>>,
        publishing_params: PublishParams,
    ) -> OutgoingMessage {
        OutgoingMessage::Structured {
            payload: Some(payload.into()),
            publishing_params,
        }
    }

    fn publishing_params(&self) -> Option<&PublishParams> {
        match self {
            OutgoingMessage::Bare(_) => None,
            OutgoingMessage::Structured {
                publishing_params, ..
            } => Some(publishing_params),
        }
    }

    fn payload(&self, position: usize) -> Result<&[u8], AmqpError> {
        match self {
            OutgoingMessage::Bare(payload) => Ok(payload),
            OutgoingMessage::Structured {
                payload: Some(payload),
                ..
            } => Ok(payload),
            OutgoingMessage::Structured { payload: None, .. } => {
                Err(AmqpError::PayloadMissingError(format!(
                    "the message at position {position} must define a payload"
                )))
            }
        }
    }
}

impl From<Vec<u8>> for OutgoingMessage {
    fn from(payload: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage::Bare(payload)
    }
}

impl From<&[u8]> for OutgoingMessage {
    fn from(payload: &[u8]) -> OutgoingMessage {
        OutgoingMessage::Bare(payload.to_vec())
    }
}

impl From<String> for OutgoingMessage {
    fn from(payload: String) -> OutgoingMessage {
        OutgoingMessage::Bare(payload.into_bytes())
    }
}

impl From<&str> for OutgoingMessage {
    fn from(payload: &str) -> OutgoingMessage {
        OutgoingMessage::Bare(payload.as_bytes().to_vec())
    }
}

/// A message resolved against its effective parameters, ready to send.
#[derive(Debug, PartialEq)]
pub(crate) struct Publication {
    pub(crate) routing_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) params: PublishParams,
}

impl Publication {
    fn properties(&self) -> BasicProperties {
        let mut headers = self.params.headers.clone().unwrap_or_default();
        otel::inject_current_context(&mut headers);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(
                self.params
                    .content_type
                    .clone()
                    .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            ))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if self.params.persistent.unwrap_or(true) {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(expiration_ms) = self.params.expiration_ms {
            properties = properties.with_expiration(ShortString::from(expiration_ms.to_string()));
        }
        if let Some(correlation_id) = &self.params.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &self.params.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
        }

        properties
    }
}

/// Resolves each message of a batch against its effective parameters.
///
/// Fails on the first message without a payload; nothing of a failed batch
/// is published.
pub(crate) fn build_publications(
    messages: &[OutgoingMessage],
    publish_params: &PublishParams,
    bound_routing_key: &str,
) -> Result<Vec<Publication>, AmqpError> {
    let defaults = PublishParams {
        routing_key: Some(bound_routing_key.to_owned()),
        content_type: Some(JSON_CONTENT_TYPE.to_owned()),
        persistent: Some(true),
        ..PublishParams::default()
    };
    let call_params = publish_params.merged_over(&defaults);

    messages
        .iter()
        .enumerate()
        .map(|(position, message)| {
            let params = match message.publishing_params() {
                Some(message_params) => message_params.merged_over(&call_params),
                None => call_params.clone(),
            };
            let payload = message.payload(position)?.to_vec();
            let routing_key = params.routing_key.clone().unwrap_or_default();

            Ok(Publication {
                routing_key,
                payload,
                params,
            })
        })
        .collect()
}

/// A publisher bound to one provisioned exchange/queue pair.
pub struct Publisher {
    config: Arc<Configuration>,
    bundle: Arc<RoleChannel>,
    binding: QueueBinding,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("binding", &self.binding)
            .finish()
    }
}

impl Publisher {
    pub(crate) fn new(
        config: Arc<Configuration>,
        bundle: Arc<RoleChannel>,
        binding: QueueBinding,
    ) -> Publisher {
        Publisher {
            config,
            bundle,
            binding,
        }
    }

    /// The exchange/queue pair this publisher was resolved against.
    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Publishes a single message.
    pub async fn publish_one(
        &self,
        message: impl Into<OutgoingMessage>,
        publish_params: PublishParams,
    ) -> Result<bool, AmqpError> {
        self.publish(vec![message.into()], publish_params).await
    }

    /// Publishes a batch of messages, returning the aggregate outcome.
    ///
    /// With confirm mode on, the batch is all-or-nothing: one confirm wait
    /// covers every message, bounded by the configured timeout (expiry
    /// counts as failure). With confirm mode off the outcome is
    /// unconditionally `true`.
    pub async fn publish(
        &self,
        messages: Vec<OutgoingMessage>,
        publish_params: PublishParams,
    ) -> Result<bool, AmqpError> {
        self.publish_then(messages, publish_params, || {}).await
    }

    /// Like [`publish`](Publisher::publish), invoking `on_success` once if
    /// the batch outcome is success.
    pub async fn publish_then<F>(
        &self,
        messages: Vec<OutgoingMessage>,
        publish_params: PublishParams,
        on_success: F,
    ) -> Result<bool, AmqpError>
    where
        F: FnOnce(),
    {
        let publications =
            build_publications(&messages, &publish_params, &self.binding.routing_key)?;

        let success = if self.config.publisher_confirms {
            // Confirms on a shared channel cannot be attributed across
            // interleaved batches; the gate serializes send-then-wait.
            let _gate = self.bundle.publish_gate.lock().await;
            self.send_all(&publications).await?;
            self.wait_for_confirms().await?
        } else {
            self.send_all(&publications).await?;
            true
        };

        if success {
            on_success();
        }

        Ok(success)
    }

    async fn send_all(&self, publications: &[Publication]) -> Result<(), AmqpError> {
        for publication in publications {
            if let Err(err) = self
                .bundle
                .channel
                .basic_publish(
                    &self.binding.exchange,
                    &publication.routing_key,
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    &publication.payload,
                    publication.properties(),
                )
                .await
            {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        }

        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<bool, AmqpError> {
        let limit = Duration::from_millis(self.config.confirm_timeout_ms);

        match tokio::time::timeout(limit, self.bundle.channel.wait_for_confirms()).await {
            Err(_) => {
                warn!(
                    "confirm wait exceeded {}ms, treating the batch as failed",
                    self.config.confirm_timeout_ms
                );
                Ok(false)
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    "error waiting for publisher confirms"
                );
                Err(AmqpError::PublishingError)
            }
            Ok(Ok(returned)) => Ok(returned.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_resolves_every_message_with_the_bound_defaults() {
        let messages = vec![
            OutgoingMessage::bare(serde_json::json!({"id": 1}).to_string()),
            OutgoingMessage::bare(serde_json::json!({"id": 2}).to_string()),
            OutgoingMessage::bare(serde_json::json!({"id": 3}).to_string()),
        ];

        let publications =
            build_publications(&messages, &PublishParams::new(), "orders").unwrap();

        assert_eq!(publications.len(), 3);
        for publication in &publications {
            assert_eq!(publication.routing_key, "orders");
            assert_eq!(
                publication.params.content_type.as_deref(),
                Some(JSON_CONTENT_TYPE)
            );
            assert_eq!(publication.params.persistent, Some(true));
        }
    }

    #[test]
    fn call_params_override_the_bound_defaults() {
        let messages = vec![OutgoingMessage::bare("payload")];
        let params = PublishParams::new().routing_key("priority").persistent(false);

        let publications = build_publications(&messages, &params, "orders").unwrap();

        assert_eq!(publications[0].routing_key, "priority");
        assert_eq!(publications[0].params.persistent, Some(false));
    }

    #[test]
    fn message_params_override_the_call_params() {
        let messages = vec![
            OutgoingMessage::structured(
                "special",
                PublishParams::new().expiration_ms(5_000).routing_key("audit"),
            ),
            OutgoingMessage::bare("ordinary"),
        ];
        let params = PublishParams::new().expiration_ms(60_000);

        let publications = build_publications(&messages, &params, "orders").unwrap();

        assert_eq!(publications[0].params.expiration_ms, Some(5_000));
        assert_eq!(publications[0].routing_key, "audit");
        assert_eq!(publications[1].params.expiration_ms, Some(60_000));
        assert_eq!(publications[1].routing_key, "orders");
    }

    #[test]
    fn structured_message_without_payload_fails_the_batch() {
        let messages = vec![
            OutgoingMessage::bare("fine"),
            OutgoingMessage::Structured {
                payload: None,
                publishing_params: PublishParams::new(),
            },
        ];

        let err = build_publications(&messages, &PublishParams::new(), "orders").unwrap_err();

        assert_eq!(
            err,
            AmqpError::PayloadMissingError(
                "the message at position 1 must define a payload".to_owned()
            )
        );
    }

    #[test]
    fn merge_keeps_the_more_specific_value() {
        let base = PublishParams::new()
            .routing_key("orders")
            .content_type(JSON_CONTENT_TYPE)
            .correlation_id("base");
        let over = PublishParams::new().correlation_id("specific");

        let merged = over.merged_over(&base);

        assert_eq!(merged.correlation_id.as_deref(), Some("specific"));
        assert_eq!(merged.routing_key.as_deref(), Some("orders"));
        assert_eq!(merged.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
    }
}
