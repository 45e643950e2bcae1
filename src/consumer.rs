// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module implements the consumption side of the overlay: a blocking
//! subscribe loop around a user-supplied handler, with retry and dead-letter
//! orchestration per delivery.
//!
//! The handler reports success with a boolean. On failure the engine either
//! republishes the payload to the queue's retry companion with an
//! exponentially grown per-message expiration, or quarantines it into the
//! dead companion once the retry budget is spent. The original delivery is
//! acknowledged in every case; broker-level nack/requeue is never used, so
//! retry delay stays decoupled from broker redelivery timing.
//!
//! Retried messages carry `correlation_id` and `reply_to` as plain headers:
//! dead-letter redelivery preserves headers but not AMQP properties.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    queue::{dead_queue_name, retry_queue_name, QueueSpec},
    registry::QueueBinding,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header counting how often a delivery has been retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header appended by the broker on dead-letter routes
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Field of the last x-death entry carrying the expiration the message was
/// originally published with
pub const AMQP_HEADERS_ORIGINAL_EXPIRATION: &str = "original-expiration";
/// Header fallback for the correlation id of a retried delivery
pub const AMQP_HEADERS_CORRELATION_ID: &str = "correlation_id";
/// Header fallback for the reply-to of a retried delivery
pub const AMQP_HEADERS_REPLY_TO: &str = "reply_to";

/// Backoff baseline applied to deliveries that never cycled yet, in
/// milliseconds.
pub const DEFAULT_ORIGINAL_EXPIRATION_MS: u64 = 10_000;

/// Per-delivery context handed to the handler next to the raw payload and
/// properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// How often this delivery was already retried.
    pub retry_count: u32,
    /// True exactly when the retry budget is spent, independent of the
    /// handler outcome.
    pub is_last_attempt: bool,
}

/// Processes one delivery, reporting success with the returned boolean.
///
/// Returning `false` triggers the retry/dead-letter decision; panics
/// propagate uncaught, supervision is the caller's responsibility.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &[u8],
        properties: &AMQPProperties,
        ctx: &DeliveryContext,
    ) -> bool;
}

/// Terminal routing decision for one delivery. The original delivery is
/// acknowledged whichever variant is reached.
#[derive(Debug, PartialEq)]
pub(crate) enum Verdict {
    Complete,
    Retry {
        expiration_ms: u64,
        headers: BTreeMap<ShortString, AMQPValue>,
    },
    Dead {
        headers: BTreeMap<ShortString, AMQPValue>,
    },
}

/// A consumer bound to one provisioned queue.
pub struct Consumer {
    manager: Arc<ConnectionManager>,
    channel: Arc<Channel>,
    binding: QueueBinding,
    spec: QueueSpec,
    retry_queue: String,
    dead_queue: String,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("binding", &self.binding)
            .field("spec", &self.spec)
            .field("retry_queue", &self.retry_queue)
            .field("dead_queue", &self.dead_queue)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        channel: Arc<Channel>,
        binding: QueueBinding,
        spec: QueueSpec,
    ) -> Consumer {
        let retry_queue = retry_queue_name(&binding.queue);
        let dead_queue = dead_queue_name(&binding.queue);

        Consumer {
            manager,
            channel,
            binding,
            spec,
            retry_queue,
            dead_queue,
        }
    }

    /// The exchange/queue pair this consumer was resolved against.
    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Consumes the bound queue until cancelled.
    ///
    /// This call occupies its execution context for the lifetime of the
    /// subscription. When `shutdown` fires, the role connection is closed
    /// and the loop ends; a delivery mid-processing at that point may be
    /// redelivered later (at-least-once).
    pub async fn consume(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        let consumer_tag = format!("{}-{}", self.binding.queue, Uuid::new_v4());

        let mut deliveries = match self
            .channel
            .basic_consume(
                &self.binding.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerCreationError(self.binding.queue.clone()))
            }
            Ok(consumer) => Ok(consumer),
        }?;

        let tracer = global::tracer("amqp consumer");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("cancellation received, closing the consumer connection");
                    self.manager.close().await?;
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.process(handler.as_ref(), &tracer, &delivery).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                    None => return Ok(()),
                }
            }
        }
    }

    async fn process(
        &self,
        handler: &dyn ConsumerHandler,
        tracer: &BoxedTracer,
        delivery: &Delivery,
    ) -> Result<(), AmqpError> {
        let mut span = otel::consumer_span(&delivery.properties, tracer, &self.binding.queue);

        debug!(
            "received delivery - queue: {} - exchange: {}",
            self.binding.queue,
            delivery.exchange.to_string(),
        );

        let verdict = evaluate(handler, &delivery.data, &delivery.properties, &self.spec).await;

        match &verdict {
            Verdict::Complete => span.set_status(Status::Ok),
            Verdict::Retry { .. } => span.set_status(Status::Error {
                description: Cow::from("handler failed, delivery scheduled for retry"),
            }),
            Verdict::Dead { .. } => span.set_status(Status::Error {
                description: Cow::from("handler failed, delivery dead-lettered"),
            }),
        }

        let result = self.apply(delivery, verdict).await;
        if let Err(err) = &result {
            span.record_error(err);
        }

        result
    }

    async fn apply(&self, delivery: &Delivery, verdict: Verdict) -> Result<(), AmqpError> {
        match verdict {
            Verdict::Complete => {
                debug!("message successfully processed");
            }
            Verdict::Retry {
                expiration_ms,
                headers,
            } => {
                warn!(
                    "error whiling handling msg, requeuing with expiration of {}ms",
                    expiration_ms
                );

                let properties = BasicProperties::default()
                    .with_expiration(ShortString::from(expiration_ms.to_string()))
                    .with_headers(FieldTable::from(headers));

                if let Err(err) = self
                    .channel
                    .basic_publish(
                        "",
                        &self.retry_queue,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        properties,
                    )
                    .await
                {
                    error!(error = err.to_string(), "error whiling sending to retry queue");
                    return Err(AmqpError::PublishingToRetryError);
                }
            }
            Verdict::Dead { headers } => {
                error!("too many attempts, sending to dead queue");

                let properties = BasicProperties::default().with_headers(FieldTable::from(headers));

                if let Err(err) = self
                    .channel
                    .basic_publish(
                        "",
                        &self.dead_queue,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        properties,
                    )
                    .await
                {
                    error!(error = err.to_string(), "error whiling sending to dead queue");
                    return Err(AmqpError::PublishingToDeadError);
                }
            }
        }

        match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Runs the handler for one delivery and decides what happens to it.
pub(crate) async fn evaluate(
    handler: &dyn ConsumerHandler,
    payload: &[u8],
    properties: &AMQPProperties,
    spec: &QueueSpec,
) -> Verdict {
    let headers = header_table(properties);
    let ctx = delivery_context(properties, spec);

    let succeeded = handler.handle(payload, properties, &ctx).await;

    decide(spec, succeeded, &ctx, original_expiration(&headers))
}

/// The retry/dead-letter decision, pure in the delivery state and the
/// queue's retry policy.
pub(crate) fn decide(
    spec: &QueueSpec,
    succeeded: bool,
    ctx: &DeliveryContext,
    original_expiration_ms: u64,
) -> Verdict {
    if succeeded {
        return Verdict::Complete;
    }

    if spec.retriable && ctx.retry_count < spec.max_retry_count {
        let expiration_ms =
            (original_expiration_ms as f64 * spec.exponential_backoff_factor).floor() as u64;

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(LongInt::from((ctx.retry_count + 1) as i32)),
        );
        if let Some(correlation_id) = &ctx.correlation_id {
            headers.insert(
                ShortString::from(AMQP_HEADERS_CORRELATION_ID),
                AMQPValue::LongString(LongString::from(correlation_id.as_str())),
            );
        }
        if let Some(reply_to) = &ctx.reply_to {
            headers.insert(
                ShortString::from(AMQP_HEADERS_REPLY_TO),
                AMQPValue::LongString(LongString::from(reply_to.as_str())),
            );
        }

        return Verdict::Retry {
            expiration_ms,
            headers,
        };
    }

    let mut headers = BTreeMap::new();
    if let Some(correlation_id) = &ctx.correlation_id {
        headers.insert(
            ShortString::from(AMQP_HEADERS_CORRELATION_ID),
            AMQPValue::LongString(LongString::from(correlation_id.as_str())),
        );
    }

    Verdict::Dead { headers }
}

/// Builds the handler-facing context from one delivery's properties.
pub(crate) fn delivery_context(properties: &AMQPProperties, spec: &QueueSpec) -> DeliveryContext {
    let headers = header_table(properties);
    let count = retry_count(&headers);

    DeliveryContext {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| string_header(&headers, AMQP_HEADERS_CORRELATION_ID)),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| string_header(&headers, AMQP_HEADERS_REPLY_TO)),
        retry_count: count,
        is_last_attempt: count == spec.max_retry_count,
    }
}

fn header_table(properties: &AMQPProperties) -> FieldTable {
    match properties.headers() {
        Some(headers) => headers.to_owned(),
        None => FieldTable::default(),
    }
}

/// How often this delivery was already retried, from the x-retry-count
/// header.
pub(crate) fn retry_count(headers: &FieldTable) -> u32 {
    headers
        .inner()
        .get(AMQP_HEADERS_RETRY_COUNT)
        .and_then(amqp_value_as_u64)
        .map(|count| count as u32)
        .unwrap_or(0)
}

/// The expiration the delivery carried before it dead-lettered, from the
/// last x-death entry. Present only on messages that already cycled through
/// a retry queue.
pub(crate) fn original_expiration(headers: &FieldTable) -> u64 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().last())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_ORIGINAL_EXPIRATION))
        .and_then(amqp_value_as_u64)
        .unwrap_or(DEFAULT_ORIGINAL_EXPIRATION_MS)
}

fn string_header(headers: &FieldTable, key: &str) -> Option<String> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .ok()
            .map(str::to_owned),
        AMQPValue::ShortString(value) => Some(value.to_string()),
        _ => None,
    })
}

// Brokers and clients disagree on the integer width of header values, and
// original-expiration arrives as a string.
fn amqp_value_as_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortInt(value) => u64::try_from(*value).ok(),
        AMQPValue::ShortShortUInt(value) => Some(u64::from(*value)),
        AMQPValue::ShortInt(value) => u64::try_from(*value).ok(),
        AMQPValue::ShortUInt(value) => Some(u64::from(*value)),
        AMQPValue::LongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongUInt(value) => Some(u64::from(*value)),
        AMQPValue::LongLongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .ok()
            .and_then(|value| value.parse().ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, LongLongInt};

    fn retriable_spec() -> QueueSpec {
        QueueSpec::new("orders_exchange").durable().with_retry(3, 1.1)
    }

    fn ctx(retry_count: u32, max_retry_count: u32) -> DeliveryContext {
        DeliveryContext {
            correlation_id: Some("cid".to_owned()),
            reply_to: Some("replies".to_owned()),
            retry_count,
            is_last_attempt: retry_count == max_retry_count,
        }
    }

    fn props_with_headers(headers: BTreeMap<ShortString, AMQPValue>) -> AMQPProperties {
        BasicProperties::default().with_headers(FieldTable::from(headers))
    }

    fn death_headers(original_expirations: &[&str]) -> BTreeMap<ShortString, AMQPValue> {
        let deaths = original_expirations
            .iter()
            .map(|expiration| {
                let mut death = BTreeMap::new();
                death.insert(
                    ShortString::from(AMQP_HEADERS_ORIGINAL_EXPIRATION),
                    AMQPValue::LongString(LongString::from(*expiration)),
                );
                AMQPValue::FieldTable(FieldTable::from(death))
            })
            .collect::<Vec<_>>();

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(deaths)),
        );
        headers
    }

    #[test]
    fn success_completes_even_on_the_last_attempt() {
        let spec = retriable_spec();

        assert_eq!(decide(&spec, true, &ctx(3, 3), 10_000), Verdict::Complete);
        assert_eq!(decide(&spec, true, &ctx(0, 3), 10_000), Verdict::Complete);
    }

    #[test]
    fn first_retry_grows_the_expiration_by_the_backoff_factor() {
        let spec = retriable_spec();

        let Verdict::Retry {
            expiration_ms,
            headers,
        } = decide(&spec, false, &ctx(0, 3), 10_000)
        else {
            panic!("expected a retry verdict");
        };

        assert_eq!(expiration_ms, 11_000);
        assert_eq!(
            headers.get(&ShortString::from(AMQP_HEADERS_RETRY_COUNT)),
            Some(&AMQPValue::LongInt(LongInt::from(1)))
        );
        assert_eq!(
            headers.get(&ShortString::from(AMQP_HEADERS_CORRELATION_ID)),
            Some(&AMQPValue::LongString(LongString::from("cid")))
        );
        assert_eq!(
            headers.get(&ShortString::from(AMQP_HEADERS_REPLY_TO)),
            Some(&AMQPValue::LongString(LongString::from("replies")))
        );
    }

    #[test]
    fn second_retry_compounds_on_the_previous_expiration() {
        let spec = retriable_spec();

        let Verdict::Retry { expiration_ms, .. } = decide(&spec, false, &ctx(1, 3), 11_000)
        else {
            panic!("expected a retry verdict");
        };

        assert_eq!(expiration_ms, 12_100);
    }

    #[test]
    fn exhausted_budget_routes_to_the_dead_queue() {
        let spec = retriable_spec();

        let Verdict::Dead { headers } = decide(&spec, false, &ctx(3, 3), 10_000) else {
            panic!("expected a dead verdict");
        };

        assert_eq!(
            headers.get(&ShortString::from(AMQP_HEADERS_CORRELATION_ID)),
            Some(&AMQPValue::LongString(LongString::from("cid")))
        );
        assert!(headers
            .get(&ShortString::from(AMQP_HEADERS_RETRY_COUNT))
            .is_none());
    }

    #[test]
    fn non_retriable_queues_dead_letter_immediately() {
        let spec = QueueSpec::new("orders_exchange");

        let verdict = decide(
            &spec,
            false,
            &DeliveryContext {
                correlation_id: None,
                reply_to: None,
                retry_count: 0,
                is_last_attempt: true,
            },
            10_000,
        );

        let Verdict::Dead { headers } = verdict else {
            panic!("expected a dead verdict");
        };
        assert!(headers.is_empty());
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(retry_count(&FieldTable::default()), 0);

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(2)),
        );
        assert_eq!(retry_count(&FieldTable::from(headers)), 2);
    }

    #[test]
    fn original_expiration_reads_the_last_death_entry() {
        assert_eq!(
            original_expiration(&FieldTable::default()),
            DEFAULT_ORIGINAL_EXPIRATION_MS
        );

        let headers = FieldTable::from(death_headers(&["10000", "11000"]));
        assert_eq!(original_expiration(&headers), 11_000);
    }

    #[test]
    fn correlation_id_prefers_the_property_over_the_header() {
        let spec = retriable_spec();

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_CORRELATION_ID),
            AMQPValue::LongString(LongString::from("cid2")),
        );

        let properties =
            props_with_headers(headers.clone()).with_correlation_id(ShortString::from("cid"));
        assert_eq!(
            delivery_context(&properties, &spec).correlation_id,
            Some("cid".to_owned())
        );

        let properties = props_with_headers(headers);
        assert_eq!(
            delivery_context(&properties, &spec).correlation_id,
            Some("cid2".to_owned())
        );
    }

    #[test]
    fn last_attempt_flag_tracks_the_budget_boundary() {
        let spec = retriable_spec();

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(LongInt::from(3)),
        );
        let properties = props_with_headers(headers);
        assert!(delivery_context(&properties, &spec).is_last_attempt);

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(LongInt::from(2)),
        );
        let properties = props_with_headers(headers);
        assert!(!delivery_context(&properties, &spec).is_last_attempt);
    }

    #[tokio::test]
    async fn evaluate_reports_the_last_attempt_to_the_handler() {
        let spec = retriable_spec();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .withf(|_, _, ctx| ctx.retry_count == 3 && ctx.is_last_attempt)
            .return_const(false);

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(LongInt::from(3)),
        );
        let properties = props_with_headers(headers);

        let verdict = evaluate(&handler, b"payload", &properties, &spec).await;
        assert!(matches!(verdict, Verdict::Dead { .. }));
    }

    #[tokio::test]
    async fn evaluate_completes_on_handler_success() {
        let spec = retriable_spec();

        let mut handler = MockConsumerHandler::new();
        handler.expect_handle().return_const(true);

        let verdict = evaluate(&handler, b"payload", &BasicProperties::default(), &spec).await;
        assert_eq!(verdict, Verdict::Complete);
    }
}
