// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Specifications
//!
//! This module provides the types describing RabbitMQ exchanges: the exchange
//! kind and the declaration parameters. A specification says how an exchange
//! must be declared; the actual declaration is performed (once per
//! connection) by the topology provisioner.

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, ShortString},
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Routing behavior of an exchange.
///
/// - Direct: routes to queues on an exact routing-key match
/// - Fanout: broadcasts to all bound queues
/// - Topic: routes on wildcard routing-key patterns
/// - Headers: routes on message header values
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Declaration parameters of an exchange.
///
/// Defaults to a non-durable direct exchange with no extra arguments.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeSpec {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub internal: bool,
    pub no_wait: bool,
    #[serde(skip)]
    pub params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeSpec {
    pub fn direct() -> ExchangeSpec {
        ExchangeSpec::default()
    }

    pub fn fanout() -> ExchangeSpec {
        ExchangeSpec {
            kind: ExchangeKind::Fanout,
            ..ExchangeSpec::default()
        }
    }

    pub fn topic() -> ExchangeSpec {
        ExchangeSpec {
            kind: ExchangeKind::Topic,
            ..ExchangeSpec::default()
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single declare argument to the exchange.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }
}
