// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Declarative descriptors for broker exchanges. An exchange definition is keyed
//! by name in the [`Config`](crate::config::Config) registry and carries no
//! behavior of its own; the topology installer turns it into a declare call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Represents the types of exchanges available in the broker.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration flags.
///
/// Built with the builder methods below or deserialized from the registry
/// JSON document. Defaults to a non-durable direct exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) args: Map<String, Value>,
}

impl ExchangeDefinition {
    pub fn new(kind: ExchangeKind) -> ExchangeDefinition {
        ExchangeDefinition {
            kind,
            ..Default::default()
        }
    }

    pub fn direct() -> ExchangeDefinition {
        Self::new(ExchangeKind::Direct)
    }

    pub fn fanout() -> ExchangeDefinition {
        Self::new(ExchangeKind::Fanout)
    }

    pub fn topic() -> ExchangeDefinition {
        Self::new(ExchangeKind::Topic)
    }

    pub fn headers() -> ExchangeDefinition {
        Self::new(ExchangeKind::Headers)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
