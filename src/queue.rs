// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Definitions
//!
//! Declarative descriptors for queues and queue-to-exchange bindings. Like
//! exchanges, both are keyed by name in the registry and are purely descriptive.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its declaration flags and arguments.
///
/// Supports the standard flags plus the common `x-*` limits, which are
/// rendered into the declaration arguments by [`QueueDefinition::arguments`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) args: Map<String, Value>,
}

impl QueueDefinition {
    pub fn new() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// A server-named reply queue: exclusive to this connection and removed
    /// once its last consumer goes away.
    pub fn anonymous_reply() -> QueueDefinition {
        QueueDefinition::new().exclusive().auto_delete()
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

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a raw declaration argument.
    pub fn arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Renders the limits and raw arguments into an AMQP field table.
    pub fn arguments(&self) -> FieldTable {
        let mut queue_args = field_table_entries(&self.args);

        if let Some(ttl) = self.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(queue_args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    #[serde(default)]
    pub(crate) routing_key: String,
}

impl BindingDefinition {
    pub fn new(queue: &str, exchange: &str) -> BindingDefinition {
        BindingDefinition {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: String::new(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Converts JSON-style declaration arguments into AMQP values.
///
/// Values with no AMQP counterpart (nested objects, arrays) are skipped.
pub(crate) fn field_table_entries(args: &Map<String, Value>) -> BTreeMap<ShortString, AMQPValue> {
    let mut table = BTreeMap::new();

    for (key, value) in args {
        let amqp_value = match value {
            Value::Bool(v) => AMQPValue::Boolean(*v),
            Value::Number(n) if n.is_i64() => AMQPValue::LongLongInt(n.as_i64().unwrap_or_default()),
            Value::Number(n) => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            _ => continue,
        };

        table.insert(ShortString::from(key.as_str()), amqp_value);
    }

    table
}
