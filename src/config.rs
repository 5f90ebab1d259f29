// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration Registry
//!
//! The registry holds every named definition the router works with: queues,
//! exchanges, bindings, consumers, producers and the routing table that maps a
//! message type tag to a producer. Lookups are pure and fail with
//! [`AmqpError::ConfigNotFound`] instead of falling back to a default, since a
//! silent default would misroute traffic.
//!
//! A registry can be assembled with the builder methods or parsed from JSON:
//!
//! ```json
//! {
//!   "app_id": "orders-service",
//!   "exchanges": { "orders.x": { "kind": "topic" } },
//!   "queues": { "orders.q": { "durable": true } },
//!   "bindings": { "orders": { "queue": "orders.q", "exchange": "orders.x", "routing_key": "order.created" } },
//!   "consumers": { "orders": { "queue": "orders.q" } },
//!   "producers": { "orders-producer": { "exchange": "orders.x", "key": "order.created" } },
//!   "routing": { "OrderCreated": { "producer": "orders-producer" } }
//! }
//! ```

use crate::{
    errors::{AmqpError, ConfigKind},
    exchange::ExchangeDefinition,
    queue::{BindingDefinition, QueueDefinition},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A message shape that can be published.
///
/// Every publishable type registers its tag explicitly; the tag keys the
/// routing table and is stamped as the AMQP `type` property.
///
/// # Example
/// ```ignore
/// impl Routable for OrderCreated {
///     const MESSAGE_TYPE: &'static str = "OrderCreated";
/// }
/// ```
pub trait Routable: Serialize {
    const MESSAGE_TYPE: &'static str;
}

/// Maps a message type to the producer used to send it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub producer: String,
}

/// Where and how a producer publishes.
///
/// Messages go to `exchange` using every name in `queues` as a routing key,
/// or the single `key` when no queue list is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerDefinition {
    pub(crate) exchange: String,
    pub(crate) key: String,
    pub(crate) queues: Vec<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) mandatory: bool,
    pub(crate) immediate: bool,
}

impl ProducerDefinition {
    /// Publishes to `exchange` with a single routing key.
    pub fn new(exchange: &str, key: &str) -> ProducerDefinition {
        ProducerDefinition {
            exchange: exchange.to_owned(),
            key: key.to_owned(),
            ..Default::default()
        }
    }

    /// Publishes through the default exchange straight to each listed queue.
    pub fn to_queues(queues: &[&str]) -> ProducerDefinition {
        ProducerDefinition {
            queues: queues.iter().map(|q| (*q).to_owned()).collect(),
            ..Default::default()
        }
    }

    /// Sets the exchange messages are published to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Adds a destination queue. Once any queue is listed, the routing key
    /// is no longer used as a destination.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, queue: &str) -> Self {
        self.queues.push(queue.to_owned());
        self
    }

    /// Static reply queue used for request/reply publishes.
    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    /// Asks the broker to return messages no queue accepted.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets the `immediate` publish flag.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Returns the exchange name; empty for the default exchange.
    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// Returns the configured reply queue, if any. Request/reply publishes
    /// without one get a server-named queue.
    pub fn static_reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Routing keys this producer sends to, one publish per entry.
    pub fn destinations(&self) -> Vec<&str> {
        if self.queues.is_empty() {
            vec![self.key.as_str()]
        } else {
            self.queues.iter().map(String::as_str).collect()
        }
    }
}

/// Subscription settings for a named handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    #[serde(default)]
    pub(crate) exclusive: bool,
    #[serde(default)]
    pub(crate) no_local: bool,
    #[serde(default)]
    pub(crate) no_wait: bool,
    #[serde(default)]
    pub(crate) args: Map<String, Value>,
}

impl ConsumerDefinition {
    /// Creates a consumer definition subscribing to `queue`.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    ///
    /// # Returns
    /// A new consumer definition with default settings
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Requests exclusive access to the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the `no_local` consume flag.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Returns the queue this consumer subscribes to.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// The routing registry.
///
/// Holds every named definition the router needs: exchanges, queues and
/// bindings to install, consumers for the registered handlers, producers, and
/// the routing table from message type tags to producers. Lookups never fall
/// back to a default; a miss is an [`AmqpError::ConfigNotFound`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    app_id: String,
    consumers: BTreeMap<String, ConsumerDefinition>,
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueDefinition>,
    bindings: BTreeMap<String, BindingDefinition>,
    producers: BTreeMap<String, ProducerDefinition>,
    routing: BTreeMap<String, RouteDefinition>,
}

impl Config {
    /// Creates an empty registry.
    pub fn new() -> Config {
        Config::default()
    }

    /// Parses a registry from its JSON representation.
    ///
    /// # Parameters
    /// * `raw` - The JSON document, with one object per definition kind
    ///   keyed by name and a `routing` object keyed by message type
    ///
    /// # Returns
    /// The parsed registry, or [`AmqpError::InvalidConfig`]
    pub fn from_json(raw: &str) -> Result<Config, AmqpError> {
        serde_json::from_str(raw).map_err(|err| AmqpError::InvalidConfig(err.to_string()))
    }

    /// Sets the application identifier stamped on every outbound message.
    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = app_id.to_owned();
        self
    }

    /// Registers a consumer definition under a handler name.
    ///
    /// # Parameters
    /// * `name` - The handler name the definition belongs to
    /// * `def` - The subscription settings
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer(mut self, name: &str, def: ConsumerDefinition) -> Self {
        self.consumers.insert(name.to_owned(), def);
        self
    }

    /// Registers an exchange to be declared on startup.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, name: &str, def: ExchangeDefinition) -> Self {
        self.exchanges.insert(name.to_owned(), def);
        self
    }

    /// Registers a queue to be declared on startup. A static reply queue
    /// registered here is declared with this same definition.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, name: &str, def: QueueDefinition) -> Self {
        self.queues.insert(name.to_owned(), def);
        self
    }

    /// Registers a queue-to-exchange binding to be declared on startup.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding(mut self, name: &str, def: BindingDefinition) -> Self {
        self.bindings.insert(name.to_owned(), def);
        self
    }

    /// Registers a named producer that routes can point at.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn producer(mut self, name: &str, def: ProducerDefinition) -> Self {
        self.producers.insert(name.to_owned(), def);
        self
    }

    /// Routes messages of type `M` through the named producer.
    ///
    /// Registering the same type twice keeps the last producer.
    pub fn route<M: Routable>(self, producer: &str) -> Self {
        self.route_named(M::MESSAGE_TYPE, producer)
    }

    /// Routes an explicit type tag through the named producer.
    pub fn route_named(mut self, message_type: &str, producer: &str) -> Self {
        self.routing.insert(
            message_type.to_owned(),
            RouteDefinition {
                producer: producer.to_owned(),
            },
        );
        self
    }

    /// Returns the application identifier stamped on outbound messages.
    pub fn application_id(&self) -> &str {
        &self.app_id
    }

    /// Looks up the consumer definition of a handler.
    ///
    /// # Returns
    /// The definition, or [`AmqpError::ConfigNotFound`] when absent
    pub fn get_consumer(&self, name: &str) -> Result<&ConsumerDefinition, AmqpError> {
        lookup(&self.consumers, ConfigKind::Consumer, name)
    }

    /// Looks up an exchange definition by name.
    pub fn get_exchange(&self, name: &str) -> Result<&ExchangeDefinition, AmqpError> {
        lookup(&self.exchanges, ConfigKind::Exchange, name)
    }

    /// Looks up a queue definition by name.
    pub fn get_queue(&self, name: &str) -> Result<&QueueDefinition, AmqpError> {
        lookup(&self.queues, ConfigKind::Queue, name)
    }

    /// Looks up a binding definition by name.
    pub fn get_binding(&self, name: &str) -> Result<&BindingDefinition, AmqpError> {
        lookup(&self.bindings, ConfigKind::Binding, name)
    }

    /// Looks up a producer definition by name.
    ///
    /// # Returns
    /// The definition, or [`AmqpError::ConfigNotFound`] when absent
    pub fn get_producer(&self, name: &str) -> Result<&ProducerDefinition, AmqpError> {
        lookup(&self.producers, ConfigKind::Producer, name)
    }

    /// Resolves the route registered for `M`.
    pub fn get_route<M: Routable>(&self) -> Result<&RouteDefinition, AmqpError> {
        self.get_route_named(M::MESSAGE_TYPE)
    }

    /// Resolves the route registered for an explicit type tag.
    pub fn get_route_named(&self, message_type: &str) -> Result<&RouteDefinition, AmqpError> {
        lookup(&self.routing, ConfigKind::Route, message_type)
    }

    /// Iterates over the registered exchanges in name order.
    pub fn exchanges(&self) -> impl Iterator<Item = (&str, &ExchangeDefinition)> {
        self.exchanges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates over the registered queues in name order.
    pub fn queues(&self) -> impl Iterator<Item = (&str, &QueueDefinition)> {
        self.queues.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates over the registered bindings in name order.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &BindingDefinition)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn lookup<'a, T>(
    map: &'a BTreeMap<String, T>,
    kind: ConfigKind,
    name: &str,
) -> Result<&'a T, AmqpError> {
    map.get(name).ok_or_else(|| AmqpError::not_found(kind, name))
}
