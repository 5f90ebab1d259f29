// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seam
//!
//! The router never talks to `lapin` directly outside of [`crate::channel`].
//! Every component goes through the [`Broker`] trait, which exposes the
//! declare/publish/consume/settle/cancel primitives of one broker session.
//! Implementations must serialize these calls: many tasks share one session.

use crate::{
    config::ConsumerDefinition,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{BindingDefinition, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;

/// A stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Delivery flags for a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

/// One unit of payload plus metadata received from a subscribed queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties
            .reply_to()
            .as_ref()
            .map(|to| to.as_str())
            .filter(|to| !to.is_empty())
    }

    pub fn kind(&self) -> &str {
        self.properties
            .kind()
            .as_ref()
            .map(|kind| kind.as_str())
            .unwrap_or_default()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// The broker session primitives the router is built on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, def: &ExchangeDefinition)
        -> Result<(), AmqpError>;

    /// Declares a queue and returns its effective name. An empty `name` asks
    /// the broker for a server-named queue.
    async fn declare_queue(&self, name: &str, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &BindingDefinition) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;
}
