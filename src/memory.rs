// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A single-process [`Broker`] for tests and local development. It keeps the
//! broker semantics the router depends on:
//!
//! - direct, fanout and topic (`*` and `#`) exchanges, plus the default
//!   exchange which routes to the queue named by the routing key
//! - headers exchanges route like fanout: bindings carry no header arguments,
//!   so every binding matches
//! - server-named queues (`amq.gen-N`) for an empty queue name; explicit
//!   declares in the reserved `amq.` namespace are refused
//! - round-robin delivery between the subscribers of a queue
//! - per-delivery settlement; requeued deliveries wait for the next dispatch
//! - auto-delete queues disappear with their last subscriber
//!
//! Every publish and settlement is recorded for inspection, and individual
//! declarations or destinations can be made to fail.

use crate::{
    broker::{Broker, Delivery, DeliveryStream, PublishFlags},
    config::ConsumerDefinition,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Acknowledgement,
    queue::{BindingDefinition, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::debug;

/// One accepted publish.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub flags: PublishFlags,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

struct Subscriber {
    tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Delivery>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

impl QueueState {
    fn new(def: QueueDefinition) -> QueueState {
        QueueState {
            def,
            ready: VecDeque::new(),
            subscribers: vec![],
            next: 0,
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueState>,
    bindings: Vec<BindingDefinition>,
    unacked: BTreeMap<u64, (String, Delivery)>,
    next_tag: u64,
    anonymous: u64,
    published: Vec<PublishRecord>,
    settlements: Vec<(u64, Acknowledgement)>,
    cancelled: Vec<String>,
    failing_publish: BTreeSet<String>,
    failing_queues: BTreeSet<String>,
    failing_exchanges: BTreeSet<String>,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .keys()
                .filter(|name| name.as_str() == routing_key)
                .cloned()
                .collect());
        }

        let def = self.exchanges.get(exchange).ok_or_else(|| {
            AmqpError::PublishingError(format!("exchange `{}` not found", exchange))
        })?;

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange() == exchange) {
            let matched = match def.kind() {
                ExchangeKind::Direct => binding.key() == routing_key,
                ExchangeKind::Topic => topic_matches(
                    &binding.key().split('.').collect::<Vec<_>>(),
                    &routing_key.split('.').collect::<Vec<_>>(),
                ),
                // bindings carry no `x-match` arguments
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };

            if matched && !targets.iter().any(|q| q == binding.queue()) {
                targets.push(binding.queue().to_owned());
            }
        }

        Ok(targets)
    }

    /// Hands ready deliveries to the queue's subscribers in turn.
    fn dispatch(&mut self, queue: &str) {
        let State {
            queues,
            unacked,
            next_tag,
            ..
        } = self;

        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.subscribers.is_empty() {
            let Some(mut delivery) = state.ready.pop_front() else {
                break;
            };

            let idx = state.next % state.subscribers.len();
            state.next = state.next.wrapping_add(1);

            *next_tag += 1;
            delivery.delivery_tag = *next_tag;

            if state.subscribers[idx].sender.send(delivery.clone()).is_err() {
                debug!(queue, "dropping closed subscriber");
                state.subscribers.remove(idx);
                delivery.delivery_tag = 0;
                state.ready.push_front(delivery);
                continue;
            }

            unacked.insert(delivery.delivery_tag, (queue.to_owned(), delivery));
        }
    }

    fn settle(&mut self, delivery_tag: u64, ack: Acknowledgement) -> Option<()> {
        let (queue, mut delivery) = self.unacked.remove(&delivery_tag)?;
        self.settlements.push((delivery_tag, ack));

        let requeue = match ack {
            Acknowledgement::Ack => false,
            Acknowledgement::Nack { requeue } | Acknowledgement::Reject { requeue } => requeue,
        };

        if requeue {
            if let Some(state) = self.queues.get_mut(&queue) {
                delivery.delivery_tag = 0;
                delivery.redelivered = true;
                state.ready.push_front(delivery);
            }
        }

        Some(())
    }
}

/// `*` matches exactly one word, `#` matches zero or more words.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

/// Process-local broker.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every publish with this routing key fail.
    pub fn fail_publish_to(&self, routing_key: &str) {
        self.state().failing_publish.insert(routing_key.to_owned());
    }

    pub fn fail_declare_queue(&self, name: &str) {
        self.state().failing_queues.insert(name.to_owned());
    }

    pub fn fail_declare_exchange(&self, name: &str) {
        self.state().failing_exchanges.insert(name.to_owned());
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.state().published.clone()
    }

    /// Settlements in the order they happened.
    pub fn settlements(&self) -> Vec<(u64, Acknowledgement)> {
        self.state().settlements.clone()
    }

    /// Consumer tags of cancelled subscriptions.
    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn binding_count(&self) -> usize {
        self.state().bindings.len()
    }

    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.subscribers.len())
            .unwrap_or_default()
    }

    /// Deliveries waiting in `queue` for a subscriber.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();

        if state.failing_exchanges.contains(name) {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }

        match state.exchanges.get(name).map(|existing| existing == def) {
            Some(false) => Err(AmqpError::DeclareExchangeError(name.to_owned())),
            Some(true) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state();

        if state.failing_queues.contains(name) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }

        if name.starts_with("amq.") {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }

        let name = if name.is_empty() {
            state.anonymous += 1;
            format!("amq.gen-{}", state.anonymous)
        } else {
            name.to_owned()
        };

        match state.queues.get(&name).map(|existing| &existing.def == def) {
            Some(false) => Err(AmqpError::DeclareQueueError(name)),
            Some(true) => Ok(name),
            None => {
                state.queues.insert(name.clone(), QueueState::new(def.clone()));
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();

        if !state.queues.contains_key(binding.queue())
            || !state.exchanges.contains_key(binding.exchange())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange().to_owned(),
                binding.queue().to_owned(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();

        if state.failing_publish.contains(routing_key) {
            return Err(AmqpError::PublishingError(routing_key.to_owned()));
        }

        let targets = state.route(exchange, routing_key)?;

        state.published.push(PublishRecord {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            flags,
            payload: payload.to_vec(),
            properties: properties.clone(),
        });

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Delivery {
                    delivery_tag: 0,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    properties: properties.clone(),
                    data: payload.to_vec(),
                });
            }
            state.dispatch(&queue);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state();

        let tag_in_use = state
            .queues
            .values()
            .any(|q| q.subscribers.iter().any(|s| s.tag == consumer_tag));
        if tag_in_use {
            return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        match state.queues.get_mut(queue) {
            Some(q) => q.subscribers.push(Subscriber {
                tag: consumer_tag.to_owned(),
                sender,
            }),
            None => return Err(AmqpError::ConsumerDeclarationError(queue.to_owned())),
        }

        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state()
            .settle(delivery_tag, Acknowledgement::Ack)
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state()
            .settle(delivery_tag, Acknowledgement::Nack { requeue })
            .ok_or(AmqpError::NackMessageError)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state()
            .settle(delivery_tag, Acknowledgement::Reject { requeue })
            .ok_or(AmqpError::RejectMessageError)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state();

        let queue = state.queues.iter_mut().find_map(|(name, q)| {
            let idx = q.subscribers.iter().position(|s| s.tag == consumer_tag)?;
            q.subscribers.remove(idx);
            Some((name.clone(), q.def.is_auto_delete() && q.subscribers.is_empty()))
        });

        let Some((queue, delete)) = queue else {
            return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
        };

        state.cancelled.push(consumer_tag.to_owned());

        if delete {
            debug!(queue = %queue, "deleting auto-delete queue");
            state.queues.remove(&queue);
            state.bindings.retain(|b| b.queue() != queue);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<&str> {
        s.split('.').collect()
    }

    async fn next_body(stream: &mut DeliveryStream) -> Vec<u8> {
        stream.next().await.unwrap().unwrap().data
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches(&words("order.*"), &words("order.created")));
        assert!(!topic_matches(&words("order.*"), &words("order.created.eu")));
        assert!(topic_matches(&words("order.#"), &words("order.created.eu")));
        assert!(topic_matches(&words("order.#"), &words("order")));
        assert!(topic_matches(&words("#.eu"), &words("order.created.eu")));
        assert!(!topic_matches(&words("order.created"), &words("order.deleted")));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", &QueueDefinition::new()).await.unwrap();
        let mut stream = broker
            .consume("q", "c1", &ConsumerDefinition::new("q"))
            .await
            .unwrap();

        broker
            .publish("", "q", PublishFlags::default(), b"1", BasicProperties::default())
            .await
            .unwrap();
        broker
            .publish("", "missing", PublishFlags::default(), b"2", BasicProperties::default())
            .await
            .unwrap();

        assert_eq!(next_body(&mut stream).await, b"1");
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn round_robin_between_subscribers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", &QueueDefinition::new()).await.unwrap();
        let mut first = broker.consume("q", "a", &ConsumerDefinition::new("q")).await.unwrap();
        let mut second = broker.consume("q", "b", &ConsumerDefinition::new("q")).await.unwrap();

        for body in [b"1", b"2"] {
            broker
                .publish("", "q", PublishFlags::default(), body, BasicProperties::default())
                .await
                .unwrap();
        }

        assert_eq!(next_body(&mut first).await, b"1");
        assert_eq!(next_body(&mut second).await, b"2");
    }

    #[tokio::test]
    async fn requeued_delivery_waits_for_next_dispatch() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", &QueueDefinition::new()).await.unwrap();
        let mut stream = broker.consume("q", "c", &ConsumerDefinition::new("q")).await.unwrap();

        broker
            .publish("", "q", PublishFlags::default(), b"1", BasicProperties::default())
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.nack(delivery.delivery_tag, true).await.unwrap();

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.nack(delivery.delivery_tag, true).await, Err(AmqpError::NackMessageError));

        broker
            .publish("", "q", PublishFlags::default(), b"2", BasicProperties::default())
            .await
            .unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.data, b"1");
    }

    #[tokio::test]
    async fn conflicting_redeclare_fails() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", &QueueDefinition::new()).await.unwrap();

        assert_eq!(
            broker.declare_queue("q", &QueueDefinition::new().durable()).await,
            Err(AmqpError::DeclareQueueError("q".to_owned()))
        );
        assert_eq!(
            broker.declare_queue("q", &QueueDefinition::new()).await,
            Ok("q".to_owned())
        );
    }

    #[tokio::test]
    async fn cancel_closes_stream_and_drops_auto_delete_queue() {
        let broker = InMemoryBroker::new();
        let name = broker
            .declare_queue("", &QueueDefinition::anonymous_reply())
            .await
            .unwrap();
        let mut stream = broker.consume(&name, "c", &ConsumerDefinition::new(&name)).await.unwrap();

        broker.cancel("c").await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(!broker.has_queue(&name));
        assert_eq!(broker.cancelled(), vec!["c".to_owned()]);
        assert_eq!(
            broker.cancel("c").await,
            Err(AmqpError::CancelConsumerError("c".to_owned()))
        );
    }

    #[tokio::test]
    async fn reserved_names_are_refused() {
        let broker = InMemoryBroker::new();

        assert_eq!(
            broker.declare_queue("amq.gen-7", &QueueDefinition::new()).await,
            Err(AmqpError::DeclareQueueError("amq.gen-7".to_owned()))
        );
        assert!(!broker.has_queue("amq.gen-7"));
    }

    #[tokio::test]
    async fn headers_exchange_routes_to_every_binding() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("h", &ExchangeDefinition::headers()).await.unwrap();
        for queue in ["a", "b"] {
            broker.declare_queue(queue, &QueueDefinition::new()).await.unwrap();
            broker
                .bind_queue(&BindingDefinition::new(queue, "h").routing_key(queue))
                .await
                .unwrap();
        }

        broker
            .publish("h", "ignored", PublishFlags::default(), b"1", BasicProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("a"), 1);
        assert_eq!(broker.ready_count("b"), 1);
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("x", &ExchangeDefinition::fanout()).await.unwrap();
        for queue in ["a", "b"] {
            broker.declare_queue(queue, &QueueDefinition::new()).await.unwrap();
            broker.bind_queue(&BindingDefinition::new(queue, "x")).await.unwrap();
        }
        broker.bind_queue(&BindingDefinition::new("a", "x")).await.unwrap();

        broker
            .publish("x", "anything", PublishFlags::default(), b"1", BasicProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.binding_count(), 2);
        assert_eq!(broker.ready_count("a"), 1);
        assert_eq!(broker.ready_count("b"), 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();

        let result = broker
            .publish("nope", "k", PublishFlags::default(), b"1", BasicProperties::default())
            .await;

        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
        assert!(broker.published().is_empty());
    }
}
