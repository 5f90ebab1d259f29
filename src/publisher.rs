// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The publisher is the only writer of publish traffic. For each call it
//! resolves the message's route and producer, encodes the payload, builds a
//! fresh envelope and property set, and sends to every destination of the
//! producer. Request/reply publishes additionally set up a reply destination
//! and hand back a [`ReplyHandle`](crate::correlator::ReplyHandle).

use crate::{
    broker::{Broker, PublishFlags},
    config::{Config, ProducerDefinition, Routable},
    correlator::ReplyCorrelator,
    errors::AmqpError,
    message::{
        Body, NoReply, OutboundMessage, PublishMode, Published, PublishedMessage,
        NO_REPLY_MESSAGE_TYPE, REPLY_MESSAGE_TYPE,
    },
    otel,
};
use chrono::{DateTime, Utc};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Routes, stamps and sends outbound messages.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    correlator: ReplyCorrelator,
}

impl Publisher {
    /// Creates a publisher over a broker session and the registry.
    ///
    /// # Parameters
    /// * `broker` - The broker session messages are sent through
    /// * `config` - The registry routes and producers are resolved from
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Publisher {
        Publisher {
            correlator: ReplyCorrelator::new(broker.clone(), config.clone()),
            broker,
            config,
        }
    }

    /// The correlator used for request/reply publishes.
    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.correlator
    }

    /// Publishes a message through the producer its route names.
    ///
    /// Registry misses and encoding failures abort before anything is sent.
    /// For request/reply the reply subscription is opened before the request
    /// goes out, and the returned [`Published::reply`] resolves once the
    /// correlated reply arrives; this call itself never waits for it.
    pub async fn publish<M: Routable>(
        &self,
        msg: OutboundMessage<M>,
    ) -> Result<Published<M>, AmqpError> {
        let OutboundMessage {
            message,
            route,
            correlation_id,
            mode,
        } = msg;

        let message_type = route.as_deref().unwrap_or(M::MESSAGE_TYPE);
        let route = self.config.get_route_named(message_type)?;
        let producer = self.config.get_producer(&route.producer)?;

        let payload = serde_json::to_vec(&message).map_err(|err| {
            error!(error = err.to_string(), message_type, "failure to encode message");
            AmqpError::from(err)
        })?;

        let envelope = PublishedMessage::new(message, correlation_id);
        let properties = self.properties(
            envelope.id,
            &envelope.correlation_id.to_string(),
            envelope.sent_at,
            M::MESSAGE_TYPE,
        );

        let PublishMode::WithReply(handler) = mode else {
            self.send(producer, &payload, properties).await?;
            return Ok(Published {
                envelope,
                reply: None,
            });
        };

        let address = self
            .correlator
            .reply_destination(producer.static_reply_to())
            .await?;
        let pending = self
            .correlator
            .subscribe(&address, envelope.correlation_id)
            .await?;

        let properties = properties.with_reply_to(ShortString::from(address));
        if let Err(err) = self.send(producer, &payload, properties).await {
            pending.abandon().await;
            return Err(err);
        }

        debug!(correlation_id = %envelope.correlation_id, "awaiting reply");

        Ok(Published {
            envelope,
            reply: Some(pending.spawn(handler)),
        })
    }

    /// Publishes a handler's reply straight to the reply-to queue, echoing the
    /// request's correlation identifier unchanged.
    pub(crate) async fn reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        reply: Option<&Body>,
    ) -> Result<(), AmqpError> {
        let (message_type, payload) = match reply {
            Some(value) => (REPLY_MESSAGE_TYPE, serde_json::to_vec(value)?),
            None => (NO_REPLY_MESSAGE_TYPE, serde_json::to_vec(&NoReply {})?),
        };

        let producer = ProducerDefinition::to_queues(&[reply_to]);
        let properties = self.properties(Uuid::new_v4(), correlation_id, Utc::now(), message_type);

        self.send(&producer, &payload, properties).await
    }

    fn properties(
        &self,
        message_id: Uuid,
        correlation_id: &str,
        sent_at: DateTime<Utc>,
        message_type: &str,
    ) -> BasicProperties {
        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(message_id.to_string()))
            .with_correlation_id(ShortString::from(correlation_id))
            .with_timestamp(sent_at.timestamp().max(0) as u64)
            .with_type(ShortString::from(message_type))
            .with_app_id(ShortString::from(self.config.application_id()))
            .with_headers(FieldTable::from(headers))
    }

    /// Sends to every destination of `producer`. A failed destination is
    /// logged and the rest are still attempted; the publish fails only when
    /// no destination accepted it.
    async fn send(
        &self,
        producer: &ProducerDefinition,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let flags = PublishFlags {
            mandatory: producer.mandatory,
            immediate: producer.immediate,
        };

        let destinations = producer.destinations();
        let mut failures = vec![];

        for routing_key in destinations.iter().copied() {
            if let Err(err) = self
                .broker
                .publish(
                    &producer.exchange,
                    routing_key,
                    flags,
                    payload,
                    properties.clone(),
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    exchange = %producer.exchange,
                    routing_key,
                    "failure to publish to destination"
                );
                failures.push(routing_key.to_owned());
            }
        }

        if failures.len() == destinations.len() {
            return Err(AmqpError::PublishingError(format!(
                "no destination accepted the message: {}",
                failures.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBroker,
        errors::ConfigKind,
        memory::InMemoryBroker,
        message::{Acknowledgement, Disposition},
        queue::QueueDefinition,
        topology::AmqpTopology,
    };
    use mockall::predicate::{always, eq};
    use serde::Serialize;
    use serde_json::json;
    use std::{collections::HashMap, time::Duration};

    #[derive(Debug, Clone, Serialize)]
    struct OrderCreated {
        id: u64,
    }

    impl Routable for OrderCreated {
        const MESSAGE_TYPE: &'static str = "OrderCreated";
    }

    #[derive(Serialize)]
    struct Unrouted;

    impl Routable for Unrouted {
        const MESSAGE_TYPE: &'static str = "Unrouted";
    }

    // JSON objects need string keys, so this never encodes
    #[derive(Serialize)]
    struct Unencodable {
        index: HashMap<(u8, u8), u8>,
    }

    impl Routable for Unencodable {
        const MESSAGE_TYPE: &'static str = "Unencodable";
    }

    fn config() -> Config {
        Config::new()
            .app_id("orders-service")
            .producer(
                "orders-producer",
                ProducerDefinition::new("orders.x", "order.created"),
            )
            .producer("fan-out", ProducerDefinition::to_queues(&["q1", "q2"]))
            .route::<OrderCreated>("orders-producer")
            .route_named("Bulk", "fan-out")
            .route_named("Broken", "missing-producer")
            .route::<Unencodable>("orders-producer")
    }

    fn publisher(broker: MockBroker) -> Publisher {
        Publisher::new(Arc::new(broker), Arc::new(config()))
    }

    #[tokio::test]
    async fn unrouted_message_fails_without_network() {
        let publisher = publisher(MockBroker::new());

        let err = publisher
            .publish(OutboundMessage::new(Unrouted))
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            AmqpError::ConfigNotFound {
                kind: ConfigKind::Route,
                name: "Unrouted".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn missing_producer_fails_without_network() {
        let publisher = publisher(MockBroker::new());

        let err = publisher
            .publish(OutboundMessage::new(OrderCreated { id: 1 }).route("Broken"))
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            AmqpError::ConfigNotFound {
                kind: ConfigKind::Producer,
                name: "missing-producer".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn encoding_failure_sends_nothing() {
        let publisher = publisher(MockBroker::new());

        let err = publisher
            .publish(OutboundMessage::new(Unencodable {
                index: HashMap::from([((1, 2), 3)]),
            }))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, AmqpError::EncodingError(_)));
    }

    #[tokio::test]
    async fn stamps_protocol_metadata() {
        let correlation_id = Uuid::new_v4();
        let expected_correlation = correlation_id.to_string();

        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .withf(move |exchange, routing_key, _, payload, props| {
                exchange == "orders.x"
                    && routing_key == "order.created"
                    && payload == br#"{"id":42}"#
                    && props.content_type().as_ref().map(|v| v.as_str()) == Some(JSON_CONTENT_TYPE)
                    && props.kind().as_ref().map(|v| v.as_str()) == Some("OrderCreated")
                    && props.app_id().as_ref().map(|v| v.as_str()) == Some("orders-service")
                    && props.correlation_id().as_ref().map(|v| v.as_str())
                        == Some(expected_correlation.as_str())
                    && props.message_id().is_some()
                    && props.timestamp().is_some()
                    && props.reply_to().is_none()
            })
            .returning(|_, _, _, _, _| Ok(()));

        let published = publisher(broker)
            .publish(OutboundMessage::new(OrderCreated { id: 42 }).correlation_id(correlation_id))
            .await
            .unwrap();

        assert_eq!(published.envelope.correlation_id, correlation_id);
        assert_eq!(published.envelope.message.id, 42);
        assert!(published.reply.is_none());
    }

    #[tokio::test]
    async fn fan_out_survives_one_failed_destination() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(eq(""), eq("q1"), always(), always(), always())
            .times(1)
            .returning(|_, _, _, _, _| Err(AmqpError::PublishingError("q1 down".to_owned())));
        broker
            .expect_publish()
            .with(eq(""), eq("q2"), always(), always(), always())
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let published = publisher(broker)
            .publish(OutboundMessage::new(OrderCreated { id: 7 }).route("Bulk"))
            .await;

        assert!(published.is_ok());
    }

    #[tokio::test]
    async fn fan_out_fails_when_every_destination_fails() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(2)
            .returning(|_, _, _, _, _| Err(AmqpError::PublishingError("down".to_owned())));

        let err = publisher(broker)
            .publish(OutboundMessage::new(OrderCreated { id: 7 }).route("Bulk"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, AmqpError::PublishingError(_)));
    }

    #[tokio::test]
    async fn request_reply_uses_anonymous_queue_and_resolves() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_queue("orders.q", &QueueDefinition::new())
            .await
            .unwrap();

        let config = Config::new()
            .producer("direct", ProducerDefinition::to_queues(&["orders.q"]))
            .route::<OrderCreated>("direct");
        let publisher = Publisher::new(broker.clone(), Arc::new(config));

        let published = publisher
            .publish(OutboundMessage::awaiting_reply(OrderCreated { id: 42 }))
            .await
            .unwrap();

        let request = broker.published().remove(0);
        let reply_to = request.properties.reply_to().clone().unwrap().to_string();
        assert!(reply_to.starts_with("amq.gen-"));

        publisher
            .reply(
                &reply_to,
                &published.envelope.correlation_id.to_string(),
                Some(&Body::try_from(json!({"status": "ok"})).unwrap()),
            )
            .await
            .unwrap();

        let body = published
            .reply
            .unwrap()
            .wait_timeout(Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(body.into_inner(), json!({"status": "ok"}).as_object().cloned().unwrap());
        assert!(broker
            .settlements()
            .iter()
            .all(|(_, ack)| *ack == Acknowledgement::Ack));
        // the server-named queue goes away with its only subscription
        assert!(!broker.has_queue(&reply_to));
    }

    #[tokio::test]
    async fn request_reply_reuses_installed_reply_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = Config::new()
            .queue("orders.q", QueueDefinition::new())
            .queue("orders.replies", QueueDefinition::new().auto_delete())
            .producer(
                "direct",
                ProducerDefinition::to_queues(&["orders.q"]).reply_to("orders.replies"),
            )
            .route::<OrderCreated>("direct");

        let report = AmqpTopology::new(broker.as_ref(), &config).install().await;
        assert!(report.is_clean());

        let publisher = Publisher::new(broker.clone(), Arc::new(config));
        let published = publisher
            .publish(OutboundMessage::awaiting_reply(OrderCreated { id: 3 }))
            .await
            .unwrap();

        let request = broker.published().remove(0);
        assert_eq!(
            request.properties.reply_to().as_ref().map(|r| r.as_str()),
            Some("orders.replies")
        );

        publisher
            .reply(
                "orders.replies",
                &published.envelope.correlation_id.to_string(),
                Some(&Body::try_from(json!({"status": "ok"})).unwrap()),
            )
            .await
            .unwrap();

        let body = published
            .reply
            .unwrap()
            .wait_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(body.get("status"), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn request_reply_send_failure_cancels_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_publish_to("orders.q");

        let config = Config::new()
            .producer(
                "direct",
                ProducerDefinition::to_queues(&["orders.q"]).reply_to("orders.replies"),
            )
            .route::<OrderCreated>("direct");
        let publisher = Publisher::new(broker.clone(), Arc::new(config));

        let result = publisher
            .publish(OutboundMessage::with_reply(OrderCreated { id: 1 }, |_| {
                Disposition::ack()
            }))
            .await;

        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
        assert!(broker.has_queue("orders.replies"));
        assert_eq!(broker.subscriber_count("orders.replies"), 0);
    }

    #[tokio::test]
    async fn handler_reply_without_payload_is_marked() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_queue("replies", &QueueDefinition::new())
            .await
            .unwrap();
        let publisher = Publisher::new(broker.clone(), Arc::new(Config::new()));

        publisher.reply("replies", "abc-123", None).await.unwrap();

        let record = broker.published().remove(0);
        assert_eq!(record.exchange, "");
        assert_eq!(record.routing_key, "replies");
        assert_eq!(record.payload, b"{}");
        assert_eq!(
            record.properties.kind().as_ref().map(|k| k.as_str()),
            Some(NO_REPLY_MESSAGE_TYPE)
        );
        assert_eq!(
            record.properties.correlation_id().as_ref().map(|c| c.as_str()),
            Some("abc-123")
        );
    }
}
