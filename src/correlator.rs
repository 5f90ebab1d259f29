// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Correlator
//!
//! Single-shot request/reply correlation. For every request the correlator
//! opens a dedicated subscription on the reply address, scans it for the
//! delivery carrying the request's correlation identifier, hands the decoded
//! reply to the caller through a [`ReplyHandle`] and cancels the subscription.
//!
//! Deliveries on that subscription whose correlation identifier does not
//! match are skipped without being settled. They stay unacknowledged on the
//! subscription until the channel closes, which is only reachable when several
//! requests share a static reply queue; server-named reply queues are private
//! to one request.

use crate::{
    broker::{Broker, DeliveryStream},
    config::{Config, ConsumerDefinition},
    consumer::settle,
    errors::AmqpError,
    message::{Body, PublishedMessage, ReplyHandler},
    queue::QueueDefinition,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Creates reply destinations and waits for correlated replies.
#[derive(Clone)]
pub struct ReplyCorrelator {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
}

impl ReplyCorrelator {
    /// Creates a correlator over a broker session and the registry.
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> ReplyCorrelator {
        ReplyCorrelator { broker, config }
    }

    /// Declares the reply destination for one request and returns its address.
    ///
    /// A static reply queue is declared from its registry definition when one
    /// exists, so the declare matches the installed topology. Without one it is
    /// declared durable and never auto-deleted. Without a static queue the broker
    /// names a fresh exclusive, auto-deleting queue.
    pub async fn reply_destination(&self, static_reply_to: Option<&str>) -> Result<String, AmqpError> {
        match static_reply_to {
            Some(address) => self.declare_reply_queue(address).await,
            None => {
                let address = self
                    .broker
                    .declare_queue("", &QueueDefinition::anonymous_reply())
                    .await?;
                debug!(address = %address, "reply queue declared");
                Ok(address)
            }
        }
    }

    /// Subscribes to `address` for the reply correlated to `envelope` and
    /// starts the background wait. Fails without starting anything when the
    /// queue cannot be declared or the subscription cannot be opened.
    ///
    /// Server-named addresses returned by [`Self::reply_destination`] already
    /// exist and are not declared again; the broker refuses declares in the
    /// reserved `amq.` namespace.
    pub async fn await_reply<M>(
        &self,
        address: &str,
        envelope: &PublishedMessage<M>,
        handler: ReplyHandler,
    ) -> Result<ReplyHandle, AmqpError> {
        if !is_server_named(address) {
            self.declare_reply_queue(address).await?;
        }

        Ok(self
            .subscribe(address, envelope.correlation_id)
            .await?
            .spawn(handler))
    }

    /// Opens the dedicated subscription without starting the wait yet.
    pub(crate) async fn subscribe(
        &self,
        address: &str,
        correlation_id: Uuid,
    ) -> Result<PendingReply, AmqpError> {
        let consumer_tag = consumer_tag(address, &correlation_id);

        let stream = match self
            .broker
            .consume(address, &consumer_tag, &ConsumerDefinition::new(address))
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), address, "failure to subscribe for reply");
                Err(err)
            }
            Ok(s) => Ok(s),
        }?;

        Ok(PendingReply {
            broker: self.broker.clone(),
            consumer_tag,
            correlation_id,
            stream,
        })
    }

    async fn declare_reply_queue(&self, address: &str) -> Result<String, AmqpError> {
        let def = self
            .config
            .get_queue(address)
            .cloned()
            .unwrap_or_else(|_| QueueDefinition::new().durable());

        match self.broker.declare_queue(address, &def).await {
            Err(err) => {
                error!(error = err.to_string(), address, "failure to declare reply queue");
                Err(err)
            }
            Ok(name) => Ok(name),
        }
    }
}

/// Queue names the broker reserves for the queues it names itself.
const SERVER_NAMED_PREFIX: &str = "amq.";

fn is_server_named(address: &str) -> bool {
    address.starts_with(SERVER_NAMED_PREFIX)
}

/// Consumer tag unique per address and outstanding request.
pub(crate) fn consumer_tag(address: &str, correlation_id: &Uuid) -> String {
    format!("{}-{}", address, correlation_id.as_u128())
}

/// An open reply subscription whose wait has not started yet.
pub(crate) struct PendingReply {
    broker: Arc<dyn Broker>,
    consumer_tag: String,
    correlation_id: Uuid,
    stream: DeliveryStream,
}

impl PendingReply {
    pub(crate) fn spawn(self, handler: ReplyHandler) -> ReplyHandle {
        let (sender, receiver) = oneshot::channel();
        let correlation_id = self.correlation_id;

        tokio::spawn(self.run(handler, sender));

        ReplyHandle {
            correlation_id,
            receiver,
        }
    }

    /// Cancels the subscription when the request itself could not be sent.
    pub(crate) async fn abandon(self) {
        if let Err(err) = self.broker.cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), "failure to cancel unused reply subscription");
        }
    }

    async fn run(
        mut self,
        handler: ReplyHandler,
        sender: oneshot::Sender<Result<Body, AmqpError>>,
    ) {
        let expected = self.correlation_id.to_string();

        while let Some(result) = self.stream.next().await {
            let delivery = match result {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = err.to_string(), "errors consume reply");
                    continue;
                }
            };

            if delivery.correlation_id() != Some(expected.as_str()) {
                debug!(
                    consumer_tag = %self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "skipping reply for another request"
                );
                continue;
            }

            let outcome = match Body::decode(&delivery.data) {
                Ok(body) => {
                    let disposition = handler(&body);
                    if let Err(err) =
                        settle(self.broker.as_ref(), delivery.delivery_tag, &disposition).await
                    {
                        error!(error = err.to_string(), "failure to settle reply");
                    }
                    Ok(body)
                }
                Err(err) => {
                    warn!(error = err.to_string(), "rejecting undecodable reply");
                    if let Err(err) = self.broker.reject(delivery.delivery_tag, true).await {
                        error!(error = err.to_string(), "failure to reject reply");
                    }
                    Err(err)
                }
            };

            if let Err(err) = self.broker.cancel(&self.consumer_tag).await {
                warn!(error = err.to_string(), "failure to cancel reply subscription");
            }

            if sender.send(outcome).is_err() {
                debug!(consumer_tag = %self.consumer_tag, "reply arrived after the caller left");
            }

            return;
        }

        let _ = sender.send(Err(AmqpError::ReplyStreamClosed(self.consumer_tag.clone())));
    }
}

/// The caller's side of an outstanding request/reply publish.
///
/// There is no built-in deadline: [`ReplyHandle::wait`] blocks until the reply
/// arrives or the subscription closes. Use [`ReplyHandle::wait_timeout`] to
/// bound it.
#[derive(Debug)]
pub struct ReplyHandle {
    correlation_id: Uuid,
    receiver: oneshot::Receiver<Result<Body, AmqpError>>,
}

impl ReplyHandle {
    /// The correlation identifier of the outstanding request.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Waits for the reply.
    ///
    /// # Returns
    /// The decoded reply, [`AmqpError::ReplyStreamClosed`] when the
    /// subscription closed first, or the decode error of an undecodable reply
    pub async fn wait(self) -> Result<Body, AmqpError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AmqpError::ReplyDropped),
        }
    }

    /// Waits for the reply at most `timeout`; [`AmqpError::ReplyTimeout`]
    /// otherwise.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Body, AmqpError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AmqpError::ReplyTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::PublishFlags,
        memory::InMemoryBroker,
        message::{Acknowledgement, Disposition},
    };
    use lapin::BasicProperties;
    use serde_json::json;

    fn reply_properties(correlation_id: &str) -> BasicProperties {
        BasicProperties::default().with_correlation_id(correlation_id.into())
    }

    fn setup() -> (Arc<InMemoryBroker>, ReplyCorrelator) {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = ReplyCorrelator::new(broker.clone(), Arc::new(Config::new()));
        (broker, correlator)
    }

    #[test]
    fn consumer_tags_differ_per_request() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_ne!(consumer_tag("replies", &a), consumer_tag("replies", &b));
        assert!(consumer_tag("replies", &a).starts_with("replies-"));
    }

    #[tokio::test]
    async fn resolves_matching_reply_and_skips_others() {
        let (broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await
            .unwrap();

        let other = Uuid::new_v4().to_string();
        broker
            .publish("", "replies", PublishFlags::default(), br#"{"status":"late"}"#, reply_properties(&other))
            .await
            .unwrap();
        broker
            .publish(
                "",
                "replies",
                PublishFlags::default(),
                br#"{"status":"ok"}"#,
                reply_properties(&envelope.correlation_id.to_string()),
            )
            .await
            .unwrap();

        let body = handle.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(body.get("status"), Some(&json!("ok")));

        // only the matching delivery was settled
        assert_eq!(broker.settlements(), vec![(2, Acknowledgement::Ack)]);
        assert_eq!(broker.unacked_count(), 1);
        assert_eq!(
            broker.cancelled(),
            vec![consumer_tag("replies", &envelope.correlation_id)]
        );
    }

    #[tokio::test]
    async fn reply_handler_decides_settlement() {
        let (broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::reject(false)))
            .await
            .unwrap();

        broker
            .publish(
                "",
                "replies",
                PublishFlags::default(),
                b"{}",
                reply_properties(&envelope.correlation_id.to_string()),
            )
            .await
            .unwrap();

        handle.wait().await.unwrap();
        assert_eq!(
            broker.settlements(),
            vec![(1, Acknowledgement::Reject { requeue: false })]
        );
    }

    #[tokio::test]
    async fn undecodable_reply_is_requeued_and_surfaced() {
        let (broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await
            .unwrap();

        broker
            .publish(
                "",
                "replies",
                PublishFlags::default(),
                b"not json",
                reply_properties(&envelope.correlation_id.to_string()),
            )
            .await
            .unwrap();

        assert!(matches!(handle.wait().await, Err(AmqpError::EncodingError(_))));
        assert_eq!(
            broker.settlements(),
            vec![(1, Acknowledgement::Reject { requeue: true })]
        );
    }

    #[tokio::test]
    async fn closed_subscription_ends_the_wait() {
        let (broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await
            .unwrap();

        let tag = consumer_tag("replies", &envelope.correlation_id);
        broker.cancel(&tag).await.unwrap();

        assert_eq!(handle.wait().await, Err(AmqpError::ReplyStreamClosed(tag)));
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let (_broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await
            .unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_millis(20)).await,
            Err(AmqpError::ReplyTimeout)
        );
    }

    #[tokio::test]
    async fn declare_failure_starts_nothing() {
        let (broker, correlator) = setup();
        broker.fail_declare_queue("replies");
        let envelope = PublishedMessage::new((), None);

        let result = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await;

        assert_eq!(
            result.unwrap_err(),
            AmqpError::DeclareQueueError("replies".to_owned())
        );
        assert_eq!(broker.subscriber_count("replies"), 0);
    }

    #[tokio::test]
    async fn anonymous_destination_is_server_named() {
        let (broker, correlator) = setup();

        let first = correlator.reply_destination(None).await.unwrap();
        let second = correlator.reply_destination(None).await.unwrap();

        assert_ne!(first, second);
        assert!(broker.has_queue(&first));
        assert!(broker.has_queue(&second));
    }

    #[tokio::test]
    async fn waits_on_server_named_destination_without_redeclaring() {
        let (broker, correlator) = setup();
        let envelope = PublishedMessage::new((), None);

        let address = correlator.reply_destination(None).await.unwrap();
        let handle = correlator
            .await_reply(&address, &envelope, Box::new(|_| Disposition::ack()))
            .await
            .unwrap();

        broker
            .publish(
                "",
                &address,
                PublishFlags::default(),
                br#"{"status":"ok"}"#,
                reply_properties(&envelope.correlation_id.to_string()),
            )
            .await
            .unwrap();

        let body = handle.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(body.get("status"), Some(&json!("ok")));
        assert!(!broker.has_queue(&address));
    }

    #[tokio::test]
    async fn static_queue_is_declared_from_its_registry_definition() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = Config::new().queue("replies", QueueDefinition::new().auto_delete());
        broker
            .declare_queue("replies", config.get_queue("replies").unwrap())
            .await
            .unwrap();
        let correlator = ReplyCorrelator::new(broker.clone(), Arc::new(config));
        let envelope = PublishedMessage::new((), None);

        let handle = correlator
            .await_reply("replies", &envelope, Box::new(|_| Disposition::ack()))
            .await;

        assert!(handle.is_ok());
        assert_eq!(broker.subscriber_count("replies"), 1);
    }

    #[tokio::test]
    async fn static_queue_without_definition_is_durable() {
        let (broker, correlator) = setup();

        correlator.reply_destination(Some("replies")).await.unwrap();

        assert_eq!(
            broker.declare_queue("replies", &QueueDefinition::new().durable()).await,
            Ok("replies".to_owned())
        );
    }
}
