// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handling
//!
//! Processing of one delivery for one handler: decode the body, invoke the
//! handler, publish the reply when the delivery asks for one and settle the
//! delivery with the broker. Every delivery ends acknowledged, negatively
//! acknowledged or rejected; none is dispatched twice by this module.

use crate::{
    broker::{Broker, Delivery},
    dispatcher::ConsumerHandler,
    errors::AmqpError,
    message::{Acknowledgement, Body, Disposition},
    otel,
    publisher::Publisher,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Applies a disposition to the broker.
pub(crate) async fn settle(
    broker: &dyn Broker,
    delivery_tag: u64,
    disposition: &Disposition,
) -> Result<(), AmqpError> {
    match disposition.acknowledgement() {
        Acknowledgement::Ack => broker.ack(delivery_tag).await,
        Acknowledgement::Nack { requeue } => broker.nack(delivery_tag, requeue).await,
        Acknowledgement::Reject { requeue } => broker.reject(delivery_tag, requeue).await,
    }
}

/// Consumes one delivery on behalf of `handler`.
///
/// 1. Decodes the body; an undecodable body is rejected with requeue and
///    never reaches the handler
/// 2. Invokes the handler
/// 3. Publishes the reply when the delivery carries a reply-to address,
///    echoing its correlation identifier
/// 4. Settles the delivery as the handler decided
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: &dyn ConsumerHandler,
    publisher: &Publisher,
    broker: &dyn Broker,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, handler.name());

    debug!(
        handler = handler.name(),
        msg_type = delivery.kind(),
        exchange = %delivery.exchange,
        "received a message for handler",
    );

    let body = match Body::decode(&delivery.data) {
        Ok(body) => body,
        Err(err) => {
            warn!(error = err.to_string(), "rejecting undecodable message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to decode payload"),
            });

            if let Err(e) = broker.reject(delivery.delivery_tag, true).await {
                span.record_error(&e);
                return Err(e);
            }

            return Err(err);
        }
    };

    let disposition = handler.handle(body).await;

    if let Some(reply_to) = delivery.reply_to() {
        let correlation_id = delivery.correlation_id().unwrap_or_default();

        if let Err(err) = publisher
            .reply(reply_to, correlation_id, disposition.reply())
            .await
        {
            error!(error = err.to_string(), reply_to, "failure to publish reply");
            span.record_error(&err);
        }
    }

    match settle(broker, delivery.delivery_tag, &disposition).await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to settle msg"),
            });
            Err(err)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}
