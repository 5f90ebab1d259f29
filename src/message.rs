// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Outbound messages, the envelope returned for every publish, the generic
//! inbound payload and the disposition a handler assigns to a delivery.

use crate::{correlator::ReplyHandle, errors::AmqpError};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Type tag stamped on replies carrying a handler's payload.
pub const REPLY_MESSAGE_TYPE: &str = "Reply";
/// Type tag stamped on replies when the handler attached none.
pub const NO_REPLY_MESSAGE_TYPE: &str = "NoReply";

/// Invoked by the correlator with the decoded reply; decides how the reply
/// delivery itself is settled.
pub type ReplyHandler = Box<dyn FnOnce(&Body) -> Disposition + Send>;

/// Whether a publish waits for a correlated reply.
pub enum PublishMode {
    Regular,
    WithReply(ReplyHandler),
}

/// A logical message ready to be routed and published.
pub struct OutboundMessage<M> {
    pub(crate) message: M,
    pub(crate) route: Option<String>,
    pub(crate) correlation_id: Option<Uuid>,
    pub(crate) mode: PublishMode,
}

impl<M> OutboundMessage<M> {
    /// Fire-and-forget publish.
    pub fn new(message: M) -> OutboundMessage<M> {
        OutboundMessage {
            message,
            route: None,
            correlation_id: None,
            mode: PublishMode::Regular,
        }
    }

    /// Request/reply publish; `handler` settles the reply delivery.
    pub fn with_reply<F>(message: M, handler: F) -> OutboundMessage<M>
    where
        F: FnOnce(&Body) -> Disposition + Send + 'static,
    {
        OutboundMessage {
            mode: PublishMode::WithReply(Box::new(handler)),
            ..OutboundMessage::new(message)
        }
    }

    /// Request/reply publish that acknowledges the reply once received.
    pub fn awaiting_reply(message: M) -> OutboundMessage<M> {
        Self::with_reply(message, |_| Disposition::ack())
    }

    /// Resolves the route by this tag instead of the message's own type.
    pub fn route(mut self, message_type: &str) -> Self {
        self.route = Some(message_type.to_owned());
        self
    }

    /// Adopts a caller-supplied correlation identifier.
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Whether this message is a request/reply publish.
    pub fn expects_reply(&self) -> bool {
        matches!(self.mode, PublishMode::WithReply(_))
    }
}

/// The envelope produced by every publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedMessage<M> {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub message: M,
}

impl<M> PublishedMessage<M> {
    pub(crate) fn new(message: M, correlation_id: Option<Uuid>) -> PublishedMessage<M> {
        PublishedMessage {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            sent_at: Utc::now(),
            message,
        }
    }
}

/// Result of a publish: the envelope, plus the reply handle for request/reply.
pub struct Published<M> {
    pub envelope: PublishedMessage<M>,
    pub reply: Option<ReplyHandle>,
}

/// Body of a reply whose handler attached no payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoReply {}

/// The generic payload decoded from an inbound delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Body(Map<String, Value>);

impl Body {
    /// Decodes a wire body. Anything but a JSON object is an encoding error.
    pub fn decode(data: &[u8]) -> Result<Body, AmqpError> {
        Ok(Body(serde_json::from_slice(data)?))
    }

    /// Coerces the payload into a caller-specified shape.
    pub fn to<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Body {
    fn from(map: Map<String, Value>) -> Self {
        Body(map)
    }
}

/// Only JSON objects are bodies; any other value is an encoding error.
impl TryFrom<Value> for Body {
    type Error = AmqpError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Body(map)),
            other => Err(AmqpError::EncodingError(format!(
                "expected a JSON object, got `{}`",
                other
            ))),
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// The outcome of handling one delivery, with an optional reply payload.
///
/// Replies are JSON objects, the only shape a [`Body`] decodes from, so the
/// requester always receives them intact.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    ack: Acknowledgement,
    reply: Option<Body>,
}

impl Disposition {
    /// Acknowledges the delivery.
    pub fn ack() -> Disposition {
        Disposition {
            ack: Acknowledgement::Ack,
            reply: None,
        }
    }

    /// Negatively acknowledges the delivery, optionally requeueing it.
    pub fn nack(requeue: bool) -> Disposition {
        Disposition {
            ack: Acknowledgement::Nack { requeue },
            reply: None,
        }
    }

    /// Rejects the delivery, optionally requeueing it.
    pub fn reject(requeue: bool) -> Disposition {
        Disposition {
            ack: Acknowledgement::Reject { requeue },
            reply: None,
        }
    }

    /// Attaches the reply published to the delivery's reply-to address.
    pub fn with_reply(self, reply: impl Into<Body>) -> Self {
        Disposition {
            reply: Some(reply.into()),
            ..self
        }
    }

    pub fn acknowledgement(&self) -> Acknowledgement {
        self.ack
    }

    pub fn reply(&self) -> Option<&Body> {
        self.reply.as_ref()
    }
}
