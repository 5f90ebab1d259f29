// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Routing Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers registry lookups, payload encoding, topology
//! declaration, publishing, subscriptions, delivery settlement and reply waits.
//! None of these errors is fatal: each one is either returned to the immediate
//! caller or logged while the responsible task moves on.

use std::fmt;
use thiserror::Error;

/// The kind of registry entry a failed lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Route,
    Producer,
    Consumer,
    Queue,
    Exchange,
    Binding,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ConfigKind::Route => "route",
            ConfigKind::Producer => "producer",
            ConfigKind::Consumer => "consumer",
            ConfigKind::Queue => "queue",
            ConfigKind::Exchange => "exchange",
            ConfigKind::Binding => "binding",
        };

        f.write_str(kind)
    }
}

/// Represents errors that can occur while routing, publishing or dispatching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A registry lookup missed
    #[error("{kind} `{name}` not found")]
    ConfigNotFound { kind: ConfigKind, name: String },

    /// The registry could not be parsed
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Payload serialization or deserialization failed
    #[error("failure to encode payload: {0}")]
    EncodingError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Every destination of a publish failed
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error opening a delivery subscription
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery from an open subscription
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error cancelling a subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// The reply subscription closed before a correlated delivery arrived
    #[error("reply stream `{0}` closed before a reply arrived")]
    ReplyStreamClosed(String),

    /// The correlator task ended without resolving the reply
    #[error("reply was dropped")]
    ReplyDropped,

    /// No reply arrived within the caller's deadline
    #[error("timed out waiting for reply")]
    ReplyTimeout,
}

impl AmqpError {
    pub(crate) fn not_found(kind: ConfigKind, name: &str) -> Self {
        AmqpError::ConfigNotFound {
            kind,
            name: name.to_owned(),
        }
    }

    /// Returns true when the error is a registry lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AmqpError::ConfigNotFound { .. })
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::EncodingError(err.to_string())
    }
}
