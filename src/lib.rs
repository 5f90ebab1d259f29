// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Router
//!
//! Message routing, request/reply correlation and consumer dispatch on top of
//! an AMQP 0-9-1 broker. Producers, consumers and the broker topology are
//! described in a [`config::Config`] registry; [`controller::Controller`]
//! wires a broker session, the [`publisher::Publisher`] and the
//! [`dispatcher::Dispatcher`] together.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
