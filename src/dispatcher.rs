// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! The dispatcher owns the registered handlers. Starting it installs the
//! registry topology, opens one subscription per handler (consumer tag = the
//! handler name, settings from the consumer definition of the same name) and
//! runs one task per subscription. Each task handles its deliveries strictly
//! in arrival order until the stream closes.
//!
//! A handler whose consumer definition is missing, whose queue failed to
//! declare, or whose subscription cannot be opened is logged and skipped; the
//! remaining handlers still start.

use crate::{
    broker::Broker,
    config::Config,
    consumer::consume,
    errors::AmqpError,
    message::{Body, Disposition},
    publisher::Publisher,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A named message handler.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Must match a consumer definition in the registry.
    fn name(&self) -> &str;

    /// Handles one decoded delivery and decides how it is settled, and
    /// optionally what is replied.
    async fn handle(&self, body: Body) -> Disposition;
}

/// Runs one dispatch loop per registered handler.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    publisher: Arc<Publisher>,
    handlers: BTreeMap<String, Arc<dyn ConsumerHandler>>,
    started: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher with no handlers.
    ///
    /// # Parameters
    /// * `broker` - The broker session subscriptions are opened on
    /// * `config` - The registry holding topology and consumer definitions
    /// * `publisher` - Used to publish handler replies
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>, publisher: Arc<Publisher>) -> Self {
        Dispatcher {
            broker,
            config,
            publisher,
            handlers: BTreeMap::default(),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a handler under its name. A second handler with the same
    /// name is ignored.
    pub fn register(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        let name = handler.name().to_owned();

        if self.handlers.contains_key(&name) {
            warn!(handler = name, "handler already registered, ignoring");
            return self;
        }

        self.handlers.insert(name, handler);
        self
    }

    /// Names of the registered handlers, in order.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Installs the topology and starts the dispatch loops.
    ///
    /// Only the first call does anything; later calls return no tasks.
    pub async fn consume(&self) -> Vec<(String, JoinHandle<()>)> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already started");
            return vec![];
        }

        let report = AmqpTopology::new(self.broker.as_ref(), &self.config)
            .install()
            .await;
        if !report.is_clean() {
            warn!(failures = report.errors.len(), "topology partially installed");
        }

        let mut spawns = vec![];

        for (name, handler) in &self.handlers {
            let def = match self.config.get_consumer(name) {
                Ok(def) => def,
                Err(err) => {
                    warn!(error = err.to_string(), handler = name, "skipping handler");
                    continue;
                }
            };

            if report.queue_failed(def.queue()) {
                warn!(handler = name, queue = def.queue(), "skipping handler, queue was not declared");
                continue;
            }

            let mut stream = match self.broker.consume(def.queue(), name, def).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = err.to_string(), handler = name, "failure to create the consumer");
                    continue;
                }
            };

            let handler = handler.clone();
            let broker = self.broker.clone();
            let publisher = self.publisher.clone();
            let handler_name = name.clone();

            spawns.push((
                name.clone(),
                tokio::spawn(async move {
                    let tracer = global::tracer("amqp consumer");

                    while let Some(result) = stream.next().await {
                        match result {
                            Ok(delivery) => {
                                if let Err(err) = consume(
                                    &tracer,
                                    &delivery,
                                    handler.as_ref(),
                                    &publisher,
                                    broker.as_ref(),
                                )
                                .await
                                {
                                    error!(error = err.to_string(), "error consume msg");
                                }
                            }

                            Err(err) => error!(error = err.to_string(), "errors consume msg"),
                        }
                    }

                    debug!(handler = handler_name, "delivery stream closed");
                }),
            ));
        }

        spawns
    }

    /// Starts the dispatch loops and waits until every one of them ends.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let spawns = self.consume().await;

        let spawned = join_all(spawns.into_iter().map(|(_, handle)| handle)).await;
        for res in spawned {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}
