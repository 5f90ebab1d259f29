// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Router Controller
//!
//! Entry point wiring one broker session, the registry, the publisher and the
//! dispatcher together. The registry, including the application identifier,
//! is frozen once the controller is built.

use crate::{
    broker::Broker,
    channel::{new_amqp_channel, ConnectionConfigs},
    config::{Config, Routable},
    dispatcher::{ConsumerHandler, Dispatcher},
    errors::AmqpError,
    message::{OutboundMessage, Published},
    publisher::Publisher,
};
use lapin::Connection;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owns the broker session and everything built on top of it.
///
/// Build it with [`Controller::init`] against a broker, or with
/// [`Controller::with_broker`] over any [`Broker`], then call
/// [`Controller::consume`] to start the handlers.
pub struct Controller {
    connection: Option<Arc<Connection>>,
    config: Arc<Config>,
    publisher: Arc<Publisher>,
    dispatcher: Dispatcher,
}

impl Controller {
    /// Connects to the broker and registers `handlers`.
    ///
    /// # Parameters
    /// * `cfg` - Broker connection settings
    /// * `config` - The registry; frozen from here on
    /// * `handlers` - Handlers to register, one per consumer definition
    ///
    /// # Returns
    /// The controller, or a connection/channel error
    ///
    /// When the registry carries no application identifier the connection's
    /// application name is used.
    pub async fn init(
        cfg: &ConnectionConfigs,
        config: Config,
        handlers: Vec<Arc<dyn ConsumerHandler>>,
    ) -> Result<Controller, AmqpError> {
        let config = if config.application_id().is_empty() {
            config.app_id(&cfg.app_name)
        } else {
            config
        };

        let (connection, channel) = new_amqp_channel(cfg).await?;

        let mut controller = Controller::with_broker(Arc::new(channel), config, handlers);
        controller.connection = Some(connection);

        Ok(controller)
    }

    /// Builds a controller over an existing broker session.
    pub fn with_broker(
        broker: Arc<dyn Broker>,
        config: Config,
        handlers: Vec<Arc<dyn ConsumerHandler>>,
    ) -> Controller {
        let config = Arc::new(config);
        let publisher = Arc::new(Publisher::new(broker.clone(), config.clone()));

        let dispatcher = handlers.into_iter().fold(
            Dispatcher::new(broker, config.clone(), publisher.clone()),
            |dispatcher, handler| dispatcher.register(handler),
        );

        debug!(app_id = config.application_id(), "controller ready");

        Controller {
            connection: None,
            config,
            publisher,
            dispatcher,
        }
    }

    /// Returns the broker connection when built by [`Controller::init`].
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Returns the frozen registry.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a shared handle to the publisher.
    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    /// Returns the dispatcher holding the registered handlers.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Publishes a message; see [`Publisher::publish`].
    pub async fn publish<M: Routable>(
        &self,
        msg: OutboundMessage<M>,
    ) -> Result<Published<M>, AmqpError> {
        self.publisher.publish(msg).await
    }

    /// Installs the topology and starts the dispatch loops.
    pub async fn consume(&self) -> Vec<(String, JoinHandle<()>)> {
        self.dispatcher.consume().await
    }

    /// Starts the dispatch loops and waits for all of them to end.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        self.dispatcher.consume_blocking().await
    }
}
