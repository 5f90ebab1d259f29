// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! Declares every exchange, queue and binding of the registry, in that order.
//! A failed declaration is logged and recorded; the operations depending on
//! the failed resource (bindings, and consumers of a failed queue) are skipped
//! while every other resource is still declared. Declaring the same registry
//! twice is harmless: declarations are idempotent on the broker.

use crate::{broker::Broker, config::Config, errors::AmqpError};
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

/// Outcome of one installation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub errors: Vec<AmqpError>,
    failed_exchanges: BTreeSet<String>,
    failed_queues: BTreeSet<String>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn queue_failed(&self, name: &str) -> bool {
        self.failed_queues.contains(name)
    }

    pub fn exchange_failed(&self, name: &str) -> bool {
        self.failed_exchanges.contains(name)
    }
}

/// Installs the registry's topology through a broker session.
pub struct AmqpTopology<'tp> {
    broker: &'tp dyn Broker,
    config: &'tp Config,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(broker: &'tp dyn Broker, config: &'tp Config) -> AmqpTopology<'tp> {
        AmqpTopology { broker, config }
    }

    /// Installs the topology.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares all queues
    /// 3. Binds queues to exchanges, skipping bindings whose queue or
    ///    exchange failed to declare
    pub async fn install(&self) -> InstallReport {
        let mut report = InstallReport::default();

        self.install_exchanges(&mut report).await;
        self.install_queues(&mut report).await;
        self.binding_queues(&mut report).await;

        report
    }

    async fn install_exchanges(&self, report: &mut InstallReport) {
        for (name, def) in self.config.exchanges() {
            debug!("creating exchange: {}", name);

            match self.broker.declare_exchange(name, def).await {
                Err(err) => {
                    error!(error = err.to_string(), name, "error to declare the exchange");
                    report.failed_exchanges.insert(name.to_owned());
                    report.errors.push(err);
                }
                _ => debug!("exchange: {} was created", name),
            }
        }
    }

    async fn install_queues(&self, report: &mut InstallReport) {
        for (name, def) in self.config.queues() {
            debug!("creating queue: {}", name);

            match self.broker.declare_queue(name, def).await {
                Err(err) => {
                    error!(error = err.to_string(), name, "error to declare the queue");
                    report.failed_queues.insert(name.to_owned());
                    report.errors.push(err);
                }
                _ => debug!("queue: {} was created", name),
            }
        }
    }

    async fn binding_queues(&self, report: &mut InstallReport) {
        for (name, binding) in self.config.bindings() {
            if report.queue_failed(binding.queue()) || report.exchange_failed(binding.exchange()) {
                warn!(binding = name, "skipping binding, its queue or exchange was not declared");
                continue;
            }

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue(),
                binding.exchange(),
                binding.key()
            );

            if let Err(err) = self.broker.bind_queue(binding).await {
                error!(error = err.to_string(), binding = name, "error to bind queue to exchange");
                report.errors.push(err);
            }
        }
    }
}
