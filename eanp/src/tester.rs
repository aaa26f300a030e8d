//! Host wiring: one broker, one driver, one script.

use std::rc::Rc;

use crate::broker::{Broker, BrokerConfig, BrokerRole};
use crate::coordinator::Coordinator;
use crate::driver::{CommandDriver, DriverOutcome};
use crate::error::UsageError;
use crate::script::{Script, ScriptError};
use crate::transport::Transport;

/// Errors raised while setting a tester up.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The script could not be compiled.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// The broker refused to start.
    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// A broker with a driver attached, started with a script queued.
///
/// The broker is stopped from its own close notification, so a client tester
/// that loses its channel winds down on its own.
pub struct Tester {
    broker: Broker,
    driver: CommandDriver,
}

impl Tester {
    /// Build the broker and driver, queue `script`, and start the broker.
    pub fn setup(
        coordinator: &Coordinator,
        role: BrokerRole,
        transport: Rc<dyn Transport>,
        config: BrokerConfig,
        script: Option<&Script>,
    ) -> Result<Self, SetupError> {
        let broker = Broker::new(coordinator.clone(), role, transport, config);
        let driver = CommandDriver::new(coordinator.clone(), role.to_string());
        driver.attach(&broker);

        if let Some(script) = script {
            let queued = script.enqueue_into(&driver)?;
            tracing::debug!(role = %role, queued, "script queued");
        }

        let weak = broker.downgrade();
        broker.on_close(move |error| {
            match error {
                Some(err) => tracing::info!(role = %role, "Broker stopped: {err}"),
                None => tracing::info!(role = %role, "Broker stopped"),
            }
            if let Some(broker) = weak.upgrade() {
                broker.try_stop();
            }
        });

        broker.start()?;
        Ok(Self { broker, driver })
    }

    /// The tester's broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The tester's driver.
    pub fn driver(&self) -> &CommandDriver {
        &self.driver
    }

    /// Latest driver outcome.
    pub fn outcome(&self) -> Option<DriverOutcome> {
        self.driver.outcome()
    }

    /// Whether the driver reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Stop the broker. Returns whether this call stopped it.
    pub fn shutdown(&self) -> bool {
        self.broker.try_stop()
    }
}
