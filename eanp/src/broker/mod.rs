//! Brokers own the channels of one endpoint.
//!
//! A client broker opens a single channel on start and halts when it loses
//! it. A server broker accepts inbound channels until it is stopped.

mod config;
mod core;

pub use config::BrokerConfig;
pub use self::core::{Broker, BrokerRole, BrokerState, WeakBroker};
