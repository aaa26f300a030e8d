//! # EAnp harness
//!
//! Channels, brokers and a serialized command driver for the EAnp
//! query/event protocol.
//!
//! This crate provides:
//! - **Coordinator**: single-threaded context every notification runs on
//! - **Channel**: query/event session with outgoing and incoming queries
//! - **Broker**: client and server channel ownership with start/stop lifecycle
//! - **CommandDriver**: sends queued commands one at a time
//! - **Transports**: the [`Transport`] seam, an in-process loopback with fault
//!   injection, and a recording test double
//! - **Tester**: the host wiring that runs a command script against a peer

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use eanp_core::{
    ChannelId, CodecError, Command, CommandName, Element, ElementKind, EndpointId, FailureKind,
    JsonCodec, Message, MessageCodec, MessageError, ProtocolFailure, QueryId, ResultKind, protocol,
};

// =============================================================================
// Modules
// =============================================================================

/// Error types for channel, broker and transport operations.
pub mod error;

/// The coordination context.
pub mod coordinator;

/// Subscriber lists delivered through the coordinator.
pub mod signal;

/// The transport seam and its implementations.
pub mod transport;

/// Channels and queries.
pub mod channel;

/// Channel owners.
pub mod broker;

/// Serialized command dispatch.
pub mod driver;

/// JSON command scripts.
pub mod script;

/// Broker plus driver wiring.
pub mod tester;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{TransportError, UsageError};

pub use coordinator::{Coordinator, Inbox};
pub use signal::Signal;

pub use transport::{
    Frame, LoopbackConfig, LoopbackNetwork, LoopbackTransport, RecordingTransport, Transport,
    TransportEvent,
};

pub use channel::{
    Channel, ChannelState, IncomingQuery, IncomingState, OutgoingQuery, OutgoingState,
    QueryCompletion, QueryOutcome,
};

pub use broker::{Broker, BrokerConfig, BrokerRole, BrokerState, WeakBroker};

pub use driver::{CommandDriver, CommandReport, CommandStatus, DriverOutcome};

pub use script::{Script, ScriptCommand, ScriptError};

pub use tester::{SetupError, Tester};
