//! Channels and the queries travelling on them.
//!
//! A [`Channel`] is created by a broker when the transport announces it and
//! lives until it closes. It owns the pending [`OutgoingQuery`] and
//! [`IncomingQuery`] handles; both keep only a weak reference back.

mod core;
mod incoming;
mod outgoing;

pub use self::core::{Channel, ChannelState};
pub use incoming::{IncomingQuery, IncomingState};
pub use outgoing::{OutgoingQuery, OutgoingState, QueryCompletion, QueryOutcome};
