//! The transport seam.
//!
//! Connection establishment, byte framing and reconnect policy belong to the
//! transport. Brokers and channels only see the [`Transport`] trait for
//! outbound work and [`TransportEvent`]s delivered through an [`Inbox`] for
//! inbound work.
//!
//! Two implementations ship with the crate:
//!
//! - [`LoopbackNetwork`]: in-process client/server pair with seeded fault
//!   injection
//! - [`RecordingTransport`]: test double that records outbound frames and lets
//!   a test play the peer

use eanp_core::{ChannelId, Message, QueryId};
use serde::{Deserialize, Serialize};

use crate::coordinator::Inbox;
use crate::error::TransportError;

mod loopback;
mod recording;

pub use loopback::{LoopbackConfig, LoopbackNetwork, LoopbackTransport};
pub use recording::RecordingTransport;

/// Protocol unit exchanged on a channel.
///
/// Query ids always name a query issued by the side that sent the `Query`
/// frame: a `Reply` answers one of the receiver's queries, a `Cancel` withdraws
/// one of the sender's queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A request expecting exactly one reply.
    Query {
        /// Sender-assigned query id.
        id: QueryId,
        /// Request payload.
        message: Message,
    },
    /// The answer to a query.
    Reply {
        /// Id of the query being answered.
        id: QueryId,
        /// Result payload.
        message: Message,
    },
    /// Withdrawal of a query by the side that issued it.
    Cancel {
        /// Id of the withdrawn query.
        id: QueryId,
    },
    /// One-way notification.
    Event {
        /// Event payload.
        message: Message,
    },
}

/// Something the transport observed, addressed to one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel finished its handshake. For a server broker this is also
    /// how a new inbound channel is announced.
    Opened {
        /// Channel that opened.
        channel: ChannelId,
    },
    /// A frame arrived on a channel.
    Frame {
        /// Channel the frame arrived on.
        channel: ChannelId,
        /// The frame.
        frame: Frame,
    },
    /// The channel is gone, cleanly (`None`) or because of `error`.
    Closed {
        /// Channel that closed.
        channel: ChannelId,
        /// Why, when it was not a clean close.
        error: Option<TransportError>,
    },
    /// The transport itself failed; every channel of the broker is lost.
    Failed {
        /// What went wrong.
        error: TransportError,
    },
}

/// Outbound side of a connection collaborator.
///
/// Every method returns promptly; outcomes arrive later as [`TransportEvent`]s
/// through the inbox handed to [`Transport::open`] or [`Transport::listen`].
pub trait Transport {
    /// Start opening an outbound channel and return its id.
    ///
    /// `Opened` or `Closed` for that id follows through `inbox`.
    fn open(&self, inbox: Inbox) -> Result<ChannelId, TransportError>;

    /// Start accepting inbound channels, announced as `Opened` through `inbox`.
    fn listen(&self, inbox: Inbox) -> Result<(), TransportError>;

    /// Send a frame on an open channel.
    fn send(&self, channel: ChannelId, frame: Frame) -> Result<(), TransportError>;

    /// Close a channel from this side. No `Closed` event follows for it.
    fn close(&self, channel: ChannelId);

    /// Stop accepting and release transport resources.
    fn shutdown(&self);
}
