//! Error types for channels, brokers and transports.

use eanp_core::{ChannelId, CodecError, QueryId};

/// Failures of the connection or of the broker that owns it.
///
/// These reach the driver through query completions and close notifications.
/// They are fatal to whatever was in flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection dropped.
    #[error("disconnected: {reason}")]
    Disconnected {
        /// Details reported by the transport.
        reason: String,
    },

    /// The peer could not be reached.
    #[error("connection refused")]
    ConnectionRefused,

    /// The channel closed while the operation was pending.
    #[error("channel closed")]
    ChannelClosed,

    /// The owning broker stopped.
    #[error("broker stopped")]
    BrokerStopped,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Details about the codec failure.
        message: String,
    },

    /// Lower-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Shorthand for [`TransportError::Disconnected`].
    pub fn disconnected(reason: impl Into<String>) -> Self {
        TransportError::Disconnected {
            reason: reason.into(),
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Misuse of a channel, query or broker that is already in a terminal state.
///
/// Returned to the caller immediately; these always point at a bug in the
/// calling code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// The channel is not open.
    #[error("{channel} is not open")]
    NotOpen {
        /// Channel the operation targeted.
        channel: ChannelId,
    },

    /// The query was already replied to, cancelled or completed.
    #[error("{query} is already resolved")]
    AlreadyResolved {
        /// Query the operation targeted.
        query: QueryId,
    },

    /// The query was received on a different channel.
    #[error("{query} does not belong to {channel}")]
    ForeignQuery {
        /// Query the operation targeted.
        query: QueryId,
        /// Channel asked to answer it.
        channel: ChannelId,
    },

    /// The broker was already started.
    #[error("broker already started")]
    AlreadyStarted,

    /// The channel reached its configured limit of outstanding queries.
    #[error("{channel} has {limit} queries outstanding")]
    TooManyPending {
        /// Channel the operation targeted.
        channel: ChannelId,
        /// Configured limit.
        limit: usize,
    },
}
