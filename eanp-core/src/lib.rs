//! # eanp-core
//!
//! Value types shared by every layer of the EAnp harness:
//!
//! - [`Message`]: typed envelope (type tag + ordered typed elements)
//! - [`MessageCodec`] / [`JsonCodec`]: pluggable byte encoding for transports
//! - [`protocol`]: command, result and failure vocabulary
//! - [`ChannelId`], [`QueryId`], [`EndpointId`]: identifiers
//!
//! Nothing here owns a resource or performs I/O.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod message;
pub mod protocol;
mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use message::{Element, ElementKind, Message, MessageError};
pub use protocol::{Command, CommandName, FailureKind, ProtocolFailure, ResultKind};
pub use types::{ChannelId, EndpointId, QueryId};
