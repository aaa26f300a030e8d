//! IncomingQuery: a request from the peer that this side owes one reply.
//!
//! The peer may withdraw the query at any time before the reply, and the
//! channel withdraws it when it closes. Handlers must check
//! [`IncomingQuery::is_pending`] rather than assume the query is still live.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use eanp_core::{Message, QueryId};

use super::core::{Channel, ChannelInner};
use crate::coordinator::Coordinator;
use crate::error::UsageError;
use crate::transport::Frame;

/// Lifecycle state of an incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    /// Waiting for a local reply.
    Pending,
    /// Replied to.
    Replied,
    /// Withdrawn by the peer or by the channel closing.
    Cancelled,
}

type CancellationCallback = Box<dyn FnOnce(&IncomingQuery)>;

/// Handle to a query received from the peer. Clones share the same query.
#[derive(Clone)]
pub struct IncomingQuery {
    inner: Rc<IncomingInner>,
}

struct IncomingInner {
    id: QueryId,
    request: Message,
    channel: Weak<ChannelInner>,
    coordinator: Coordinator,
    core: RefCell<IncomingCore>,
}

struct IncomingCore {
    state: IncomingState,
    cancellation_delivered: bool,
    on_cancellation: Vec<CancellationCallback>,
}

impl IncomingQuery {
    pub(crate) fn new(
        id: QueryId,
        request: Message,
        channel: Weak<ChannelInner>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            inner: Rc::new(IncomingInner {
                id,
                request,
                channel,
                coordinator,
                core: RefCell::new(IncomingCore {
                    state: IncomingState::Pending,
                    cancellation_delivered: false,
                    on_cancellation: Vec::new(),
                }),
            }),
        }
    }

    /// Peer-assigned query id.
    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    /// The request sent by the peer.
    pub fn request(&self) -> &Message {
        &self.inner.request
    }

    /// The channel the query arrived on, while it still exists.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IncomingState {
        self.inner.core.borrow().state
    }

    /// Whether a reply is still expected.
    pub fn is_pending(&self) -> bool {
        self.state() == IncomingState::Pending
    }

    /// Call `callback` once if the query gets cancelled.
    ///
    /// Subscribing to a query whose cancellation was already delivered
    /// schedules the callback right away; subscribing to a replied query does
    /// nothing.
    pub fn on_cancellation(&self, callback: impl FnOnce(&IncomingQuery) + 'static) {
        {
            let mut core = self.inner.core.borrow_mut();
            match core.state {
                IncomingState::Replied => return,
                IncomingState::Cancelled if core.cancellation_delivered => {}
                _ => {
                    core.on_cancellation.push(Box::new(callback));
                    return;
                }
            }
        }
        let this = self.clone();
        self.inner.coordinator.post(move || callback(&this));
    }

    /// Send the reply.
    ///
    /// Fails with [`UsageError::AlreadyResolved`] if the query was already
    /// replied to or cancelled; nothing is sent in that case.
    pub fn reply(&self, message: Message) -> Result<(), UsageError> {
        let already_resolved = UsageError::AlreadyResolved { query: self.id() };
        if !self.is_pending() {
            return Err(already_resolved);
        }
        let channel = self.channel().ok_or(already_resolved)?;

        self.inner.core.borrow_mut().state = IncomingState::Replied;
        channel.forget_incoming(self.id());
        tracing::debug!(channel = %channel.id(), query = %self.id(), kind = message.kind(), "replying");
        channel.transmit(Frame::Reply {
            id: self.id(),
            message,
        });
        Ok(())
    }

    /// Mark the query cancelled and schedule cancellation delivery.
    ///
    /// Returns `false` if it was not pending.
    pub(crate) fn cancel(&self) -> bool {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.state != IncomingState::Pending {
                return false;
            }
            core.state = IncomingState::Cancelled;
        }

        let this = self.clone();
        self.inner.coordinator.post(move || this.deliver_cancellation());
        true
    }

    fn deliver_cancellation(&self) {
        let callbacks = {
            let mut core = self.inner.core.borrow_mut();
            core.cancellation_delivered = true;
            std::mem::take(&mut core.on_cancellation)
        };
        for callback in callbacks {
            callback(self);
        }
    }
}

impl std::fmt::Debug for IncomingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingQuery")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.request.kind())
            .field("state", &self.state())
            .finish()
    }
}
