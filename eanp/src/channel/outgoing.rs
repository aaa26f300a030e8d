//! OutgoingQuery: a request sent on a channel, awaiting its single resolution.
//!
//! A query resolves exactly once, to one [`QueryOutcome`]: the peer's reply,
//! a transport failure, or a local cancellation. Completion subscribers are
//! called once, through the coordinator, after resolution.
//!
//! For async callers [`OutgoingQuery::completion`] returns a [`QueryCompletion`]
//! future backed by a one-shot channel.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use eanp_core::{Message, QueryId};
use tokio::sync::oneshot;

use super::core::{Channel, ChannelInner};
use crate::coordinator::Coordinator;
use crate::error::{TransportError, UsageError};
use crate::transport::Frame;

/// How an outgoing query was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The peer replied.
    Success(Message),
    /// The channel or transport failed before a reply arrived.
    Failure(TransportError),
    /// The query was cancelled locally.
    Cancelled,
}

/// Lifecycle state of an outgoing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Waiting for a resolution.
    Pending,
    /// Resolved by a reply or a failure.
    Completed,
    /// Resolved by a local cancellation.
    Cancelled,
}

type CompletionCallback = Box<dyn FnOnce(&OutgoingQuery)>;

/// Handle to a query sent on a channel. Clones share the same query.
#[derive(Clone)]
pub struct OutgoingQuery {
    inner: Rc<OutgoingInner>,
}

struct OutgoingInner {
    id: QueryId,
    request: Message,
    channel: Weak<ChannelInner>,
    coordinator: Coordinator,
    core: RefCell<OutgoingCore>,
}

#[derive(Default)]
struct OutgoingCore {
    outcome: Option<QueryOutcome>,
    delivered: bool,
    callbacks: Vec<CompletionCallback>,
}

impl OutgoingQuery {
    pub(crate) fn new(
        id: QueryId,
        request: Message,
        channel: Weak<ChannelInner>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            inner: Rc::new(OutgoingInner {
                id,
                request,
                channel,
                coordinator,
                core: RefCell::new(OutgoingCore::default()),
            }),
        }
    }

    /// Query id, unique within the channel.
    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    /// The message that was sent.
    pub fn request(&self) -> &Message {
        &self.inner.request
    }

    /// The channel the query was sent on, while it still exists.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OutgoingState {
        match &self.inner.core.borrow().outcome {
            None => OutgoingState::Pending,
            Some(QueryOutcome::Cancelled) => OutgoingState::Cancelled,
            Some(_) => OutgoingState::Completed,
        }
    }

    /// Whether the query is still waiting for a resolution.
    pub fn is_pending(&self) -> bool {
        self.inner.core.borrow().outcome.is_none()
    }

    /// The resolution, once there is one.
    pub fn outcome(&self) -> Option<QueryOutcome> {
        self.inner.core.borrow().outcome.clone()
    }

    /// The reply message, if the query succeeded.
    pub fn result_message(&self) -> Option<Message> {
        match &self.inner.core.borrow().outcome {
            Some(QueryOutcome::Success(msg)) => Some(msg.clone()),
            _ => None,
        }
    }

    /// The failure, if the query failed.
    pub fn error(&self) -> Option<TransportError> {
        match &self.inner.core.borrow().outcome {
            Some(QueryOutcome::Failure(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Call `callback` once when the query resolves.
    ///
    /// Subscribing after the completion was already delivered schedules the
    /// callback on the coordinator right away.
    pub fn on_completion(&self, callback: impl FnOnce(&OutgoingQuery) + 'static) {
        {
            let mut core = self.inner.core.borrow_mut();
            if !core.delivered {
                core.callbacks.push(Box::new(callback));
                return;
            }
        }
        let this = self.clone();
        self.inner.coordinator.post(move || callback(&this));
    }

    /// Future resolving to the query outcome.
    pub fn completion(&self) -> QueryCompletion {
        let (tx, rx) = oneshot::channel();
        self.on_completion(move |query| {
            if let Some(outcome) = query.outcome() {
                let _ = tx.send(outcome);
            }
        });
        QueryCompletion { rx }
    }

    /// Withdraw the query: tell the peer and resolve it as cancelled.
    ///
    /// A reply arriving afterwards is dropped.
    pub fn cancel(&self) -> Result<(), UsageError> {
        if !self.is_pending() {
            return Err(UsageError::AlreadyResolved { query: self.id() });
        }

        let channel = self.channel();
        if let Some(channel) = &channel {
            channel.forget_outgoing(self.id());
        }
        tracing::debug!(query = %self.id(), "outgoing query cancelled");
        // Resolved before the send, so a failing send closes the channel
        // after the completion is queued.
        self.resolve(QueryOutcome::Cancelled);
        if let Some(channel) = channel.filter(Channel::is_open) {
            channel.transmit(Frame::Cancel { id: self.id() });
        }
        Ok(())
    }

    /// Record the resolution and schedule completion delivery.
    ///
    /// Returns `false` if the query was already resolved.
    pub(crate) fn resolve(&self, outcome: QueryOutcome) -> bool {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.outcome.is_some() {
                return false;
            }
            core.outcome = Some(outcome);
        }

        let this = self.clone();
        self.inner.coordinator.post(move || this.deliver());
        true
    }

    fn deliver(&self) {
        let callbacks = {
            let mut core = self.inner.core.borrow_mut();
            core.delivered = true;
            std::mem::take(&mut core.callbacks)
        };
        for callback in callbacks {
            callback(self);
        }
    }
}

impl std::fmt::Debug for OutgoingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingQuery")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.request.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Future returned by [`OutgoingQuery::completion`].
///
/// Resolves to `Failure(ChannelClosed)` if the query is dropped by its channel
/// without ever being resolved.
pub struct QueryCompletion {
    rx: oneshot::Receiver<QueryOutcome>,
}

impl Future for QueryCompletion {
    type Output = QueryOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(QueryOutcome::Failure(TransportError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
