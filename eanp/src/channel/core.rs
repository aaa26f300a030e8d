//! Channel state machine and query bookkeeping.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use eanp_core::{ChannelId, Message, QueryId};

use super::incoming::IncomingQuery;
use super::outgoing::{OutgoingQuery, QueryOutcome};
use crate::coordinator::Coordinator;
use crate::error::{TransportError, UsageError};
use crate::signal::Signal;
use crate::transport::{Frame, Transport};

/// Lifecycle state of a channel.
///
/// ```text
/// Opening ──handshake──► Open ──stop / failure / peer close──► Closed
///    │                                                          ▲
///    └───────────────────── handshake failure ──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the transport handshake.
    Opening,
    /// Carrying queries and events.
    Open,
    /// Terminal. Nothing is sent or delivered any more.
    Closed,
}

type ClosedHook = Box<dyn FnOnce(ChannelId, Option<TransportError>)>;

/// A logical session with the peer. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    coordinator: Coordinator,
    transport: Rc<dyn Transport>,
    max_pending_queries: Option<usize>,
    core: RefCell<ChannelCore>,
    on_open: Signal<Channel>,
    on_close: Signal<Channel>,
    on_incoming_query: Signal<IncomingQuery>,
    on_incoming_event: Signal<Message>,
    closed_hook: RefCell<Option<ClosedHook>>,
}

struct ChannelCore {
    state: ChannelState,
    next_query: u64,
    pending_outgoing: BTreeMap<QueryId, OutgoingQuery>,
    pending_incoming: BTreeMap<QueryId, IncomingQuery>,
    last_error: Option<TransportError>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        coordinator: Coordinator,
        transport: Rc<dyn Transport>,
        max_pending_queries: Option<usize>,
    ) -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                id,
                coordinator,
                transport,
                max_pending_queries,
                core: RefCell::new(ChannelCore {
                    state: ChannelState::Opening,
                    next_query: 1,
                    pending_outgoing: BTreeMap::new(),
                    pending_incoming: BTreeMap::new(),
                    last_error: None,
                }),
                on_open: Signal::new(),
                on_close: Signal::new(),
                on_incoming_query: Signal::new(),
                on_incoming_event: Signal::new(),
                closed_hook: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// Channel id.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.core.borrow().state
    }

    /// Whether queries and events can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The error that closed the channel, if it closed because of one.
    pub fn last_error(&self) -> Option<TransportError> {
        self.inner.core.borrow().last_error.clone()
    }

    /// Outgoing queries still awaiting resolution.
    pub fn pending_outgoing(&self) -> usize {
        self.inner.core.borrow().pending_outgoing.len()
    }

    /// Incoming queries still awaiting a reply.
    pub fn pending_incoming(&self) -> usize {
        self.inner.core.borrow().pending_incoming.len()
    }

    /// Subscribe to the Opening → Open transition.
    pub fn on_open(&self, subscriber: impl Fn(&Channel) + 'static) {
        self.inner.on_open.subscribe(subscriber);
    }

    /// Subscribe to the transition to Closed. [`Channel::last_error`] holds the
    /// reason.
    pub fn on_close(&self, subscriber: impl Fn(&Channel) + 'static) {
        self.inner.on_close.subscribe(subscriber);
    }

    /// Subscribe to queries sent by the peer.
    pub fn on_incoming_query(&self, subscriber: impl Fn(&IncomingQuery) + 'static) {
        self.inner.on_incoming_query.subscribe(subscriber);
    }

    /// Subscribe to events sent by the peer.
    pub fn on_incoming_event(&self, subscriber: impl Fn(&Message) + 'static) {
        self.inner.on_incoming_event.subscribe(subscriber);
    }

    /// Send a query.
    ///
    /// A transport failure while sending closes the channel; the returned
    /// query then resolves with that failure.
    pub fn send_query(&self, message: Message) -> Result<OutgoingQuery, UsageError> {
        let query = {
            let mut core = self.inner.core.borrow_mut();
            if core.state != ChannelState::Open {
                return Err(UsageError::NotOpen { channel: self.id() });
            }
            if let Some(limit) = self.inner.max_pending_queries {
                if core.pending_outgoing.len() >= limit {
                    return Err(UsageError::TooManyPending {
                        channel: self.id(),
                        limit,
                    });
                }
            }

            let id = QueryId(core.next_query);
            core.next_query += 1;
            let query = OutgoingQuery::new(
                id,
                message.clone(),
                Rc::downgrade(&self.inner),
                self.inner.coordinator.clone(),
            );
            core.pending_outgoing.insert(id, query.clone());
            query
        };

        tracing::debug!(channel = %self.id(), query = %query.id(), kind = message.kind(), "sending query");
        self.transmit(Frame::Query {
            id: query.id(),
            message,
        });
        Ok(query)
    }

    /// Send a one-way event.
    pub fn send_event(&self, message: Message) -> Result<(), UsageError> {
        if !self.is_open() {
            return Err(UsageError::NotOpen { channel: self.id() });
        }
        tracing::debug!(channel = %self.id(), kind = message.kind(), "sending event");
        self.transmit(Frame::Event { message });
        Ok(())
    }

    /// Reply to a query received on this channel.
    ///
    /// A query that arrived on another channel is refused with
    /// [`UsageError::ForeignQuery`] and nothing is sent.
    pub fn reply(&self, query: &IncomingQuery, message: Message) -> Result<(), UsageError> {
        let ours = query
            .channel()
            .is_some_and(|owner| Rc::ptr_eq(&owner.inner, &self.inner));
        if !ours {
            return Err(UsageError::ForeignQuery {
                query: query.id(),
                channel: self.id(),
            });
        }
        query.reply(message)
    }

    /// Close the channel from this side.
    ///
    /// Pending outgoing queries fail with [`TransportError::ChannelClosed`],
    /// pending incoming queries are cancelled. Closing a closed channel does
    /// nothing.
    pub fn close(&self) {
        self.shut(None, true);
    }

    pub(crate) fn set_closed_hook(
        &self,
        hook: impl FnOnce(ChannelId, Option<TransportError>) + 'static,
    ) {
        *self.inner.closed_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Opening → Open. Returns `false` if the channel was not opening.
    pub(crate) fn mark_open(&self) -> bool {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.state != ChannelState::Opening {
                return false;
            }
            core.state = ChannelState::Open;
        }
        tracing::info!(channel = %self.id(), "channel open");
        self.inner.on_open.emit(&self.inner.coordinator, self.clone());
        true
    }

    /// Close because the transport said so. The transport already knows.
    pub(crate) fn close_by_transport(&self, error: Option<TransportError>) {
        self.shut(error, false);
    }

    /// Close because of a local failure. The transport is told.
    pub(crate) fn fail(&self, error: TransportError) {
        self.shut(Some(error), true);
    }

    pub(crate) fn handle_frame(&self, frame: Frame) {
        if !self.is_open() {
            tracing::debug!(channel = %self.id(), ?frame, "frame on inactive channel dropped");
            return;
        }

        match frame {
            Frame::Query { id, message } => {
                let query = IncomingQuery::new(
                    id,
                    message,
                    Rc::downgrade(&self.inner),
                    self.inner.coordinator.clone(),
                );
                let duplicate = {
                    let mut core = self.inner.core.borrow_mut();
                    if core.pending_incoming.contains_key(&id) {
                        true
                    } else {
                        core.pending_incoming.insert(id, query.clone());
                        false
                    }
                };
                if duplicate {
                    tracing::warn!(channel = %self.id(), query = %id, "duplicate incoming query dropped");
                    return;
                }
                self.inner
                    .on_incoming_query
                    .emit(&self.inner.coordinator, query);
            }
            Frame::Reply { id, message } => {
                let query = self.inner.core.borrow_mut().pending_outgoing.remove(&id);
                match query {
                    Some(query) => {
                        query.resolve(QueryOutcome::Success(message));
                    }
                    None => {
                        tracing::debug!(channel = %self.id(), query = %id, "reply for unknown query dropped")
                    }
                }
            }
            Frame::Cancel { id } => {
                let query = self.inner.core.borrow_mut().pending_incoming.remove(&id);
                match query {
                    Some(query) => {
                        tracing::debug!(channel = %self.id(), query = %id, "peer cancelled query");
                        query.cancel();
                    }
                    None => {
                        tracing::debug!(channel = %self.id(), query = %id, "cancel for unknown query dropped")
                    }
                }
            }
            Frame::Event { message } => {
                self.inner
                    .on_incoming_event
                    .emit(&self.inner.coordinator, message);
            }
        }
    }

    pub(crate) fn forget_outgoing(&self, id: QueryId) {
        self.inner.core.borrow_mut().pending_outgoing.remove(&id);
    }

    pub(crate) fn forget_incoming(&self, id: QueryId) {
        self.inner.core.borrow_mut().pending_incoming.remove(&id);
    }

    /// Hand a frame to the transport; a send failure closes the channel.
    pub(crate) fn transmit(&self, frame: Frame) {
        if let Err(err) = self.inner.transport.send(self.id(), frame) {
            tracing::warn!(channel = %self.id(), error = %err, "send failed");
            self.fail(err);
        }
    }

    fn shut(&self, error: Option<TransportError>, tell_transport: bool) {
        let (outgoing, incoming) = {
            let mut core = self.inner.core.borrow_mut();
            if core.state == ChannelState::Closed {
                return;
            }
            core.state = ChannelState::Closed;
            core.last_error = error.clone();
            (
                std::mem::take(&mut core.pending_outgoing),
                std::mem::take(&mut core.pending_incoming),
            )
        };

        if tell_transport {
            self.inner.transport.close(self.id());
        }

        // Queries resolve before the close notification is queued.
        let failure = error.clone().unwrap_or(TransportError::ChannelClosed);
        for query in outgoing.into_values() {
            query.resolve(QueryOutcome::Failure(failure.clone()));
        }
        for query in incoming.into_values() {
            query.cancel();
        }

        match &error {
            Some(err) => tracing::info!(channel = %self.id(), error = %err, "channel closed"),
            None => tracing::info!(channel = %self.id(), "channel closed"),
        }
        self.inner.on_close.emit(&self.inner.coordinator, self.clone());

        let hook = self.inner.closed_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook(self.id(), error);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
