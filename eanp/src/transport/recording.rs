//! Test double that records outbound frames and plays the peer.

use std::cell::RefCell;
use std::rc::Rc;

use eanp_core::{ChannelId, Message, QueryId};

use super::{Frame, Transport, TransportEvent};
use crate::coordinator::Inbox;
use crate::error::TransportError;

/// A [`Transport`] that sends nothing anywhere.
///
/// Outbound frames are recorded for inspection; the helpers inject the events
/// a real peer would cause. Channels opened by a client are announced as
/// `Opened` immediately unless auto-open is turned off.
///
/// Clones share the same recording.
#[derive(Clone)]
pub struct RecordingTransport {
    state: Rc<RefCell<RecordingState>>,
}

struct RecordingState {
    inbox: Option<Inbox>,
    auto_open: bool,
    next_channel: u64,
    open_error: Option<TransportError>,
    send_error: Option<TransportError>,
    sent: Vec<(ChannelId, Frame)>,
    closed: Vec<ChannelId>,
    shut_down: bool,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// A transport with auto-open on and no injected errors.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RecordingState {
                inbox: None,
                auto_open: true,
                next_channel: 1,
                open_error: None,
                send_error: None,
                sent: Vec::new(),
                closed: Vec::new(),
                shut_down: false,
            })),
        }
    }

    /// Whether `open` announces the channel as opened right away.
    pub fn set_auto_open(&self, auto_open: bool) {
        self.state.borrow_mut().auto_open = auto_open;
    }

    /// Make every later `open` fail with `error`.
    pub fn fail_opens(&self, error: TransportError) {
        self.state.borrow_mut().open_error = Some(error);
    }

    /// Make every later `send` fail with `error`.
    pub fn fail_sends(&self, error: TransportError) {
        self.state.borrow_mut().send_error = Some(error);
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<(ChannelId, Frame)> {
        self.state.borrow().sent.clone()
    }

    /// Queries sent so far, in order.
    pub fn sent_queries(&self) -> Vec<(QueryId, Message)> {
        self.state
            .borrow()
            .sent
            .iter()
            .filter_map(|(_, frame)| match frame {
                Frame::Query { id, message } => Some((*id, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Channels closed from the local side.
    pub fn closed(&self) -> Vec<ChannelId> {
        self.state.borrow().closed.clone()
    }

    /// Whether `shutdown` was called.
    pub fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    /// Deliver an arbitrary event to the endpoint using this transport.
    ///
    /// Returns `false` if no endpoint opened or listened yet, or if the
    /// coordinator is gone.
    pub fn inject(&self, event: TransportEvent) -> bool {
        let inbox = self.state.borrow().inbox.clone();
        match inbox {
            Some(inbox) => inbox.post(event),
            None => false,
        }
    }

    /// Announce a channel as opened, the way a listener announces a new peer.
    pub fn open_channel(&self, channel: ChannelId) -> bool {
        self.inject(TransportEvent::Opened { channel })
    }

    /// The peer answers one of our queries.
    pub fn reply(&self, channel: ChannelId, id: QueryId, message: Message) -> bool {
        self.inject(TransportEvent::Frame {
            channel,
            frame: Frame::Reply { id, message },
        })
    }

    /// The peer sends a query.
    pub fn peer_query(&self, channel: ChannelId, id: QueryId, message: Message) -> bool {
        self.inject(TransportEvent::Frame {
            channel,
            frame: Frame::Query { id, message },
        })
    }

    /// The peer withdraws one of its queries.
    pub fn cancel(&self, channel: ChannelId, id: QueryId) -> bool {
        self.inject(TransportEvent::Frame {
            channel,
            frame: Frame::Cancel { id },
        })
    }

    /// The peer sends an event.
    pub fn peer_event(&self, channel: ChannelId, message: Message) -> bool {
        self.inject(TransportEvent::Frame {
            channel,
            frame: Frame::Event { message },
        })
    }

    /// The connection of `channel` drops with `error`.
    pub fn disconnect(&self, channel: ChannelId, error: TransportError) -> bool {
        self.inject(TransportEvent::Closed {
            channel,
            error: Some(error),
        })
    }

    /// The peer closes `channel` cleanly.
    pub fn peer_close(&self, channel: ChannelId) -> bool {
        self.inject(TransportEvent::Closed {
            channel,
            error: None,
        })
    }

    /// The transport itself fails.
    pub fn fail(&self, error: TransportError) -> bool {
        self.inject(TransportEvent::Failed { error })
    }
}

impl Transport for RecordingTransport {
    fn open(&self, inbox: Inbox) -> Result<ChannelId, TransportError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = &state.open_error {
            return Err(err.clone());
        }

        let channel = ChannelId(state.next_channel);
        state.next_channel += 1;
        if state.auto_open {
            inbox.post(TransportEvent::Opened { channel });
        }
        state.inbox = Some(inbox);
        Ok(channel)
    }

    fn listen(&self, inbox: Inbox) -> Result<(), TransportError> {
        self.state.borrow_mut().inbox = Some(inbox);
        Ok(())
    }

    fn send(&self, channel: ChannelId, frame: Frame) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = &state.send_error {
            return Err(err.clone());
        }
        state.sent.push((channel, frame));
        Ok(())
    }

    fn close(&self, channel: ChannelId) {
        self.state.borrow_mut().closed.push(channel);
    }

    fn shutdown(&self) {
        self.state.borrow_mut().shut_down = true;
    }
}
