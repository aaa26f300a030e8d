//! Broker lifecycle and transport event routing.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use eanp_core::{ChannelId, EndpointId};

use super::config::BrokerConfig;
use crate::channel::Channel;
use crate::coordinator::Coordinator;
use crate::error::{TransportError, UsageError};
use crate::signal::Signal;
use crate::transport::{Transport, TransportEvent};

/// Which side of the connection a broker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    /// Opens exactly one outbound channel on start.
    Client,
    /// Accepts inbound channels until stopped.
    Server,
}

impl std::fmt::Display for BrokerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerRole::Client => f.write_str("client"),
            BrokerRole::Server => f.write_str("server"),
        }
    }
}

/// Lifecycle state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, not started.
    Idle,
    /// Started and routing transport events.
    Running,
    /// Stopped on its own after losing its connection; waiting for
    /// [`Broker::try_stop`].
    Halted,
    /// Terminal.
    Stopped,
}

/// Owner of the channels of one endpoint.
///
/// Clones share the same broker. Channels keep only a weak reference to it.
#[derive(Clone)]
pub struct Broker {
    inner: Rc<BrokerInner>,
}

/// Weak handle to a [`Broker`], for callbacks that must not keep it alive.
#[derive(Clone)]
pub struct WeakBroker {
    inner: Weak<BrokerInner>,
}

impl WeakBroker {
    /// The broker, if it still exists.
    pub fn upgrade(&self) -> Option<Broker> {
        self.inner.upgrade().map(|inner| Broker { inner })
    }
}

struct BrokerInner {
    role: BrokerRole,
    config: BrokerConfig,
    coordinator: Coordinator,
    transport: Rc<dyn Transport>,
    core: RefCell<BrokerCore>,
    on_channel_open: Signal<Channel>,
    on_close: Signal<Option<TransportError>>,
}

struct BrokerCore {
    state: BrokerState,
    endpoint: Option<EndpointId>,
    channels: BTreeMap<ChannelId, Channel>,
    halt_error: Option<TransportError>,
}

impl Broker {
    /// Create a broker. Nothing happens until [`Broker::start`].
    pub fn new(
        coordinator: Coordinator,
        role: BrokerRole,
        transport: Rc<dyn Transport>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            inner: Rc::new(BrokerInner {
                role,
                config,
                coordinator,
                transport,
                core: RefCell::new(BrokerCore {
                    state: BrokerState::Idle,
                    endpoint: None,
                    channels: BTreeMap::new(),
                    halt_error: None,
                }),
                on_channel_open: Signal::new(),
                on_close: Signal::new(),
            }),
        }
    }

    /// Create a client broker.
    pub fn client(
        coordinator: Coordinator,
        transport: Rc<dyn Transport>,
        config: BrokerConfig,
    ) -> Self {
        Self::new(coordinator, BrokerRole::Client, transport, config)
    }

    /// Create a server broker.
    pub fn server(
        coordinator: Coordinator,
        transport: Rc<dyn Transport>,
        config: BrokerConfig,
    ) -> Self {
        Self::new(coordinator, BrokerRole::Server, transport, config)
    }

    /// Weak handle to this broker.
    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Broker role.
    pub fn role(&self) -> BrokerRole {
        self.inner.role
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        self.inner.core.borrow().state
    }

    /// Whether the broker is started and routing events.
    pub fn is_running(&self) -> bool {
        self.state() == BrokerState::Running
    }

    /// The error that halted the broker, if any.
    pub fn halt_error(&self) -> Option<TransportError> {
        self.inner.core.borrow().halt_error.clone()
    }

    /// Channels currently owned, in id order.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.core.borrow().channels.values().cloned().collect()
    }

    /// Look up an owned channel.
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.inner.core.borrow().channels.get(&id).cloned()
    }

    /// Subscribe to channels reaching Open.
    pub fn on_channel_open(&self, subscriber: impl Fn(&Channel) + 'static) {
        self.inner.on_channel_open.subscribe(subscriber);
    }

    /// Subscribe to the broker stopping or halting.
    ///
    /// Fires once, after the close notifications of every owned channel. The
    /// argument is the error that halted the broker, `None` for a requested
    /// stop or a clean close of the client channel.
    pub fn on_close(&self, subscriber: impl Fn(Option<&TransportError>) + 'static) {
        self.inner
            .on_close
            .subscribe(move |error: &Option<TransportError>| subscriber(error.as_ref()));
    }

    /// Start the broker: a client opens its channel, a server starts
    /// listening.
    ///
    /// A transport refusing the request halts the broker; the failure is
    /// reported through [`Broker::on_close`].
    pub fn start(&self) -> Result<(), UsageError> {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.state != BrokerState::Idle {
                return Err(UsageError::AlreadyStarted);
            }
            core.state = BrokerState::Running;
        }

        let weak = self.downgrade();
        let inbox = self.inner.coordinator.register(move |event| {
            if let Some(broker) = weak.upgrade() {
                broker.handle_event(event);
            }
        });
        self.inner.core.borrow_mut().endpoint = Some(inbox.endpoint());
        tracing::info!(broker = %self.inner.config.name, role = %self.inner.role, endpoint = %inbox.endpoint(), "broker started");

        match self.inner.role {
            BrokerRole::Client => match self.inner.transport.open(inbox) {
                Ok(id) => {
                    let channel = self.adopt(id);
                    tracing::debug!(broker = %self.inner.config.name, channel = %channel.id(), "opening channel");
                }
                Err(err) => {
                    tracing::warn!(broker = %self.inner.config.name, error = %err, "open failed");
                    self.halt(Some(err));
                }
            },
            BrokerRole::Server => {
                if let Err(err) = self.inner.transport.listen(inbox) {
                    tracing::warn!(broker = %self.inner.config.name, error = %err, "listen failed");
                    self.halt(Some(err));
                }
            }
        }
        Ok(())
    }

    /// Stop the broker, closing every owned channel.
    ///
    /// Returns `true` if the broker was running or halted and is now stopped,
    /// `false` if it was never started or was already stopped. Safe to call
    /// from the broker's own close notification.
    pub fn try_stop(&self) -> bool {
        let previous = {
            let mut core = self.inner.core.borrow_mut();
            let previous = core.state;
            match previous {
                BrokerState::Idle | BrokerState::Stopped => return false,
                BrokerState::Running | BrokerState::Halted => core.state = BrokerState::Stopped,
            }
            previous
        };

        if previous == BrokerState::Halted {
            tracing::debug!(broker = %self.inner.config.name, "halted broker stopped");
            return true;
        }

        self.close_channels(TransportError::BrokerStopped);
        self.release();
        tracing::info!(broker = %self.inner.config.name, "broker stopped");
        self.inner.on_close.emit(&self.inner.coordinator, None);
        true
    }

    fn handle_event(&self, event: TransportEvent) {
        if !self.is_running() {
            tracing::debug!(broker = %self.inner.config.name, ?event, "event after stop dropped");
            return;
        }

        match event {
            TransportEvent::Opened { channel } => self.channel_opened(channel),
            TransportEvent::Frame { channel, frame } => match self.channel(channel) {
                Some(ch) => ch.handle_frame(frame),
                None => {
                    tracing::debug!(broker = %self.inner.config.name, %channel, "frame for unknown channel dropped")
                }
            },
            TransportEvent::Closed { channel, error } => match self.channel(channel) {
                Some(ch) => ch.close_by_transport(error),
                None => {
                    tracing::debug!(broker = %self.inner.config.name, %channel, "close for unknown channel dropped")
                }
            },
            TransportEvent::Failed { error } => {
                tracing::warn!(broker = %self.inner.config.name, error = %error, "transport failed");
                self.halt(Some(error));
            }
        }
    }

    fn channel_opened(&self, id: ChannelId) {
        let channel = match (self.channel(id), self.inner.role) {
            (Some(channel), _) => channel,
            (None, BrokerRole::Server) => {
                let count = self.inner.core.borrow().channels.len();
                if let Some(limit) = self.inner.config.max_channels {
                    if count >= limit {
                        tracing::warn!(broker = %self.inner.config.name, channel = %id, limit, "channel limit reached, refusing");
                        self.inner.transport.close(id);
                        return;
                    }
                }
                self.adopt(id)
            }
            (None, BrokerRole::Client) => {
                tracing::warn!(broker = %self.inner.config.name, channel = %id, "unexpected inbound channel refused");
                self.inner.transport.close(id);
                return;
            }
        };

        if channel.mark_open() {
            self.inner
                .on_channel_open
                .emit(&self.inner.coordinator, channel);
        }
    }

    /// Create and own a channel in the Opening state.
    fn adopt(&self, id: ChannelId) -> Channel {
        let channel = Channel::new(
            id,
            self.inner.coordinator.clone(),
            self.inner.transport.clone(),
            self.inner.config.max_pending_queries,
        );
        let weak = self.downgrade();
        channel.set_closed_hook(move |id, error| {
            if let Some(broker) = weak.upgrade() {
                broker.channel_closed(id, error);
            }
        });
        self.inner
            .core
            .borrow_mut()
            .channels
            .insert(id, channel.clone());
        channel
    }

    fn channel_closed(&self, id: ChannelId, error: Option<TransportError>) {
        let state = {
            let mut core = self.inner.core.borrow_mut();
            core.channels.remove(&id);
            core.state
        };

        if self.inner.role == BrokerRole::Client && state == BrokerState::Running {
            self.halt(error);
        }
    }

    /// Stop on our own: close everything, then report through `on_close`.
    fn halt(&self, error: Option<TransportError>) {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.state != BrokerState::Running {
                return;
            }
            core.state = BrokerState::Halted;
            core.halt_error = error.clone();
        }

        self.close_channels(error.clone().unwrap_or(TransportError::BrokerStopped));
        self.release();
        match &error {
            Some(err) => tracing::info!(broker = %self.inner.config.name, error = %err, "broker halted"),
            None => tracing::info!(broker = %self.inner.config.name, "broker halted"),
        }
        self.inner.on_close.emit(&self.inner.coordinator, error);
    }

    fn close_channels(&self, error: TransportError) {
        let channels = std::mem::take(&mut self.inner.core.borrow_mut().channels);
        for channel in channels.into_values() {
            channel.fail(error.clone());
        }
    }

    fn release(&self) {
        let endpoint = self.inner.core.borrow_mut().endpoint.take();
        if let Some(endpoint) = endpoint {
            self.inner.coordinator.unregister(endpoint);
        }
        self.inner.transport.shutdown();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.borrow();
        f.debug_struct("Broker")
            .field("name", &self.inner.config.name)
            .field("role", &self.inner.role)
            .field("state", &core.state)
            .field("channels", &core.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::transport::RecordingTransport;

    fn client(coordinator: &Coordinator, transport: &RecordingTransport) -> Broker {
        Broker::client(
            coordinator.clone(),
            Rc::new(transport.clone()),
            BrokerConfig::client(),
        )
    }

    #[test]
    fn test_start_twice() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);

        assert_eq!(broker.start(), Ok(()));
        assert_eq!(broker.start(), Err(UsageError::AlreadyStarted));
    }

    #[test]
    fn test_try_stop_lifecycle() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);

        assert!(!broker.try_stop());
        broker.start().expect("start");
        assert!(broker.try_stop());
        assert!(!broker.try_stop());
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(transport.is_shut_down());
    }

    #[test]
    fn test_client_channel_opens() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);
        let opened = Rc::new(Cell::new(0));

        let o = opened.clone();
        broker.on_channel_open(move |ch| {
            assert!(ch.is_open());
            o.set(o.get() + 1);
        });
        broker.start().expect("start");
        coordinator.run_pending();

        assert_eq!(opened.get(), 1);
        assert_eq!(broker.channels().len(), 1);
    }

    #[test]
    fn test_client_halts_when_its_channel_drops() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);
        let closes = Rc::new(RefCell::new(Vec::new()));

        let c = closes.clone();
        broker.on_close(move |err| c.borrow_mut().push(err.cloned()));
        broker.start().expect("start");
        coordinator.run_pending();

        let channel = broker.channels()[0].id();
        transport.disconnect(channel, TransportError::disconnected("reset"));
        coordinator.run_pending();

        assert_eq!(broker.state(), BrokerState::Halted);
        assert_eq!(
            *closes.borrow(),
            vec![Some(TransportError::disconnected("reset"))]
        );

        assert!(broker.try_stop());
        coordinator.run_pending();
        assert_eq!(closes.borrow().len(), 1);
    }

    #[test]
    fn test_try_stop_from_close_notification() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);
        let stopped = Rc::new(Cell::new(None));

        let weak = broker.downgrade();
        let s = stopped.clone();
        broker.on_close(move |_| {
            if let Some(b) = weak.upgrade() {
                s.set(Some(b.try_stop()));
            }
        });
        broker.start().expect("start");
        coordinator.run_pending();
        transport.disconnect(broker.channels()[0].id(), TransportError::ChannelClosed);
        coordinator.run_pending();

        assert_eq!(stopped.get(), Some(true));
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[test]
    fn test_channel_close_notifications_precede_broker_close() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = client(&coordinator, &transport);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        broker.on_channel_open(move |ch| {
            let l = l.clone();
            ch.on_close(move |_| l.borrow_mut().push("channel"));
        });
        let l = log.clone();
        broker.on_close(move |_| l.borrow_mut().push("broker"));
        broker.start().expect("start");
        coordinator.run_pending();

        broker.try_stop();
        coordinator.run_pending();

        assert_eq!(*log.borrow(), vec!["channel", "broker"]);
    }

    #[test]
    fn test_refused_open_halts_client() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        transport.fail_opens(TransportError::ConnectionRefused);
        let broker = client(&coordinator, &transport);
        let closed = Rc::new(RefCell::new(None));

        let c = closed.clone();
        broker.on_close(move |err| *c.borrow_mut() = Some(err.cloned()));
        broker.start().expect("start");
        coordinator.run_pending();

        assert_eq!(broker.state(), BrokerState::Halted);
        assert_eq!(
            *closed.borrow(),
            Some(Some(TransportError::ConnectionRefused))
        );
    }

    #[test]
    fn test_server_respects_channel_limit() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = Broker::server(
            coordinator.clone(),
            Rc::new(transport.clone()),
            BrokerConfig::server().with_max_channels(1),
        );
        broker.start().expect("start");

        transport.open_channel(ChannelId(10));
        transport.open_channel(ChannelId(11));
        coordinator.run_pending();

        assert_eq!(broker.channels().len(), 1);
        assert_eq!(transport.closed(), vec![ChannelId(11)]);
    }

    #[test]
    fn test_server_survives_channel_close() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = Broker::server(
            coordinator.clone(),
            Rc::new(transport.clone()),
            BrokerConfig::server(),
        );
        broker.start().expect("start");

        transport.open_channel(ChannelId(10));
        coordinator.run_pending();
        transport.disconnect(ChannelId(10), TransportError::disconnected("bye"));
        coordinator.run_pending();

        assert!(broker.is_running());
        assert!(broker.channels().is_empty());
    }

    #[test]
    fn test_transport_failure_halts_server() {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = Broker::server(
            coordinator.clone(),
            Rc::new(transport.clone()),
            BrokerConfig::server(),
        );
        broker.start().expect("start");
        transport.open_channel(ChannelId(3));
        coordinator.run_pending();
        let channel = broker.channel(ChannelId(3)).expect("adopted");

        transport.fail(TransportError::Io("listener died".into()));
        coordinator.run_pending();

        assert_eq!(broker.state(), BrokerState::Halted);
        assert!(!channel.is_open());
        assert_eq!(
            channel.last_error(),
            Some(TransportError::Io("listener died".into()))
        );
    }
}
