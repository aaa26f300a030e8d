//! In-process transport pair with seeded fault injection.
//!
//! A [`LoopbackNetwork`] connects any number of client transports to one
//! server transport. Every frame is pushed through a [`JsonCodec`] round trip
//! before delivery, so both sides only ever see what survived serialization.
//!
//! With a non-zero [`LoopbackConfig::fault_probability`] each send may sever
//! its link instead of delivering. The decision comes from a
//! [`ChaCha8Rng`] seeded by [`LoopbackConfig::seed`], so a failing run can be
//! replayed from its seed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use eanp_core::{ChannelId, JsonCodec, MessageCodec};
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{Frame, Transport, TransportEvent};
use crate::coordinator::Inbox;
use crate::error::TransportError;

/// Configuration for a loopback network.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopbackConfig {
    /// Seed of the fault injection RNG
    pub seed: u64,

    /// Probability in `[0, 1]` that a send severs its link
    pub fault_probability: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::reliable()
    }
}

impl LoopbackConfig {
    /// Create a configuration; the probability is clamped to `[0, 1]`.
    pub fn new(seed: u64, fault_probability: f64) -> Self {
        Self {
            seed,
            fault_probability: clamp_probability(fault_probability),
        }
    }

    /// No faults.
    pub fn reliable() -> Self {
        Self {
            seed: 0,
            fault_probability: 0.0,
        }
    }

    /// Roughly one send in twenty severs its link.
    pub fn chaotic(seed: u64) -> Self {
        Self {
            seed,
            fault_probability: 0.05,
        }
    }

    /// Set the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the fault probability, clamped to `[0, 1]`.
    pub fn with_fault_probability(mut self, fault_probability: f64) -> Self {
        self.fault_probability = clamp_probability(fault_probability);
        self
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

/// The shared medium behind a set of loopback transports.
///
/// Clones share the same network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Rc<RefCell<NetworkState>>,
}

struct NetworkState {
    config: LoopbackConfig,
    rng: ChaCha8Rng,
    codec: JsonCodec,
    listener: Option<Inbox>,
    links: BTreeMap<ChannelId, Link>,
    next_channel: u64,
    next_transport: u64,
    frames_delivered: u64,
    faults_injected: u64,
}

struct Link {
    opener: u64,
    opener_inbox: Inbox,
    acceptor_inbox: Inbox,
}

impl Link {
    /// Inbox of the end opposite to `end`.
    fn peer_of(&self, end: End) -> &Inbox {
        match end {
            End::Opener(_) => &self.acceptor_inbox,
            End::Acceptor => &self.opener_inbox,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Opener(u64),
    Acceptor,
}

impl LoopbackNetwork {
    /// Create a network.
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetworkState {
                rng: ChaCha8Rng::seed_from_u64(config.seed),
                config,
                codec: JsonCodec,
                listener: None,
                links: BTreeMap::new(),
                next_channel: 1,
                next_transport: 1,
                frames_delivered: 0,
                faults_injected: 0,
            })),
        }
    }

    /// A transport that opens channels to the server side.
    pub fn client_transport(&self) -> LoopbackTransport {
        let mut state = self.state.borrow_mut();
        let id = state.next_transport;
        state.next_transport += 1;
        LoopbackTransport {
            network: self.clone(),
            end: End::Opener(id),
        }
    }

    /// The transport that accepts channels.
    pub fn server_transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            end: End::Acceptor,
        }
    }

    /// Network configuration.
    pub fn config(&self) -> LoopbackConfig {
        self.state.borrow().config.clone()
    }

    /// Frames delivered to a peer so far.
    pub fn frames_delivered(&self) -> u64 {
        self.state.borrow().frames_delivered
    }

    /// Links severed by fault injection so far.
    pub fn faults_injected(&self) -> u64 {
        self.state.borrow().faults_injected
    }

    /// Links currently connected.
    pub fn open_links(&self) -> usize {
        self.state.borrow().links.len()
    }
}

/// One end of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    end: End,
}

impl LoopbackTransport {
    /// The network this transport belongs to.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    fn owns(&self, link: &Link) -> bool {
        match self.end {
            End::Opener(id) => link.opener == id,
            End::Acceptor => true,
        }
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, inbox: Inbox) -> Result<ChannelId, TransportError> {
        let End::Opener(opener) = self.end else {
            return Err(TransportError::Io(
                "server loopback transport cannot open channels".to_string(),
            ));
        };

        let mut state = self.network.state.borrow_mut();
        let channel = ChannelId(state.next_channel);
        state.next_channel += 1;

        match state.listener.clone() {
            Some(acceptor_inbox) => {
                tracing::trace!(%channel, "loopback link up");
                acceptor_inbox.post(TransportEvent::Opened { channel });
                inbox.post(TransportEvent::Opened { channel });
                state.links.insert(
                    channel,
                    Link {
                        opener,
                        opener_inbox: inbox,
                        acceptor_inbox,
                    },
                );
            }
            None => {
                tracing::trace!(%channel, "no loopback listener");
                inbox.post(TransportEvent::Closed {
                    channel,
                    error: Some(TransportError::ConnectionRefused),
                });
            }
        }
        Ok(channel)
    }

    fn listen(&self, inbox: Inbox) -> Result<(), TransportError> {
        if self.end != End::Acceptor {
            return Err(TransportError::Io(
                "client loopback transport cannot listen".to_string(),
            ));
        }
        let mut state = self.network.state.borrow_mut();
        if state.listener.is_some() {
            return Err(TransportError::Io("address in use".to_string()));
        }
        state.listener = Some(inbox);
        Ok(())
    }

    fn send(&self, channel: ChannelId, frame: Frame) -> Result<(), TransportError> {
        let mut state = self.network.state.borrow_mut();
        if !state.links.contains_key(&channel) {
            return Err(TransportError::ChannelClosed);
        }

        let p = clamp_probability(state.config.fault_probability);
        if p > 0.0 && state.rng.random_bool(p) {
            state.faults_injected += 1;
            if let Some(link) = state.links.remove(&channel) {
                tracing::debug!(%channel, "loopback fault injected");
                let error = Some(TransportError::disconnected("injected fault"));
                link.opener_inbox.post(TransportEvent::Closed {
                    channel,
                    error: error.clone(),
                });
                link.acceptor_inbox.post(TransportEvent::Closed { channel, error });
            }
            return Ok(());
        }

        let bytes = state.codec.encode(&frame)?;
        let frame: Frame = state.codec.decode(&bytes)?;
        if let Some(link) = state.links.get(&channel) {
            link.peer_of(self.end)
                .post(TransportEvent::Frame { channel, frame });
        }
        state.frames_delivered += 1;
        Ok(())
    }

    fn close(&self, channel: ChannelId) {
        let link = self.network.state.borrow_mut().links.remove(&channel);
        if let Some(link) = link {
            link.peer_of(self.end).post(TransportEvent::Closed {
                channel,
                error: None,
            });
        }
    }

    fn shutdown(&self) {
        let mut state = self.network.state.borrow_mut();
        if self.end == End::Acceptor {
            state.listener = None;
        }

        let owned: Vec<ChannelId> = state
            .links
            .iter()
            .filter(|(_, link)| self.owns(link))
            .map(|(id, _)| *id)
            .collect();
        for channel in owned {
            if let Some(link) = state.links.remove(&channel) {
                link.peer_of(self.end).post(TransportEvent::Closed {
                    channel,
                    error: Some(TransportError::disconnected("peer shut down")),
                });
            }
        }
    }
}
