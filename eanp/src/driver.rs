//! Serialized command driver.
//!
//! The driver holds an ordered queue of command messages and sends them one at
//! a time on the channel a broker opens. Each command waits for its completion
//! before the next one is sent; there is never more than one in flight.
//!
//! ```text
//! channel open ──► dispatch_next ──► send_query ──► completion
//!                      ▲                                │
//!                      └──── Ok / Failure result ◄──────┤
//!                                                       ├─ transport error ──► Failed
//!                                                       └─ cancelled ────────► Cancelled
//! ```
//!
//! A failure-typed result is reported and the queue goes on. A transport
//! error or a cancellation abandons the rest of the queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use eanp_core::{CommandName, Message, MessageError, ProtocolFailure, ResultKind};

use crate::broker::Broker;
use crate::channel::{Channel, IncomingQuery, OutgoingQuery, QueryOutcome};
use crate::coordinator::Coordinator;
use crate::error::TransportError;
use crate::signal::Signal;

/// How one command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// The peer answered with a non-failure result.
    Completed(ResultKind),
    /// The peer answered with a failure result.
    Failure(ProtocolFailure),
    /// The peer answered with a failure result whose payload is not
    /// `[u32, string]`.
    MalformedFailure(MessageError),
    /// The connection failed before a result arrived.
    Aborted(TransportError),
    /// The query was cancelled locally.
    Cancelled,
}

/// Report emitted for every command that got a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    /// Type tag of the command message.
    pub command: u32,
    /// What happened to it.
    pub status: CommandStatus,
}

/// Terminal state of a driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Every queued command was sent and completed.
    Drained,
    /// A transport error aborted the run.
    Failed(TransportError),
    /// The in-flight command was cancelled, abandoning the run.
    Cancelled,
}

/// Sends queued commands one at a time and correlates each with its outcome.
///
/// Clones share the same driver.
#[derive(Clone)]
pub struct CommandDriver {
    inner: Rc<DriverInner>,
}

struct DriverInner {
    label: String,
    coordinator: Coordinator,
    core: RefCell<DriverCore>,
    on_report: Signal<CommandReport>,
    on_finished: Signal<DriverOutcome>,
}

#[derive(Default)]
struct DriverCore {
    queue: VecDeque<Message>,
    channel: Option<Channel>,
    in_flight: Option<OutgoingQuery>,
    outcome: Option<DriverOutcome>,
    halted: bool,
    reports: Vec<CommandReport>,
    sent: Vec<Message>,
}

impl CommandDriver {
    /// Create an idle driver. `label` tags its log lines.
    pub fn new(coordinator: Coordinator, label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(DriverInner {
                label: label.into(),
                coordinator,
                core: RefCell::new(DriverCore::default()),
                on_report: Signal::new(),
                on_finished: Signal::new(),
            }),
        }
    }

    /// Log label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Drive every channel `broker` opens.
    pub fn attach(&self, broker: &Broker) {
        let weak = self.downgrade();
        broker.on_channel_open(move |channel| {
            if let Some(driver) = upgrade(&weak) {
                driver.handle_channel_open(channel);
            }
        });
    }

    /// Append a command to the queue.
    ///
    /// A driver idling on an open channel after draining its queue sends it
    /// right away.
    pub fn enqueue(&self, message: Message) {
        let resume = {
            let mut core = self.inner.core.borrow_mut();
            core.queue.push_back(message);
            match &core.channel {
                Some(channel)
                    if !core.halted && core.in_flight.is_none() && channel.is_open() =>
                {
                    Some(channel.clone())
                }
                _ => None,
            }
        };

        if let Some(channel) = resume {
            self.inner.core.borrow_mut().outcome = None;
            self.dispatch_next(&channel);
        }
    }

    /// Take over a freshly opened channel: listen to it, then send the first
    /// queued command.
    pub fn handle_channel_open(&self, channel: &Channel) {
        tracing::info!(role = %self.label(), channel = %channel.id(), "Channel opened");
        if !channel.is_open() {
            return;
        }

        let weak = self.downgrade();
        channel.on_incoming_query(move |query| {
            if let Some(driver) = upgrade(&weak) {
                driver.handle_incoming_query(query);
            }
        });
        let label = self.inner.label.clone();
        channel.on_incoming_event(move |event| {
            tracing::info!(role = %label, kind = event.kind(), "Incoming event received");
        });
        let label = self.inner.label.clone();
        channel.on_close(move |channel| match channel.last_error() {
            Some(err) => tracing::info!(role = %label, channel = %channel.id(), "Channel closed: {err}"),
            None => tracing::info!(role = %label, channel = %channel.id(), "Channel closed: no error"),
        });

        let busy = {
            let mut core = self.inner.core.borrow_mut();
            core.channel = Some(channel.clone());
            core.in_flight.is_some()
        };
        if !busy {
            self.dispatch_next(channel);
        }
    }

    /// Send the head of the queue on `channel`, or report the run drained.
    ///
    /// A channel that refuses the query abandons the command without retry.
    pub fn dispatch_next(&self, channel: &Channel) {
        let next = {
            let mut core = self.inner.core.borrow_mut();
            if core.halted || core.in_flight.is_some() {
                return;
            }
            core.queue.pop_front()
        };

        let Some(command) = next else {
            tracing::info!(role = %self.label(), "All commands executed");
            self.finish(DriverOutcome::Drained);
            return;
        };

        let kind = command.kind();
        tracing::info!(role = %self.label(), "Running command {}", CommandName(kind));
        let query = match channel.send_query(command.clone()) {
            Ok(query) => query,
            Err(err) => {
                tracing::debug!(role = %self.label(), error = %err, "command abandoned");
                return;
            }
        };

        {
            let mut core = self.inner.core.borrow_mut();
            core.in_flight = Some(query.clone());
            core.sent.push(command);
        }
        let weak = self.downgrade();
        query.on_completion(move |query| {
            if let Some(driver) = upgrade(&weak) {
                driver.handle_completion(query);
            }
        });
    }

    /// Subscribe to per-command reports.
    pub fn on_report(&self, subscriber: impl Fn(&CommandReport) + 'static) {
        self.inner.on_report.subscribe(subscriber);
    }

    /// Subscribe to the driver reaching a terminal state. Fires every time the
    /// queue drains, and once when the run aborts.
    pub fn on_finished(&self, subscriber: impl Fn(&DriverOutcome) + 'static) {
        self.inner.on_finished.subscribe(subscriber);
    }

    /// Latest terminal state, `None` while commands are pending.
    pub fn outcome(&self) -> Option<DriverOutcome> {
        self.inner.core.borrow().outcome.clone()
    }

    /// Whether the driver is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.inner.core.borrow().outcome.is_some()
    }

    /// Reports so far, in completion order.
    pub fn reports(&self) -> Vec<CommandReport> {
        self.inner.core.borrow().reports.clone()
    }

    /// Commands sent so far, in send order.
    pub fn sent(&self) -> Vec<Message> {
        self.inner.core.borrow().sent.clone()
    }

    /// Commands still queued.
    pub fn queue_len(&self) -> usize {
        self.inner.core.borrow().queue.len()
    }

    /// The command awaiting its completion, if any.
    pub fn in_flight(&self) -> Option<OutgoingQuery> {
        self.inner.core.borrow().in_flight.clone()
    }

    fn downgrade(&self) -> Weak<DriverInner> {
        Rc::downgrade(&self.inner)
    }

    fn handle_completion(&self, query: &OutgoingQuery) {
        self.inner.core.borrow_mut().in_flight = None;
        let command = query.request().kind();

        match query.outcome() {
            Some(QueryOutcome::Failure(err)) => {
                tracing::warn!(role = %self.label(), "Command failed: {err}");
                self.report(command, CommandStatus::Aborted(err.clone()));
                self.finish(DriverOutcome::Failed(err));
            }
            Some(QueryOutcome::Cancelled) => {
                tracing::info!(role = %self.label(), "Command cancelled: {}", CommandName(command));
                self.report(command, CommandStatus::Cancelled);
                self.finish(DriverOutcome::Cancelled);
            }
            Some(QueryOutcome::Success(result)) => {
                let kind = ResultKind::from_code(result.kind());
                tracing::info!(role = %self.label(), "Command completed: result type is {kind}");

                let status = if kind == ResultKind::Failure {
                    match ProtocolFailure::from_message(&result) {
                        Ok(failure) => {
                            tracing::info!(role = %self.label(), "Failure type {}, message {}", failure.kind, failure.message);
                            CommandStatus::Failure(failure)
                        }
                        Err(err) => {
                            tracing::warn!(role = %self.label(), error = %err, "malformed failure result");
                            CommandStatus::MalformedFailure(err)
                        }
                    }
                } else {
                    CommandStatus::Completed(kind)
                };
                self.report(command, status);

                if let Some(channel) = query.channel() {
                    self.dispatch_next(&channel);
                }
            }
            None => {}
        }
    }

    fn handle_incoming_query(&self, query: &IncomingQuery) {
        tracing::info!(role = %self.label(), query = %query.id(), "Incoming query received");
        if !query.is_pending() {
            return;
        }

        let label = self.inner.label.clone();
        query.on_cancellation(move |query| {
            tracing::info!(role = %label, query = %query.id(), "Incoming query cancelled");
        });
        if let Err(err) = query.reply(ResultKind::Ok.message()) {
            tracing::debug!(role = %self.label(), error = %err, "reply not sent");
        }
    }

    fn report(&self, command: u32, status: CommandStatus) {
        let report = CommandReport { command, status };
        self.inner.core.borrow_mut().reports.push(report.clone());
        self.inner.on_report.emit(&self.inner.coordinator, report);
    }

    fn finish(&self, outcome: DriverOutcome) {
        {
            let mut core = self.inner.core.borrow_mut();
            core.halted = outcome != DriverOutcome::Drained;
            core.outcome = Some(outcome.clone());
        }
        self.inner.on_finished.emit(&self.inner.coordinator, outcome);
    }
}

fn upgrade(weak: &Weak<DriverInner>) -> Option<CommandDriver> {
    weak.upgrade().map(|inner| CommandDriver { inner })
}

impl std::fmt::Debug for CommandDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.borrow();
        f.debug_struct("CommandDriver")
            .field("label", &self.inner.label)
            .field("queued", &core.queue.len())
            .field("in_flight", &core.in_flight.is_some())
            .field("outcome", &core.outcome)
            .finish()
    }
}
