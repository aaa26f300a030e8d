//! Driver and channel guarantees, checked against a scripted peer.
//!
//! The peer is a [`RecordingTransport`]: the test decides when and how each
//! query is answered, then drains the coordinator and looks at what was sent.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use eanp::{
    Broker, BrokerConfig, Channel, ChannelId, Command, CommandDriver, CommandReport, CommandStatus,
    Coordinator, DriverOutcome, FailureKind, Frame, IncomingQuery, IncomingState, Message,
    ProtocolFailure, QueryId, RecordingTransport, ResultKind, TransportError, UsageError,
};

struct Harness {
    coordinator: Coordinator,
    transport: RecordingTransport,
    broker: Broker,
    driver: CommandDriver,
}

impl Harness {
    fn start(commands: &[Message]) -> Self {
        let coordinator = Coordinator::new();
        let transport = RecordingTransport::new();
        let broker = Broker::client(
            coordinator.clone(),
            Rc::new(transport.clone()),
            BrokerConfig::client(),
        );
        let driver = CommandDriver::new(coordinator.clone(), "client");
        driver.attach(&broker);
        for command in commands {
            driver.enqueue(command.clone());
        }
        broker.start().expect("broker should start");
        coordinator.run_pending();

        Self {
            coordinator,
            transport,
            broker,
            driver,
        }
    }

    fn channel(&self) -> Channel {
        self.broker.channels()[0].clone()
    }

    fn channel_id(&self) -> ChannelId {
        ChannelId(1)
    }

    fn sent_kinds(&self) -> Vec<u32> {
        self.transport
            .sent_queries()
            .iter()
            .map(|(_, m)| m.kind())
            .collect()
    }

    fn answer_last(&self, result: Message) {
        let (id, _) = self
            .transport
            .sent_queries()
            .last()
            .cloned()
            .expect("a query is in flight");
        self.transport.reply(self.channel_id(), id, result);
        self.coordinator.run_pending();
    }
}

fn commands(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| Command::ALL[i % Command::ALL.len()].message().with(i as u32))
        .collect()
}

#[test]
fn test_n_successes_send_n_queries_in_order() {
    for n in 0..8 {
        let queue = commands(n);
        let harness = Harness::start(&queue);

        for sent in 1..=n {
            // One query on the wire at a time.
            assert_eq!(harness.transport.sent_queries().len(), sent);
            assert_eq!(harness.driver.outcome(), None);
            harness.answer_last(ResultKind::Ok.message());
        }

        let sent: Vec<Message> = harness
            .transport
            .sent_queries()
            .into_iter()
            .map(|(_, m)| m)
            .collect();
        assert_eq!(sent, queue);
        assert_eq!(harness.driver.outcome(), Some(DriverOutcome::Drained));
        assert_eq!(harness.driver.reports().len(), n);
    }
}

#[test]
fn test_kth_transport_error_stops_sending() {
    let n = 5;
    for k in 1..=n {
        let harness = Harness::start(&commands(n));
        for _ in 1..k {
            harness.answer_last(ResultKind::Ok.message());
        }

        harness
            .transport
            .disconnect(harness.channel_id(), TransportError::disconnected("link down"));
        harness.coordinator.run_pending();

        assert_eq!(harness.transport.sent_queries().len(), k);
        assert_eq!(
            harness.driver.outcome(),
            Some(DriverOutcome::Failed(TransportError::disconnected(
                "link down"
            )))
        );
        assert_eq!(harness.driver.queue_len(), n - k);

        // More work after the failure goes nowhere.
        harness.driver.enqueue(Command::ChatPostMsg.message());
        harness.coordinator.run_pending();
        assert_eq!(harness.transport.sent_queries().len(), k);
    }
}

#[test]
fn test_kth_failure_result_is_reported_verbatim_and_next_is_sent() {
    let n = 4;
    for k in 1..n {
        let harness = Harness::start(&commands(n));
        for _ in 1..k {
            harness.answer_last(ResultKind::Ok.message());
        }

        let failure = ProtocolFailure::new(FailureKind::Unknown(4711), "quota exceeded");
        harness.answer_last(failure.to_message());

        assert_eq!(harness.transport.sent_queries().len(), k + 1);
        assert_eq!(
            harness.driver.reports()[k - 1].status,
            CommandStatus::Failure(failure)
        );
    }
}

#[test]
fn test_scenario_a_then_b() {
    let a = Command::CreateKws.message().with("A");
    let b = Command::ExportKws.message().with("B");
    let harness = Harness::start(&[a.clone(), b.clone()]);

    let finished = Rc::new(RefCell::new(Vec::new()));
    let f = finished.clone();
    harness
        .driver
        .on_finished(move |outcome| f.borrow_mut().push(outcome.clone()));

    assert_eq!(harness.sent_kinds(), vec![a.kind()]);
    harness.answer_last(ResultKind::Ok.message());

    let sent = harness.transport.sent_queries();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1, b);
    assert!(finished.borrow().is_empty());

    harness.answer_last(ResultKind::Ok.message());
    assert_eq!(*finished.borrow(), vec![DriverOutcome::Drained]);
    assert_eq!(harness.transport.sent_queries().len(), 2);
}

#[test]
fn test_scenario_never_answered_then_disconnect() {
    let harness = Harness::start(&[Command::ImportKws.message().with("creds")]);
    let reports = Rc::new(RefCell::new(Vec::<CommandReport>::new()));
    let r = reports.clone();
    harness
        .driver
        .on_report(move |report| r.borrow_mut().push(report.clone()));

    harness
        .transport
        .disconnect(harness.channel_id(), TransportError::ConnectionRefused);
    harness.coordinator.run_pending();
    harness.coordinator.run_pending();

    assert_eq!(
        *reports.borrow(),
        vec![CommandReport {
            command: Command::ImportKws.code(),
            status: CommandStatus::Aborted(TransportError::ConnectionRefused),
        }]
    );
    assert_eq!(harness.transport.sent().len(), 1);
}

#[test]
fn test_scenario_cancel_before_handler() {
    let harness = Harness::start(&[]);
    let seen = Rc::new(RefCell::new(Vec::<IncomingQuery>::new()));
    let s = seen.clone();
    harness
        .channel()
        .on_incoming_query(move |q| s.borrow_mut().push(q.clone()));

    // Both frames are routed before any notification runs.
    harness
        .transport
        .peer_query(harness.channel_id(), QueryId(5), Command::SetKwsTask.message());
    harness.transport.cancel(harness.channel_id(), QueryId(5));
    harness.coordinator.run_pending();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].state(), IncomingState::Cancelled);
    assert!(
        !harness
            .transport
            .sent()
            .iter()
            .any(|(_, f)| matches!(f, Frame::Reply { .. }))
    );
}

#[test]
fn test_no_notifications_after_close() {
    let harness = Harness::start(&[Command::CreateKws.message()]);
    let channel = harness.channel();
    let closed = Rc::new(Cell::new(false));
    let late = Rc::new(Cell::new(0));

    let c = closed.clone();
    channel.on_close(move |_| c.set(true));
    let (c, l) = (closed.clone(), late.clone());
    channel.on_incoming_query(move |_| {
        if c.get() {
            l.set(l.get() + 1);
        }
    });
    let (c, l) = (closed.clone(), late.clone());
    channel.on_incoming_event(move |_| {
        if c.get() {
            l.set(l.get() + 1);
        }
    });
    let in_flight = harness.driver.in_flight().expect("command in flight");
    let (c, l) = (closed.clone(), late.clone());
    in_flight.on_completion(move |_| {
        if c.get() {
            l.set(l.get() + 1);
        }
    });

    let id = harness.channel_id();
    harness
        .transport
        .disconnect(id, TransportError::disconnected("eof"));
    harness.transport.reply(id, in_flight.id(), ResultKind::Ok.message());
    harness.transport.peer_query(id, QueryId(1), Message::new(1));
    harness.transport.peer_event(id, Message::new(2));
    harness.coordinator.run_pending();

    assert!(closed.get());
    assert_eq!(late.get(), 0);
}

#[test]
fn test_pending_incoming_cancelled_on_close() {
    let harness = Harness::start(&[]);
    let channel = harness.channel();
    let held = Rc::new(RefCell::new(Vec::new()));
    let cancellations = Rc::new(Cell::new(0));

    // A handler that keeps queries without answering them.
    let (h, c) = (held.clone(), cancellations.clone());
    channel.on_incoming_query(move |q| {
        let c = c.clone();
        q.on_cancellation(move |_| c.set(c.get() + 1));
        h.borrow_mut().push(q.clone());
    });

    // Closing in the same turn leaves both unanswered.
    let id = harness.channel_id();
    harness.transport.peer_query(id, QueryId(10), Message::new(1));
    harness.transport.peer_query(id, QueryId(11), Message::new(1));
    harness.transport.disconnect(id, TransportError::ChannelClosed);
    harness.coordinator.run_pending();

    for q in held.borrow().iter() {
        assert_eq!(q.state(), IncomingState::Cancelled);
    }
    assert_eq!(held.borrow().len(), 2);
    assert_eq!(cancellations.get(), 2);
}

#[test]
fn test_reply_on_resolved_query_has_no_side_effect() {
    let harness = Harness::start(&[]);
    let held = Rc::new(RefCell::new(None::<IncomingQuery>));
    let h = held.clone();
    harness
        .channel()
        .on_incoming_query(move |q| *h.borrow_mut() = Some(q.clone()));

    harness
        .transport
        .peer_query(harness.channel_id(), QueryId(3), Message::new(7));
    harness.coordinator.run_pending();

    let query = held.borrow().clone().expect("query delivered");
    // The driver's handler already replied.
    assert_eq!(query.state(), IncomingState::Replied);
    let frames_before = harness.transport.sent().len();

    assert_eq!(
        query.reply(ResultKind::Ok.message()),
        Err(UsageError::AlreadyResolved { query: QueryId(3) })
    );
    assert_eq!(
        harness.channel().reply(&query, ResultKind::Ok.message()),
        Err(UsageError::AlreadyResolved { query: QueryId(3) })
    );
    assert_eq!(harness.transport.sent().len(), frames_before);
    assert_eq!(query.state(), IncomingState::Replied);
}

#[test]
fn test_incoming_events_change_nothing() {
    let harness = Harness::start(&[Command::CreateKws.message()]);
    harness
        .transport
        .peer_event(harness.channel_id(), Message::new(300).with("status"));
    harness.coordinator.run_pending();

    assert_eq!(harness.transport.sent_queries().len(), 1);
    assert_eq!(harness.driver.outcome(), None);
    assert!(harness.driver.in_flight().is_some());
}
