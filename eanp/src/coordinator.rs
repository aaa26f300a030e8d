//! Single coordination context for every protocol-visible state transition.
//!
//! The [`Coordinator`] owns two FIFOs:
//!
//! - an **inbox** of transport events, fed through [`Inbox`] handles that are
//!   `Send` so transports running on I/O threads can marshal into the context;
//! - a **task queue** of notification deliveries posted by channels, queries
//!   and brokers.
//!
//! Notifications are never invoked from inside the operation that raised them.
//! They are queued and run one after the other by [`Coordinator::run_pending`]
//! (or the async [`Coordinator::run_until`]), which is what makes channel,
//! broker and driver state safe to keep in `Rc<RefCell<_>>` without locks.
//!
//! # Ordering
//!
//! Each turn first routes every transport event already sitting in the inbox,
//! then runs queued tasks until none are left. Within a turn tasks run in the
//! order they were posted.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::rc::Rc;

use eanp_core::EndpointId;
use tokio::sync::mpsc;

use crate::transport::TransportEvent;

type Task = Box<dyn FnOnce()>;
type Route = Rc<dyn Fn(TransportEvent)>;

/// Transport event tagged with the endpoint it is addressed to.
#[derive(Debug)]
struct Routed {
    endpoint: EndpointId,
    event: TransportEvent,
}

/// Handle through which a transport delivers events to one endpoint.
///
/// Cheap to clone and safe to move to other threads.
#[derive(Debug, Clone)]
pub struct Inbox {
    endpoint: EndpointId,
    tx: mpsc::UnboundedSender<Routed>,
}

impl Inbox {
    /// Endpoint this inbox delivers to.
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Queue an event for the endpoint.
    ///
    /// Returns `false` when the coordination context is gone.
    pub fn post(&self, event: TransportEvent) -> bool {
        let delivered = self
            .tx
            .send(Routed {
                endpoint: self.endpoint,
                event,
            })
            .is_ok();
        if !delivered {
            tracing::trace!(endpoint = %self.endpoint, "coordinator gone, event dropped");
        }
        delivered
    }
}

/// The coordination context. Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Coordinator {
    inner: Rc<CoordinatorInner>,
}

struct CoordinatorInner {
    tasks: RefCell<VecDeque<Task>>,
    routes: RefCell<HashMap<EndpointId, Route>>,
    inbox_tx: mpsc::UnboundedSender<Routed>,
    inbox_rx: RefCell<mpsc::UnboundedReceiver<Routed>>,
    next_endpoint: Cell<u64>,
    draining: Cell<bool>,
    tasks_run: Cell<u64>,
    events_routed: Cell<u64>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Create an empty coordination context.
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(CoordinatorInner {
                tasks: RefCell::new(VecDeque::new()),
                routes: RefCell::new(HashMap::new()),
                inbox_tx,
                inbox_rx: RefCell::new(inbox_rx),
                next_endpoint: Cell::new(1),
                draining: Cell::new(false),
                tasks_run: Cell::new(0),
                events_routed: Cell::new(0),
            }),
        }
    }

    /// Queue a task to run on the context.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Register a handler for transport events and return the inbox feeding it.
    pub fn register(&self, handler: impl Fn(TransportEvent) + 'static) -> Inbox {
        let endpoint = EndpointId(self.inner.next_endpoint.get());
        self.inner.next_endpoint.set(endpoint.0 + 1);
        self.inner
            .routes
            .borrow_mut()
            .insert(endpoint, Rc::new(handler));
        Inbox {
            endpoint,
            tx: self.inner.inbox_tx.clone(),
        }
    }

    /// Stop routing events to `endpoint`. Later events for it are dropped.
    pub fn unregister(&self, endpoint: EndpointId) {
        self.inner.routes.borrow_mut().remove(&endpoint);
    }

    /// Number of queued tasks not yet run.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Total tasks run since creation.
    pub fn tasks_run(&self) -> u64 {
        self.inner.tasks_run.get()
    }

    /// Total transport events routed since creation.
    pub fn events_routed(&self) -> u64 {
        self.inner.events_routed.get()
    }

    /// Route queued transport events and run queued tasks until both are empty.
    ///
    /// Returns the number of tasks and events processed. A call made from
    /// inside a running task returns 0 immediately; the outer drain picks up
    /// whatever that task queued.
    pub fn run_pending(&self) -> usize {
        if self.inner.draining.replace(true) {
            return 0;
        }

        let mut processed = 0;
        loop {
            let mut progressed = false;

            while let Some(routed) = self.try_recv() {
                self.route(routed);
                processed += 1;
                progressed = true;
            }

            while let Some(task) = self.pop_task() {
                task();
                self.inner.tasks_run.set(self.inner.tasks_run.get() + 1);
                processed += 1;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        self.inner.draining.set(false);
        processed
    }

    /// Drive the context until `done` returns true, awaiting transport events
    /// when nothing is runnable.
    ///
    /// Never returns if `done` stays false and no event arrives; wrap in a
    /// timeout when that matters.
    pub async fn run_until(&self, done: impl Fn() -> bool) {
        loop {
            self.run_pending();
            if done() {
                return;
            }

            let next = poll_fn(|cx| self.inner.inbox_rx.borrow_mut().poll_recv(cx)).await;
            match next {
                Some(routed) => self.route(routed),
                // The context holds a sender itself, so the inbox never closes.
                None => return,
            }
        }
    }

    fn try_recv(&self) -> Option<Routed> {
        self.inner.inbox_rx.borrow_mut().try_recv().ok()
    }

    fn pop_task(&self) -> Option<Task> {
        self.inner.tasks.borrow_mut().pop_front()
    }

    fn route(&self, routed: Routed) {
        self.inner
            .events_routed
            .set(self.inner.events_routed.get() + 1);
        let handler = self.inner.routes.borrow().get(&routed.endpoint).cloned();
        match handler {
            Some(handler) => handler(routed.event),
            None => tracing::debug!(
                endpoint = %routed.endpoint,
                event = ?routed.event,
                "event for unregistered endpoint dropped"
            ),
        }
    }
}
