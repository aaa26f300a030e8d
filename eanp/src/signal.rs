//! Multi-subscriber notifications delivered through the coordinator.

use std::cell::RefCell;
use std::rc::Rc;

use crate::coordinator::Coordinator;

type Subscriber<T> = Rc<dyn Fn(&T)>;

/// A notification source with zero or more subscribers.
///
/// Emitting posts one task to the [`Coordinator`]; when it runs, every
/// subscriber registered at that moment is called in registration order.
pub struct Signal<T> {
    subscribers: Rc<RefCell<Vec<Subscriber<T>>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    /// Create a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Add a subscriber.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + 'static) {
        self.subscribers.borrow_mut().push(Rc::new(subscriber));
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// Queue delivery of `value` to the subscribers.
    pub fn emit(&self, coordinator: &Coordinator, value: T) {
        let subscribers = self.subscribers.clone();
        coordinator.post(move || {
            // Snapshot so a subscriber may subscribe more without a borrow conflict.
            let snapshot: Vec<Subscriber<T>> = subscribers.borrow().clone();
            for subscriber in snapshot {
                subscriber(&value);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_registration_order() {
        let coordinator = Coordinator::new();
        let signal: Signal<u32> = Signal::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let log = log.clone();
            signal.subscribe(move |v| log.borrow_mut().push(format!("{name}{v}")));
        }

        signal.emit(&coordinator, 1);
        assert!(log.borrow().is_empty());

        coordinator.run_pending();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_subscriber_added_before_delivery_is_called() {
        let coordinator = Coordinator::new();
        let signal: Signal<()> = Signal::new();
        let hits = Rc::new(RefCell::new(0));

        signal.emit(&coordinator, ());
        let h = hits.clone();
        signal.subscribe(move |_| *h.borrow_mut() += 1);

        coordinator.run_pending();
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_subscribing_from_a_subscriber() {
        let coordinator = Coordinator::new();
        let signal: Signal<()> = Signal::new();

        let inner = signal.clone();
        signal.subscribe(move |_| inner.subscribe(|_| {}));

        signal.emit(&coordinator, ());
        coordinator.run_pending();
        assert_eq!(signal.subscriber_count(), 2);
    }
}
