//! Synchronous observers of state events
//!
//! A panicking listener is caught and logged; the remaining listeners
//! still run and the transition that triggered the notification stands.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use super::StateEvent;

/// Callback invoked with every state event
pub type Listener = Box<dyn FnMut(&StateEvent) + Send>;

/// Handle returned by `subscribe`, used to deregister a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Registered listeners in subscription order
#[derive(Default)]
pub struct ListenerSet {
    next_id: u64,
    listeners: Vec<(Subscription, Listener)>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Listener) -> Subscription {
        let subscription = Subscription(self.next_id);
        self.next_id += 1;
        self.listeners.push((subscription, listener));
        subscription
    }

    /// Returns false if the subscription was not registered
    pub fn remove(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _)| *id != subscription);
        self.listeners.len() != before
    }

    /// Deliver an event to every listener, returning how many panicked
    pub fn notify(&mut self, event: &StateEvent) -> usize {
        let mut failed = 0;
        for (subscription, listener) in &mut self.listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(payload) = outcome {
                failed += 1;
                error!(
                    subscription = subscription.0,
                    reason = %panic_message(payload.as_ref()),
                    "state listener panicked"
                );
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
