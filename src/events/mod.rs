//! Events module for state controller notifications
//!
//! Provides the notification payloads emitted on every transition attempt
//! and the listener set that delivers them synchronously.

mod listeners;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::state::{Context, Event, State, Transition};

pub use listeners::{Listener, ListenerSet, Subscription};

/// Notifications emitted by the state controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Controller was initialized
    Initialized {
        state: State,
        timestamp: u64,
    },

    /// A transition succeeded
    Transition(Transition),

    /// A transition request was rejected
    TransitionError {
        from: State,
        /// Requested target, when known
        attempted: Option<State>,
        /// Raised event, for event-form requests
        event: Option<Event>,
        trigger: String,
        /// Machine-readable rejection code
        reason: String,
        /// Context patch that accompanied the request
        context: Context,
        timestamp: u64,
    },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::Initialized { state, .. } => write!(f, "INITIALIZED ({})", state),
            StateEvent::Transition(transition) => write!(f, "TRANSITION ({})", transition),
            StateEvent::TransitionError {
                from,
                attempted,
                event,
                reason,
                ..
            } => {
                let target = match (attempted, event) {
                    (Some(state), _) => state.to_string(),
                    (None, Some(event)) => event.to_string(),
                    (None, None) => "?".to_string(),
                };
                write!(f, "TRANSITION_ERROR ({} -> {}: {})", from, target, reason)
            }
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
