//! Errors reported by the state controller and transition table

use super::machine::State;
use super::table::Event;

/// Reasons a transition request was rejected
///
/// None of these are fatal: the controller stays in its current state and
/// remains usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("controller is not initialized (state {from})")]
    NotInitialized { from: State },

    #[error("already in state {state}")]
    SameState { state: State },

    #[error("controller is paused in {from}, only idle is accepted (attempted {attempted})")]
    Paused { from: State, attempted: State },

    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed { from: State, to: State },

    #[error("event {event} has no transition from {from}")]
    UnknownEvent { from: State, event: Event },
}

impl TransitionError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized { .. } => "not_initialized",
            Self::SameState { .. } => "same_state",
            Self::Paused { .. } => "paused",
            Self::NotAllowed { .. } => "not_allowed",
            Self::UnknownEvent { .. } => "unknown_event",
        }
    }
}

/// Problems found while building a transition table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("state {0} has no outgoing transition")]
    DeadEnd(State),

    #[error("state {0} lists itself as a target")]
    SelfLoop(State),

    #[error("fallback {from} -> {to} is not a table edge")]
    MissingFallback { from: State, to: State },

    #[error("event {event} maps {from} -> {to}, which is not a table edge")]
    UnmappedEvent { from: State, event: Event, to: State },
}
