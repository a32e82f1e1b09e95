//! Transition table and event vocabulary
//!
//! The table is the single source of truth for which moves are legal. The
//! event vocabulary is a second front-end over the same edges: every
//! (state, event) pair resolves to a target that must itself be an edge.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::TableError;
use super::machine::State;

/// Named events that request transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// User tapped the assistant or otherwise asked it to listen
    UserActivate,
    /// Speech was recognized
    UserInput,
    /// User abandoned the current exchange
    UserCancel,
    /// A state window expired
    Timeout,
    /// A response is ready to be spoken
    ResponseReady,
    /// The response needs explicit confirmation first
    NeedsConfirmation,
    /// Speech synthesis finished
    SpeakingComplete,
    /// A worker reported a failure
    Failure,
    /// The error was acknowledged
    ErrorAcknowledged,
    /// User confirmed a pending order
    UserConfirms,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::UserActivate => "user_activate",
            Event::UserInput => "user_input",
            Event::UserCancel => "user_cancel",
            Event::Timeout => "timeout",
            Event::ResponseReady => "response_ready",
            Event::NeedsConfirmation => "needs_confirmation",
            Event::SpeakingComplete => "speaking_complete",
            Event::Failure => "failure",
            Event::ErrorAcknowledged => "error_acknowledged",
            Event::UserConfirms => "user_confirms",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CANONICAL_EDGES: &[(State, &[State])] = &[
    (State::Idle, &[State::Listening]),
    (State::Listening, &[State::Processing, State::Idle, State::Error]),
    (
        State::Processing,
        &[State::Speaking, State::Idle, State::Error, State::ConfirmingOrder],
    ),
    (State::Speaking, &[State::Idle, State::Error]),
    (State::Error, &[State::Idle, State::Listening]),
    (State::ConfirmingOrder, &[State::Processing, State::Idle]),
];

/// Edges forced by expired timers: listening and processing windows, and
/// recovery from error
const FALLBACK_EDGES: [(State, State); 3] = [
    (State::Listening, State::Idle),
    (State::Processing, State::Error),
    (State::Error, State::Idle),
];

const CANONICAL_EVENTS: &[(State, Event, State)] = &[
    (State::Idle, Event::UserActivate, State::Listening),
    (State::Listening, Event::UserInput, State::Processing),
    (State::Listening, Event::UserCancel, State::Idle),
    (State::Listening, Event::Timeout, State::Idle),
    (State::Listening, Event::Failure, State::Error),
    (State::Processing, Event::ResponseReady, State::Speaking),
    (State::Processing, Event::NeedsConfirmation, State::ConfirmingOrder),
    (State::Processing, Event::UserCancel, State::Idle),
    (State::Processing, Event::Failure, State::Error),
    (State::Processing, Event::Timeout, State::Error),
    (State::Speaking, Event::SpeakingComplete, State::Idle),
    (State::Speaking, Event::UserCancel, State::Idle),
    (State::Speaking, Event::Failure, State::Error),
    (State::Error, Event::ErrorAcknowledged, State::Idle),
    (State::Error, Event::UserActivate, State::Listening),
    (State::ConfirmingOrder, Event::UserConfirms, State::Processing),
    (State::ConfirmingOrder, Event::UserCancel, State::Idle),
];

/// Fixed mapping of allowed moves, built once and never mutated
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<State, Vec<State>>,
    events: HashMap<(State, Event), State>,
}

impl TransitionTable {
    /// Build and validate a table
    ///
    /// Every state must have at least one outgoing edge and no state may list
    /// itself. The timeout and retry fallbacks must be edges, and every event
    /// mapping must land on an existing edge.
    pub fn new<E, V>(edges: E, events: V) -> Result<Self, TableError>
    where
        E: IntoIterator<Item = (State, Vec<State>)>,
        V: IntoIterator<Item = (State, Event, State)>,
    {
        let edges: HashMap<State, Vec<State>> = edges.into_iter().collect();

        for state in State::ALL {
            let targets = edges.get(&state).map(Vec::as_slice).unwrap_or_default();
            if targets.is_empty() {
                return Err(TableError::DeadEnd(state));
            }
            if targets.contains(&state) {
                return Err(TableError::SelfLoop(state));
            }
        }

        for (from, to) in FALLBACK_EDGES {
            if !edges.get(&from).is_some_and(|targets| targets.contains(&to)) {
                return Err(TableError::MissingFallback { from, to });
            }
        }

        let mut mapped = HashMap::new();
        for (from, event, to) in events {
            let legal = edges.get(&from).is_some_and(|targets| targets.contains(&to));
            if !legal {
                return Err(TableError::UnmappedEvent { from, event, to });
            }
            mapped.insert((from, event), to);
        }

        Ok(Self {
            edges,
            events: mapped,
        })
    }

    /// The canonical assistant table, including the order confirmation extension
    pub fn canonical() -> Result<Self, TableError> {
        Self::new(
            CANONICAL_EDGES
                .iter()
                .map(|(from, targets)| (*from, targets.to_vec())),
            CANONICAL_EVENTS.iter().copied(),
        )
    }

    /// Whether `from -> to` is a table edge
    pub fn allows(&self, from: State, to: State) -> bool {
        self.targets(from).contains(&to)
    }

    /// States reachable directly from `from`
    pub fn targets(&self, from: State) -> &[State] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolve an event raised in `from`
    pub fn resolve(&self, from: State, event: Event) -> Option<State> {
        self.events.get(&(from, event)).copied()
    }

    /// Events that have a mapping from `from`
    pub fn events_from(&self, from: State) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .keys()
            .filter(|(state, _)| *state == from)
            .map(|(_, event)| *event)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        events.sort_by_key(Event::as_str);
        events
    }
}
