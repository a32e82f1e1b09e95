//! Timer registry for state-scoped fallback transitions
//!
//! Timers are plain data: the controller's run loop sleeps until the next
//! deadline and asks the registry for due entries. An entry only acts if
//! the controller is still in the same visit of the state it was armed in.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use super::context::Context;
use super::machine::State;

/// Why a timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// State window expired
    Timeout,
    /// Scheduled recovery from the error state
    Retry { attempt: u32 },
}

impl TimerKind {
    /// Trigger recorded on the fallback transition
    pub fn trigger(&self) -> &'static str {
        match self {
            TimerKind::Timeout => "timeout",
            TimerKind::Retry { .. } => "retry",
        }
    }
}

/// A deferred fallback transition
#[derive(Debug, Clone)]
pub struct TimerEntry {
    /// State the timer belongs to
    pub armed_in: State,
    /// Visit of `armed_in` the timer belongs to
    pub visit: u64,
    pub deadline: Instant,
    /// State requested on expiry
    pub fallback: State,
    /// Context patch applied with the fallback transition
    pub context: Context,
    pub kind: TimerKind,
}

impl TimerEntry {
    /// Whether the controller is still where this timer was armed
    pub fn is_current(&self, state: State, visit: u64) -> bool {
        self.armed_in == state && self.visit == visit
    }

    /// Time left before the deadline
    #[cfg(test)]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// At most one live timer per state
#[derive(Debug, Default)]
pub struct TimerRegistry {
    entries: HashMap<State, TimerEntry>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, replacing any earlier one for the same state
    pub fn arm(&mut self, entry: TimerEntry) -> Option<TimerEntry> {
        self.entries.insert(entry.armed_in, entry)
    }

    /// Entry currently armed for `state`
    #[cfg(test)]
    pub fn get(&self, state: State) -> Option<&TimerEntry> {
        self.entries.get(&state)
    }

    /// Earliest deadline across all entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Remove and return the earliest entry due at `now`
    pub fn take_due(&mut self, now: Instant) -> Option<TimerEntry> {
        let state = self
            .entries
            .values()
            .filter(|entry| entry.deadline <= now)
            .min_by_key(|entry| entry.deadline)
            .map(|entry| entry.armed_in)?;
        self.entries.remove(&state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
