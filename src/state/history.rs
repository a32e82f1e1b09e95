//! Bounded log of past transitions

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::machine::State;

/// Record of a successful transition
///
/// Created at the moment the transition succeeds and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State being left
    pub from: State,
    /// State being entered
    pub to: State,
    /// What requested the move (event name, "timeout", "retry", ...)
    pub trigger: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} --{}--> {}", self.from, self.trigger, self.to)
    }
}

/// FIFO ring of the most recent transitions
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Transition>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append a transition, evicting the oldest entries beyond the limit
    pub fn record(&mut self, transition: Transition) {
        if self.limit == 0 {
            return;
        }
        self.entries.push_back(transition);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Copy of the entries, oldest first
    pub fn snapshot(&self) -> Vec<Transition> {
        self.entries.iter().cloned().collect()
    }
}
