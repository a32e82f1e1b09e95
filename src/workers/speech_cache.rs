//! Fixed-size FIFO cache keyed by utterance text

use std::collections::{HashMap, VecDeque};

/// Keeps the most recently inserted entries, evicting the oldest first
#[derive(Debug, Clone)]
pub struct SpeechCache<V> {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, V>,
}

impl<V> SpeechCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, text: &str) -> Option<&V> {
        self.entries.get(text)
    }

    /// Insert an entry, returning the one evicted to make room
    ///
    /// Re-inserting an existing key updates it in place without refreshing
    /// its position.
    pub fn insert(&mut self, text: impl Into<String>, value: V) -> Option<(String, V)> {
        if self.capacity == 0 {
            return None;
        }

        let text = text.into();
        if let Some(existing) = self.entries.get_mut(&text) {
            *existing = value;
            return None;
        }

        let evicted = if self.order.len() >= self.capacity {
            self.order
                .pop_front()
                .and_then(|oldest| self.entries.remove(&oldest).map(|v| (oldest, v)))
        } else {
            None
        };

        self.order.push_back(text.clone());
        self.entries.insert(text, value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
