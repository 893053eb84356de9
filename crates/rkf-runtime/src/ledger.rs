#![forbid(unsafe_code)]

//! Bounded FIFO event ledger used as the structured diagnostic channel.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Bounded FIFO buffer of diagnostic events.
///
/// Capacity is enforced via `capacity.max(1)`, so a ledger always keeps at
/// least the latest entry. When full, the oldest entry (front of the
/// `VecDeque`) is evicted before a new one is appended; `dropped` counts the
/// evictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLedger<E> {
    capacity: usize,
    dropped: usize,
    entries: VecDeque<E>,
}

impl<E> EventLedger<E> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            dropped: 0,
            entries: VecDeque::new(),
        }
    }

    /// Append an entry, evicting the oldest if at capacity.
    pub fn record(&mut self, entry: E) {
        if self.entries.len() == self.capacity {
            let _ = self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recently recorded entry.
    #[must_use]
    pub fn latest(&self) -> Option<&E> {
        self.entries.back()
    }

    /// Number of entries evicted to respect the capacity.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter()
    }
}

impl<E: Serialize> EventLedger<E> {
    /// Serialize the retained entries as JSON lines, oldest first.
    #[must_use]
    pub fn to_jsonl(&self) -> String {
        self.entries
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
