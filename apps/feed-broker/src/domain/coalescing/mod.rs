//! Pending-Update Set
//!
//! The data structure behind both coalescing tiers (broker flush timer and
//! client render batcher).
//!
//! # Semantics
//!
//! - At most one entry per key.
//! - A new value for a pending key *replaces* the old one (last write wins).
//!   Fields carried only by the replaced value are lost; this trades
//!   precision for throughput and is intentionally not a field-level merge.
//! - `drain` yields values in the order their key was first offered in the
//!   current window, then leaves the set empty.

use std::collections::HashMap;
use std::hash::Hash;

/// Result of offering a value to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The key was not pending; a new slot was opened.
    Inserted,
    /// The key was already pending; its value was overwritten.
    Replaced,
}

/// Insertion-ordered, last-write-wins pending set.
#[derive(Debug, Clone)]
pub struct PendingUpdates<K, V> {
    slots: Vec<V>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for PendingUpdates<K, V> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> PendingUpdates<K, V> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite the pending value for `key`.
    pub fn offer(&mut self, key: K, value: V) -> Offer {
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot] = value;
            return Offer::Replaced;
        }

        self.index.insert(key, self.slots.len());
        self.slots.push(value);
        Offer::Inserted
    }

    /// Take every pending value in first-offer order and clear the set.
    pub fn drain(&mut self) -> Vec<V> {
        self.index.clear();
        std::mem::take(&mut self.slots)
    }

    /// Discard every pending value.
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }

    /// Pending value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.slots[slot])
    }

    /// Number of pending keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
