//! Superseded store generations
//!
//! When a remote merge replaces the local store, the old generation's
//! listener stays attached so a late asynchronous effect can still be
//! carried over. Entries live for a bounded time; the most recently
//! retired entry never expires on its own.

use std::time::Duration;

use tokio::time::Instant;

use crate::listeners::Subscription;

#[derive(Debug)]
struct Entry {
    retired_at: Instant,
    generation: u64,
    subscription: Subscription,
}

/// Dense list of retired generations, oldest first
#[derive(Debug, Default)]
pub struct OutdatedSubscriptions {
    entries: Vec<Entry>,
}

impl OutdatedSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a generation that has just been superseded
    pub fn retire(&mut self, now: Instant, generation: u64, subscription: Subscription) {
        self.entries.push(Entry {
            retired_at: now,
            generation,
            subscription,
        });
    }

    /// Remove every entry at least `timeout` old, except the newest
    ///
    /// Returns the removed subscriptions; the caller unsubscribes them.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Subscription> {
        let Some(newest) = self.entries.len().checked_sub(1) else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (index, entry) in self.entries.drain(..).enumerate() {
            if index < newest && now.saturating_duration_since(entry.retired_at) >= timeout {
                expired.push(entry.subscription);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        expired
    }

    /// Whether a generation is still being watched
    pub fn contains(&self, generation: u64) -> bool {
        self.entries.iter().any(|e| e.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.entries.drain(..).map(|e| e.subscription).collect()
    }
}
