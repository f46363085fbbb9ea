//! Process-wide counters shared by the dispatcher and every connection handler.
//!
//! Each counter is its own `AtomicU64`, so the message sequence and the client
//! id allocator never contend with each other. `fetch_add` makes the
//! read-increment-return step a single indivisible operation: no two callers
//! can ever be handed the same value.

use std::sync::atomic::{AtomicU64, Ordering};

/// Names the counters kept by a [`CounterStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Global message sequence number, bumped once per successful read.
    Messages,
    /// Client identifier, bumped once per accepted connection.
    ClientIds,
}

/// Atomic get-and-increment over a set of named counters.
///
/// The dispatcher and handlers only see this trait, so tests (or an embedding
/// application) can hand in their own store.
pub trait CounterStore: Send + Sync {
    /// Claims the next value of `counter`. The first value handed out is 1.
    fn next_value(&self, counter: CounterKind) -> u64;

    /// Number of values `counter` has handed out so far.
    fn issued(&self, counter: CounterKind) -> u64;
}

/// Default in-memory [`CounterStore`].
#[derive(Debug)]
pub struct SharedCounters {
    messages: Counter,
    client_ids: Counter,
}

impl SharedCounters {
    pub fn new() -> Self {
        Self {
            messages: Counter::starting_at(1),
            client_ids: Counter::starting_at(1),
        }
    }

    fn counter(&self, kind: CounterKind) -> &Counter {
        match kind {
            CounterKind::Messages => &self.messages,
            CounterKind::ClientIds => &self.client_ids,
        }
    }
}

impl Default for SharedCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for SharedCounters {
    fn next_value(&self, counter: CounterKind) -> u64 {
        self.counter(counter).next()
    }

    fn issued(&self, counter: CounterKind) -> u64 {
        self.counter(counter).issued()
    }
}

#[derive(Debug)]
struct Counter {
    first: u64,
    next: AtomicU64,
}

impl Counter {
    fn starting_at(first: u64) -> Self {
        Self {
            first,
            next: AtomicU64::new(first),
        }
    }

    fn next(&self) -> u64 {
        // Only uniqueness matters here; nothing else is published through the counter.
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - self.first
    }
}
