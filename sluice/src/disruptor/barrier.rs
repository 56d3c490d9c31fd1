//! Coordination point between a consumer and whatever it depends on.
//!
//! With no dependents a barrier tracks the ring's published sequences. With
//! dependents it tracks the slowest upstream cursor, which only moves past
//! sequences that are already published and handled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::disruptor::ring::{Cursor, RingBuffer};
use crate::disruptor::{RingBufferEntry, Sequence};

pub struct SequenceBarrier<T: RingBufferEntry> {
    ring: Arc<RingBuffer<T>>,
    dependents: Vec<Arc<Cursor>>,
    halted: Arc<AtomicBool>,
}

impl<T: RingBufferEntry> SequenceBarrier<T> {
    pub fn new(ring: Arc<RingBuffer<T>>, dependents: Vec<Arc<Cursor>>, halted: Arc<AtomicBool>) -> Self {
        Self {
            ring,
            dependents,
            halted,
        }
    }

    /// Exclusive upper bound of the sequences readable from `next`.
    #[inline]
    pub fn available_from(&self, next: Sequence) -> Sequence {
        if self.dependents.is_empty() {
            self.ring.highest_published(next)
        } else {
            self.dependents
                .iter()
                .map(|cursor| cursor.get())
                .min()
                .unwrap_or(next)
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Wait until at least `next` is readable.
    ///
    /// Returns the exclusive upper bound of the readable run, or `None` once the
    /// barrier is halted and nothing is left to read.
    pub fn wait_for(&self, next: Sequence) -> Option<Sequence> {
        let wait_strategy = self.ring.wait_strategy();
        let mut idle_rounds = 0u32;
        loop {
            let available = self.available_from(next);
            if available > next {
                return Some(available);
            }
            if self.is_halted() {
                return None;
            }
            wait_strategy.idle(idle_rounds, &|| {
                self.available_from(next) > next || self.is_halted()
            });
            idle_rounds = idle_rounds.saturating_add(1);
        }
    }
}
