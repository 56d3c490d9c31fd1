//! Multi-producer event arena.
//!
//! Slots are allocated once and addressed by `sequence & mask`. Producers race on a
//! claim cursor with compare-exchange, write into the claimed slot, then publish it by
//! stamping a per-slot availability marker. Consumers register gating cursors; a
//! producer may only claim a sequence once every gating cursor has moved past the
//! slot's previous lap.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::disruptor::wait::WaitStrategy;
use crate::disruptor::{RingBufferConfig, RingBufferEntry, Sequence};
use crate::error::{Result, SluiceError};

/// Spins before a producer blocked on a full ring starts yielding
const CLAIM_SPIN_LIMIT: u32 = 64;
/// Yields before a producer blocked on a full ring starts parking
const CLAIM_YIELD_LIMIT: u32 = 128;
/// Park interval for producers stuck on a full ring
const CLAIM_PARK_INTERVAL: Duration = Duration::from_micros(50);

/// Cache-line padded sequence cursor (prevents false sharing).
///
/// A consumer cursor holds the first sequence the consumer has NOT yet finished,
/// so everything below it may be overwritten by producers.
#[repr(align(128))]
pub struct Cursor(AtomicU64);

impl Cursor {
    pub fn new(value: Sequence) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    pub fn get(&self) -> Sequence {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: Sequence) {
        self.0.store(value, Ordering::Release)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cursor").field(&self.get()).finish()
    }
}

pub struct RingBuffer<T: RingBufferEntry> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    size: u64,
    /// Next sequence to hand out to a producer
    claim_cursor: Cursor,
    /// Per slot: `sequence + 1` once that sequence is published
    published: Box<[AtomicU64]>,
    gating: RwLock<Vec<Arc<Cursor>>>,
    /// Last observed minimum of the gating cursors
    cached_gate: Cursor,
    wait_strategy: Arc<dyn WaitStrategy>,
    halted: AtomicBool,
}

impl<T: RingBufferEntry> RingBuffer<T> {
    pub fn new(config: &RingBufferConfig) -> Result<Self> {
        Self::with_wait_strategy(config.size, config.wait_strategy.build())
    }

    /// Create with a caller-supplied wait strategy.
    pub fn with_wait_strategy(size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(SluiceError::config("Size must be power of 2"));
        }

        let slots = (0..size)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let published = (0..size)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: size - 1,
            size: size as u64,
            claim_cursor: Cursor::new(0),
            published,
            gating: RwLock::new(Vec::new()),
            cached_gate: Cursor::new(0),
            wait_strategy,
            halted: AtomicBool::new(false),
        })
    }

    /// Register consumer cursors that producers must not lap.
    pub fn add_gating_cursors(&self, cursors: &[Arc<Cursor>]) {
        self.gating.write().extend(cursors.iter().cloned());
    }

    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Sequences claimed so far (the next sequence a producer will receive).
    pub fn cursor(&self) -> Sequence {
        self.claim_cursor.get()
    }

    pub fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }

    /// Claimed slots not yet released by the slowest gating consumer.
    pub fn len(&self) -> usize {
        let claimed = self.claim_cursor.get();
        let gate = self.minimum_gating_sequence(claimed);
        claimed.saturating_sub(gate).min(self.size) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Stop handing out sequences; blocked and future claims fail with `Shutdown`.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn minimum_gating_sequence(&self, default: Sequence) -> Sequence {
        self.gating
            .read()
            .iter()
            .map(|cursor| cursor.get())
            .min()
            .unwrap_or(default)
    }

    /// Whether `sequence` can be claimed without lapping the slowest gating consumer.
    fn has_capacity_for(&self, sequence: Sequence) -> bool {
        let wrap_point = (sequence + 1).saturating_sub(self.size);
        if wrap_point <= self.cached_gate.get() {
            return true;
        }
        let gate = self.minimum_gating_sequence(sequence);
        self.cached_gate.set(gate);
        wrap_point <= gate
    }

    /// Claim the next sequence without blocking. Returns `None` when the ring is full
    /// or halted. Producers always go through the blocking `claim_next`.
    #[cfg(test)]
    pub(crate) fn try_claim_next(&self) -> Option<Sequence> {
        loop {
            if self.is_halted() {
                return None;
            }
            let current = self.claim_cursor.0.load(Ordering::Relaxed);
            if !self.has_capacity_for(current) {
                return None;
            }
            match self.claim_cursor.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Claim the next sequence, blocking the calling thread while the ring is full.
    pub fn claim_next(&self) -> Result<Sequence> {
        let mut stalls = 0u32;
        loop {
            if self.is_halted() {
                return Err(SluiceError::Shutdown);
            }
            let current = self.claim_cursor.0.load(Ordering::Relaxed);
            if !self.has_capacity_for(current) {
                Self::back_off(stalls);
                stalls = stalls.saturating_add(1);
                continue;
            }
            match self.claim_cursor.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    fn back_off(stalls: u32) {
        if stalls < CLAIM_SPIN_LIMIT {
            std::hint::spin_loop();
        } else if stalls < CLAIM_YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(CLAIM_PARK_INTERVAL);
        }
    }

    /// Make a claimed sequence visible to consumers.
    pub fn publish(&self, sequence: Sequence) {
        let idx = (sequence as usize) & self.mask;
        self.published[idx].store(sequence + 1, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    /// Claim, populate and publish one slot, blocking while the ring is full.
    ///
    /// The slot is reset before `update` runs. It is published even if `update`
    /// panics so consumers never stall behind an abandoned sequence.
    pub fn publish_with<F>(&self, update: F) -> Result<Sequence>
    where
        F: FnOnce(&mut T),
    {
        let sequence = self.claim_next()?;
        let guard = PublishOnDrop {
            ring: self,
            sequence,
        };
        // Safe: a claimed slot is invisible to consumers until published
        let slot = unsafe { self.slot_mut(sequence) };
        slot.reset();
        update(slot);
        drop(guard);
        Ok(sequence)
    }

    /// Exclusive upper bound of the contiguous published run starting at `lower`.
    #[inline]
    pub fn highest_published(&self, lower: Sequence) -> Sequence {
        let claimed = self.claim_cursor.get();
        let mut seq = lower;
        while seq < claimed {
            let idx = (seq as usize) & self.mask;
            if self.published[idx].load(Ordering::Acquire) != seq + 1 {
                break;
            }
            seq += 1;
        }
        seq
    }

    /// Mutable access to the slot for `sequence`.
    ///
    /// # Safety
    ///
    /// - The caller must own `sequence`: claimed-but-unpublished for a producer, or
    ///   published and not yet released for the single consumer handling it.
    /// - No other reference to the same slot may be alive.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, sequence: Sequence) -> &mut T {
        let idx = (sequence as usize) & self.mask;
        debug_assert!(
            idx < self.slots.len(),
            "RingBuffer::slot_mut: idx {} >= len {}",
            idx,
            self.slots.len()
        );
        &mut *self.slots[idx].get()
    }
}

struct PublishOnDrop<'a, T: RingBufferEntry> {
    ring: &'a RingBuffer<T>,
    sequence: Sequence,
}

impl<T: RingBufferEntry> Drop for PublishOnDrop<'_, T> {
    fn drop(&mut self) {
        self.ring.publish(self.sequence);
    }
}

impl<T: RingBufferEntry> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.size)
            .field("cursor", &self.cursor())
            .field("len", &self.len())
            .field("wait_strategy", &self.wait_strategy)
            .finish()
    }
}

// Safety: slot access is serialized by the claim/publish/gating protocol
unsafe impl<T: RingBufferEntry> Send for RingBuffer<T> {}
unsafe impl<T: RingBufferEntry> Sync for RingBuffer<T> {}
