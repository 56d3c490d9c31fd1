//! Lock-free event arenas (LMAX Disruptor pattern).
//!
//! - `RingBuffer<T>` - Multi-producer arena of reusable slots with gating cursors
//! - `SequenceBarrier` - Waits for published (or upstream-processed) sequences
//! - `ProcessorGroup` - Partitioned worker pool; each sequence goes to ONE worker
//! - `WaitStrategy` - How idle consumers wait (blocking, yielding, busy-spin, sleeping)

mod barrier;
mod processor;
mod ring;
mod wait;

pub use barrier::SequenceBarrier;
pub use processor::{EventHandler, EventProcessor, ProcessorGroup, WorkerPartition};
pub use ring::{Cursor, RingBuffer};
pub use wait::{
    BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy, WaitStrategy,
    WaitStrategyKind, YieldingWaitStrategy,
};

use crate::error::{Result, SluiceError};

/// Default ring buffer size (must be power of 2)
const DEFAULT_RING_BUFFER_SIZE: usize = 64 * 1024; // 64K slots

/// Sequence number type for ring buffer positions
pub type Sequence = u64;

/// Trait for objects that can live in a ring buffer slot.
///
/// Slots are allocated once and reused for every lap around the ring.
pub trait RingBufferEntry: Default + Send + 'static {
    /// Reset the entry to its empty state before it is populated again.
    fn reset(&mut self);
}

/// Configuration for one ring buffer and the worker pool draining it.
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Size of the ring buffer (must be power of 2)
    pub size: usize,
    /// Number of partitioned consumer threads
    pub num_consumers: usize,
    /// How idle consumers wait for new sequences
    pub wait_strategy: WaitStrategyKind,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_RING_BUFFER_SIZE,
            num_consumers: 1,
            wait_strategy: WaitStrategyKind::default(),
        }
    }
}

impl RingBufferConfig {
    /// Create a new configuration with the specified size
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SluiceError::config("Ring buffer size must be greater than 0"));
        }
        if !size.is_power_of_two() {
            return Err(SluiceError::config("Ring buffer size must be power of 2"));
        }

        Ok(Self {
            size,
            ..Default::default()
        })
    }

    /// Set the number of consumers
    pub fn with_consumers(mut self, num_consumers: usize) -> Result<Self> {
        if num_consumers == 0 {
            return Err(SluiceError::config(
                "Number of consumers must be greater than 0",
            ));
        }
        if num_consumers > self.size {
            return Err(SluiceError::config(
                "Number of consumers cannot exceed ring buffer size",
            ));
        }

        self.num_consumers = num_consumers;
        Ok(self)
    }

    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Re-check the invariants, for configs assembled field by field.
    pub fn validate(&self) -> Result<()> {
        Self::new(self.size)?.with_consumers(self.num_consumers)?;
        Ok(())
    }
}
