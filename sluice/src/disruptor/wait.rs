//! Wait strategies for idle consumers.
//!
//! | Strategy   | Latency | CPU     |
//! |------------|---------|---------|
//! | `BusySpin` | lowest  | 1 core  |
//! | `Yielding` | low     | high    |
//! | `Sleeping` | medium  | low     |
//! | `Blocking` | highest | lowest  |

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::SluiceError;

/// How a consumer waits when the sequences it needs are not available yet.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Called each time a consumer polls and finds nothing new.
    ///
    /// `idle_rounds` counts consecutive empty polls and restarts from zero once
    /// events arrive. `ready` re-checks whether the consumer can make progress.
    fn idle(&self, idle_rounds: u32, ready: &dyn Fn() -> bool);

    /// Wake consumers parked in `idle`. Called after every publish and cursor move.
    fn signal_all_when_blocking(&self) {}
}

/// Configurable choice of wait strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategyKind {
    #[default]
    Blocking,
    Yielding,
    BusySpin,
    Sleeping,
}

impl WaitStrategyKind {
    pub fn build(self) -> Arc<dyn WaitStrategy> {
        match self {
            Self::Blocking => Arc::new(BlockingWaitStrategy::default()),
            Self::Yielding => Arc::new(YieldingWaitStrategy),
            Self::BusySpin => Arc::new(BusySpinWaitStrategy),
            Self::Sleeping => Arc::new(SleepingWaitStrategy::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Yielding => "yielding",
            Self::BusySpin => "busy_spin",
            Self::Sleeping => "sleeping",
        }
    }
}

impl fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitStrategyKind {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "blocking" => Ok(Self::Blocking),
            "yielding" => Ok(Self::Yielding),
            "busy_spin" | "busyspin" => Ok(Self::BusySpin),
            "sleeping" => Ok(Self::Sleeping),
            other => Err(SluiceError::config(format!(
                "unknown wait strategy '{}', expected one of blocking, yielding, busy_spin, sleeping",
                other
            ))),
        }
    }
}

/// Park on a condition variable until a producer signals.
///
/// Producers only take the lock when someone is actually parked.
pub struct BlockingWaitStrategy {
    lock: Mutex<()>,
    cond: Condvar,
    waiters: AtomicUsize,
    timeout: Duration,
}

impl BlockingWaitStrategy {
    /// `timeout` bounds each park so dependent cursors are re-checked even
    /// without a signal.
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            waiters: AtomicUsize::new(0),
            timeout,
        }
    }
}

impl Default for BlockingWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl fmt::Debug for BlockingWaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingWaitStrategy")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn idle(&self, _idle_rounds: u32, ready: &dyn Fn() -> bool) {
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        if !ready() {
            self.cond.wait_for(&mut guard, self.timeout);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn signal_all_when_blocking(&self) {
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }
}

/// Spin briefly, then yield the time slice.
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldingWaitStrategy;

const YIELD_SPIN_TRIES: u32 = 100;

impl WaitStrategy for YieldingWaitStrategy {
    fn idle(&self, idle_rounds: u32, _ready: &dyn Fn() -> bool) {
        if idle_rounds < YIELD_SPIN_TRIES {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Never give up the core.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    fn idle(&self, _idle_rounds: u32, _ready: &dyn Fn() -> bool) {
        std::hint::spin_loop();
    }
}

/// Spin, then yield, then sleep for a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct SleepingWaitStrategy {
    spin_tries: u32,
    yield_tries: u32,
    sleep: Duration,
}

impl SleepingWaitStrategy {
    pub fn new(sleep: Duration) -> Self {
        Self {
            spin_tries: 100,
            yield_tries: 100,
            sleep,
        }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_micros(100))
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn idle(&self, idle_rounds: u32, _ready: &dyn Fn() -> bool) {
        if idle_rounds < self.spin_tries {
            std::hint::spin_loop();
        } else if idle_rounds < self.spin_tries + self.yield_tries {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
        }
    }
}
