//! Partitioned worker pools.
//!
//! Every worker in a `ProcessorGroup` walks every sequence, but only handles the
//! ones its `WorkerPartition` owns (`sequence % total == ordinal`). Each worker keeps
//! its own cursor, so downstream stages and producers gate on the slowest one.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::disruptor::barrier::SequenceBarrier;
use crate::disruptor::ring::{Cursor, RingBuffer};
use crate::disruptor::wait::WaitStrategy;
use crate::disruptor::{RingBufferEntry, Sequence};
use crate::error::{Result, SluiceError};
use crate::fault::{Fault, FaultHandler};

/// Consumer-side callbacks for one worker.
pub trait EventHandler<T>: Send {
    /// Handle one owned event. `end_of_batch` is set on the last owned sequence of
    /// the run the worker picked up from its barrier.
    fn on_event(&mut self, event: &mut T, sequence: Sequence, end_of_batch: bool) -> Result<()>;

    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Which share of the sequence space a worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPartition {
    ordinal: usize,
    total: usize,
}

impl WorkerPartition {
    pub fn new(ordinal: usize, total: usize) -> Result<Self> {
        if total == 0 {
            return Err(SluiceError::config("Partition total must be greater than 0"));
        }
        if ordinal >= total {
            return Err(SluiceError::config(format!(
                "Partition ordinal {} out of range for {} workers",
                ordinal, total
            )));
        }
        Ok(Self { ordinal, total })
    }

    /// A partition that owns everything.
    pub fn single() -> Self {
        Self {
            ordinal: 0,
            total: 1,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn owns(&self, sequence: Sequence) -> bool {
        sequence % self.total as u64 == self.ordinal as u64
    }

    /// Highest owned sequence strictly below `end`.
    pub fn last_owned_below(&self, end: Sequence) -> Option<Sequence> {
        let last = end.checked_sub(1)?;
        let ordinal = self.ordinal as u64;
        if last < ordinal {
            return None;
        }
        Some(last - (last - ordinal) % self.total as u64)
    }
}

/// One worker thread's loop over a ring buffer.
pub struct EventProcessor<T: RingBufferEntry, H> {
    stage: String,
    ring: Arc<RingBuffer<T>>,
    barrier: SequenceBarrier<T>,
    cursor: Arc<Cursor>,
    partition: WorkerPartition,
    handler: H,
    fault: Arc<dyn FaultHandler>,
}

impl<T, H> EventProcessor<T, H>
where
    T: RingBufferEntry + fmt::Debug,
    H: EventHandler<T>,
{
    pub fn new(
        stage: impl Into<String>,
        ring: Arc<RingBuffer<T>>,
        barrier: SequenceBarrier<T>,
        partition: WorkerPartition,
        handler: H,
        fault: Arc<dyn FaultHandler>,
    ) -> Self {
        let cursor = Arc::new(Cursor::new(ring.cursor()));
        Self {
            stage: stage.into(),
            ring,
            barrier,
            cursor,
            partition,
            handler,
            fault,
        }
    }

    pub fn cursor(&self) -> Arc<Cursor> {
        self.cursor.clone()
    }

    /// Process events until the barrier is halted and drained.
    pub fn run(mut self) {
        self.notify_start();

        let mut next = self.cursor.get();
        while let Some(available) = self.barrier.wait_for(next) {
            let last_owned = self.partition.last_owned_below(available);
            for sequence in next..available {
                if !self.partition.owns(sequence) {
                    continue;
                }
                // Safe: this worker is the only owner of `sequence` and upstream has released it
                let event = unsafe { self.ring.slot_mut(sequence) };
                let end_of_batch = last_owned == Some(sequence);
                let handler = &mut self.handler;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_event(&mut *event, sequence, end_of_batch)
                }));
                let fault = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => Fault::Error(err),
                    Err(payload) => Fault::from_panic(payload),
                };
                self.fault
                    .handle_event_fault(&self.stage, &fault, sequence, &*event);
            }
            next = available;
            self.cursor.set(next);
            self.ring.wait_strategy().signal_all_when_blocking();
        }

        self.notify_shutdown();
    }

    fn notify_start(&mut self) {
        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_start())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fault.handle_start_fault(&self.stage, &Fault::Error(err)),
            Err(payload) => self
                .fault
                .handle_start_fault(&self.stage, &Fault::from_panic(payload)),
        }
        debug!(
            stage = %self.stage,
            ordinal = self.partition.ordinal(),
            total = self.partition.total(),
            "Processor started"
        );
    }

    fn notify_shutdown(&mut self) {
        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_shutdown())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self
                .fault
                .handle_shutdown_fault(&self.stage, &Fault::Error(err)),
            Err(payload) => self
                .fault
                .handle_shutdown_fault(&self.stage, &Fault::from_panic(payload)),
        }
        debug!(
            stage = %self.stage,
            ordinal = self.partition.ordinal(),
            cursor = self.cursor.get(),
            "Processor stopped"
        );
    }
}

/// A named pool of partitioned workers over one ring buffer.
pub struct ProcessorGroup {
    name: String,
    cursors: Vec<Arc<Cursor>>,
    halted: Arc<AtomicBool>,
    wait_strategy: Arc<dyn WaitStrategy>,
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorGroup {
    /// Start one thread per handler. Worker `i` of `n` owns `sequence % n == i`.
    ///
    /// `dependents` are the cursors of the stage this group must trail; an empty
    /// list means the group reads straight off the published sequences. The caller
    /// decides which cursors gate producers.
    pub fn spawn<T, H>(
        name: &str,
        ring: &Arc<RingBuffer<T>>,
        dependents: Vec<Arc<Cursor>>,
        handlers: Vec<H>,
        fault: Arc<dyn FaultHandler>,
    ) -> Result<Self>
    where
        T: RingBufferEntry + fmt::Debug,
        H: EventHandler<T> + 'static,
    {
        let total = handlers.len();
        if total == 0 {
            return Err(SluiceError::config(format!(
                "Processor group '{}' needs at least one handler",
                name
            )));
        }

        let mut group = Self {
            name: name.to_string(),
            cursors: Vec::with_capacity(total),
            halted: Arc::new(AtomicBool::new(false)),
            wait_strategy: ring.wait_strategy().clone(),
            handles: Vec::with_capacity(total),
        };

        for (ordinal, handler) in handlers.into_iter().enumerate() {
            let partition = WorkerPartition::new(ordinal, total)?;
            let barrier =
                SequenceBarrier::new(ring.clone(), dependents.clone(), group.halted.clone());
            let processor =
                EventProcessor::new(name, ring.clone(), barrier, partition, handler, fault.clone());
            group.cursors.push(processor.cursor());

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, ordinal))
                .spawn(move || processor.run());
            match spawned {
                Ok(handle) => group.handles.push(handle),
                Err(err) => {
                    let reason = SluiceError::processing(format!(
                        "unable to spawn worker {}: {}",
                        ordinal, err
                    ));
                    fault.handle_start_fault(name, &Fault::Error(reason));
                    group.halt();
                    group.join();
                    return Err(SluiceError::Io(err));
                }
            }
        }

        info!(stage = %group.name, workers = total, "Processor group started");
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Worker cursors, for gating producers or chaining a downstream group.
    pub fn cursors(&self) -> Vec<Arc<Cursor>> {
        self.cursors.clone()
    }

    /// Position of the slowest worker.
    pub fn min_cursor(&self) -> Sequence {
        self.cursors
            .iter()
            .map(|cursor| cursor.get())
            .min()
            .unwrap_or(0)
    }

    /// Wait until every worker has moved past `upto`, or every worker has exited.
    pub fn drain(&self, upto: Sequence) {
        while self.min_cursor() < upto {
            if self.handles.iter().all(|handle| handle.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Ask workers to stop once their barrier has nothing left to read.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let thread_name = handle.thread().name().unwrap_or("unnamed").to_string();
            if let Err(payload) = handle.join() {
                error!(
                    stage = %self.name,
                    thread = %thread_name,
                    "Processor thread terminated abnormally: {}",
                    Fault::from_panic(payload)
                );
            }
        }
    }
}

impl fmt::Debug for ProcessorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorGroup")
            .field("name", &self.name)
            .field("workers", &self.cursors.len())
            .field("min_cursor", &self.min_cursor())
            .finish()
    }
}

impl Drop for ProcessorGroup {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.halt();
            self.join();
        }
    }
}
