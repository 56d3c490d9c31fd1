use std::sync::Arc;

use crate::disruptor::RingBuffer;
use crate::error::Result;
use crate::message::{MessageEvent, RawMessage};
use crate::metrics::PipelineMetrics;

/// Entry point for producers. Cheap to clone; every clone feeds the same ring.
#[derive(Clone)]
pub struct InputBuffer {
    ring: Arc<RingBuffer<MessageEvent>>,
    metrics: Arc<PipelineMetrics>,
}

impl InputBuffer {
    pub fn new(ring: Arc<RingBuffer<MessageEvent>>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { ring, metrics }
    }

    /// Insert a message, blocking while the ring is full.
    ///
    /// Only fails with `Shutdown` once the pipeline has stopped accepting input.
    pub fn insert(&self, raw: RawMessage) -> Result<()> {
        self.ring.publish_with(|event| event.set_raw(raw))?;
        self.metrics.record_incoming(1);
        Ok(())
    }

    /// Slots currently occupied.
    pub fn usage(&self) -> usize {
        self.ring.capacity() - self.ring.remaining_capacity()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.ring.remaining_capacity()
    }

    pub(crate) fn ring(&self) -> &Arc<RingBuffer<MessageEvent>> {
        &self.ring
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("capacity", &self.capacity())
            .field("usage", &self.usage())
            .finish()
    }
}
