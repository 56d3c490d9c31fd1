use tracing::trace;

use crate::disruptor::{EventHandler, Sequence};
use crate::error::Result;
use crate::message::MessageEvent;
use crate::stages::ProcessBuffer;

/// Moves raw messages straight from ring A into ring B, skipping the journal.
pub struct DirectDispatchHandler {
    output: ProcessBuffer,
}

impl DirectDispatchHandler {
    pub fn new(output: ProcessBuffer) -> Self {
        Self { output }
    }
}

impl EventHandler<MessageEvent> for DirectDispatchHandler {
    fn on_event(&mut self, event: &mut MessageEvent, sequence: Sequence, _end_of_batch: bool) -> Result<()> {
        match event.take_raw() {
            Some(raw) => self.output.insert_blocking(raw),
            None => {
                trace!(sequence, "Event carries no raw message");
                Ok(())
            }
        }
    }
}
