use std::sync::Arc;

use tracing::{error, trace};

use crate::disruptor::{EventHandler, Sequence};
use crate::error::Result;
use crate::message::MessageEvent;
use crate::metrics::PipelineMetrics;

/// Replaces each raw message with its identity bytes and journal form.
pub struct EncodingHandler {
    metrics: Arc<PipelineMetrics>,
}

impl EncodingHandler {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { metrics }
    }
}

impl EventHandler<MessageEvent> for EncodingHandler {
    fn on_event(&mut self, event: &mut MessageEvent, sequence: Sequence, _end_of_batch: bool) -> Result<()> {
        let Some(raw) = event.take_raw() else {
            trace!(sequence, "Event carries no raw message");
            return Ok(());
        };

        match raw.into_journal_form() {
            Ok((id_bytes, encoded)) => {
                self.metrics.record_encoded_bytes(encoded.len() as u64);
                event.set_journal_form(id_bytes, encoded);
            }
            Err(err) => {
                self.metrics.record_encode_failure(1);
                error!(sequence, "Unable to encode message for the journal, dropping it: {}", err);
            }
        }
        Ok(())
    }
}
