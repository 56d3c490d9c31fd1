use sluice::{Message, ProcessingPipeline, Result};
use tracing::info;

/// Processing pipeline that logs each message under the `sluice::output` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOutput;

impl ProcessingPipeline for LoggingOutput {
    fn handle(&self, message: Message) -> Result<()> {
        info!(
            target: "sluice::output",
            id = %message.id(),
            source = message.source(),
            offset = ?message.journal_offset(),
            "{}",
            message.message()
        );
        Ok(())
    }
}
