//! Pipeline stages.
//!
//! - `InputBuffer` - producers insert raw messages into ring A
//! - `EncodingHandler` - serializes raw messages into their journal form
//! - `JournalWriter` - batches journal forms and writes them, retrying forever
//! - `JournalReader` - feeds journaled messages into ring B
//! - `DirectDispatchHandler` - moves raw messages from ring A to ring B when the journal is off
//! - `ProcessBuffer` / `DecodingHandler` - ring B and the decode workers behind it

mod dispatch;
mod encoding;
mod input;
mod journal_reader;
mod journal_writer;
mod process;

pub use dispatch::DirectDispatchHandler;
pub use encoding::EncodingHandler;
pub use input::InputBuffer;
pub use journal_reader::JournalReader;
pub use journal_writer::{Backoff, JournalWriter};
pub use process::{DecodingHandler, ProcessBuffer, ProcessingPipeline};
