//! Sluice - Buffered, journaled ingestion pipeline on lock-free ring buffers

pub mod codec;
pub mod config;
pub mod disruptor;
pub mod error;
pub mod fault;
pub mod journal;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod stages;

// Re-export main components
pub use codec::{Codec, CodecRegistry, LinesCodec, RawCodec};
pub use config::{BackoffConfig, EnvVars, PipelineConfig};
pub use disruptor::{RingBuffer, RingBufferConfig, WaitStrategyKind};
pub use error::{Result, SluiceError};
pub use fault::{Fault, FaultHandler, LoggingFaultHandler};
pub use journal::{InMemoryJournal, Journal, JournalEntry, JournalReadEntry, JournalSignal};
pub use message::{Message, MessageEvent, MessageId, RawMessage};
pub use metrics::{MetricsSink, PipelineMetrics, TimerStats};
pub use pipeline::Pipeline;
pub use stages::{InputBuffer, ProcessBuffer, ProcessingPipeline};
