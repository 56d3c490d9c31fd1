//! Assembles rings, worker pools and the journal into a running pipeline.
//!
//! With the journal on:
//!
//! ```text
//! producers -> ring A -> encode pool -> journal writer -> journal
//!                                                           |
//!                                           journal reader <-
//!                                                 |
//!                                                 v
//!                                  ring B -> decode pool -> ProcessingPipeline
//! ```
//!
//! With the journal off the encode pool and writer are replaced by a dispatch pool
//! moving raw messages from ring A into ring B directly.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::CodecRegistry;
use crate::config::PipelineConfig;
use crate::disruptor::{ProcessorGroup, RingBuffer};
use crate::error::{Result, SluiceError};
use crate::fault::{FaultHandler, LoggingFaultHandler};
use crate::journal::{Journal, JournalSignal};
use crate::message::{MessageEvent, RawMessage};
use crate::metrics::PipelineMetrics;
use crate::stages::{
    DecodingHandler, DirectDispatchHandler, EncodingHandler, InputBuffer, JournalReader,
    JournalWriter, ProcessBuffer, ProcessingPipeline,
};

pub struct Pipeline {
    input: InputBuffer,
    process: ProcessBuffer,
    /// Groups on ring A, upstream first
    input_groups: Vec<ProcessorGroup>,
    reader: Option<JournalReader>,
    decoders: ProcessorGroup,
    journal: Option<Arc<dyn Journal>>,
    signal: Option<Arc<JournalSignal>>,
    metrics: Arc<PipelineMetrics>,
    stopped: bool,
}

impl Pipeline {
    /// Start every stage with fresh metrics and the logging fault handler.
    ///
    /// `journal` is required when `config.journal_enabled` is set and ignored otherwise.
    pub fn start(
        config: PipelineConfig,
        journal: Option<Arc<dyn Journal>>,
        codecs: CodecRegistry,
        output: Arc<dyn ProcessingPipeline>,
    ) -> Result<Self> {
        Self::start_with(
            config,
            journal,
            codecs,
            output,
            Arc::new(PipelineMetrics::new()),
            Arc::new(LoggingFaultHandler),
        )
    }

    pub fn start_with(
        config: PipelineConfig,
        journal: Option<Arc<dyn Journal>>,
        codecs: CodecRegistry,
        output: Arc<dyn ProcessingPipeline>,
        metrics: Arc<PipelineMetrics>,
        fault: Arc<dyn FaultHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let journal = match (config.journal_enabled, journal) {
            (true, Some(journal)) => Some(journal),
            (true, None) => {
                return Err(SluiceError::config("Journal is enabled but no journal was supplied"))
            }
            (false, Some(_)) => {
                warn!("Journal is disabled, ignoring the supplied journal");
                None
            }
            (false, None) => None,
        };
        let codecs = Arc::new(codecs);

        let process_ring: Arc<RingBuffer<MessageEvent>> = Arc::new(RingBuffer::new(&config.process)?);
        let process = ProcessBuffer::new(process_ring.clone());
        let decode_handlers = (0..config.process.num_consumers)
            .map(|_| {
                DecodingHandler::new(codecs.clone(), output.clone(), journal.clone(), metrics.clone())
            })
            .collect();
        let decoders =
            ProcessorGroup::spawn("decode", &process_ring, Vec::new(), decode_handlers, fault.clone())?;
        process_ring.add_gating_cursors(&decoders.cursors());

        let input_ring: Arc<RingBuffer<MessageEvent>> = Arc::new(RingBuffer::new(&config.input)?);
        let input = InputBuffer::new(input_ring.clone(), metrics.clone());

        let mut input_groups = Vec::with_capacity(2);
        let mut reader = None;
        let mut signal = None;

        match &journal {
            Some(journal) => {
                let journal_signal = Arc::new(JournalSignal::new());
                let encode_handlers = (0..config.input.num_consumers)
                    .map(|_| EncodingHandler::new(metrics.clone()))
                    .collect();
                let encoders =
                    ProcessorGroup::spawn("encode", &input_ring, Vec::new(), encode_handlers, fault.clone())?;

                let writer = JournalWriter::new(
                    journal.clone(),
                    journal_signal.clone(),
                    metrics.clone(),
                    config.retry.clone(),
                );
                let writers = ProcessorGroup::spawn(
                    "journal-writer",
                    &input_ring,
                    encoders.cursors(),
                    vec![writer],
                    fault.clone(),
                )?;
                input_ring.add_gating_cursors(&writers.cursors());
                input_groups.push(encoders);
                input_groups.push(writers);

                reader = Some(JournalReader::spawn(
                    journal.clone(),
                    journal_signal.clone(),
                    process.clone(),
                    metrics.clone(),
                    config.journal_read_batch_size,
                    config.journal_poll_interval,
                )?);
                signal = Some(journal_signal);
            }
            None => {
                let dispatch_handlers = (0..config.input.num_consumers)
                    .map(|_| DirectDispatchHandler::new(process.clone()))
                    .collect();
                let dispatchers = ProcessorGroup::spawn(
                    "dispatch",
                    &input_ring,
                    Vec::new(),
                    dispatch_handlers,
                    fault.clone(),
                )?;
                input_ring.add_gating_cursors(&dispatchers.cursors());
                input_groups.push(dispatchers);
            }
        }

        info!(
            journal_enabled = journal.is_some(),
            input_size = config.input.size,
            input_processors = config.input.num_consumers,
            input_wait_strategy = %config.input.wait_strategy,
            process_size = config.process.size,
            processors = config.process.num_consumers,
            process_wait_strategy = %config.process.wait_strategy,
            "Pipeline started"
        );

        Ok(Self {
            input,
            process,
            input_groups,
            reader,
            decoders,
            journal,
            signal,
            metrics,
            stopped: false,
        })
    }

    /// Handle for producers. Clone it freely.
    pub fn input(&self) -> &InputBuffer {
        &self.input
    }

    pub fn insert(&self, raw: RawMessage) -> Result<()> {
        self.input.insert(raw)
    }

    pub fn process_buffer(&self) -> &ProcessBuffer {
        &self.process
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn journal(&self) -> Option<&Arc<dyn Journal>> {
        self.journal.as_ref()
    }

    /// Semaphore released once per journal batch. `None` without a journal.
    pub fn journal_signal(&self) -> Option<&Arc<JournalSignal>> {
        self.signal.as_ref()
    }

    pub fn is_journal_enabled(&self) -> bool {
        self.journal.is_some()
    }

    /// Stop accepting input and drain every stage in order: ring A, the journal
    /// reader, then ring B. Messages already accepted are processed before it returns.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Shutting down pipeline");

        let input_ring = self.input.ring().clone();
        input_ring.halt();
        loop {
            let upto = input_ring.cursor();
            for group in &self.input_groups {
                group.drain(upto);
            }
            if input_ring.cursor() == upto {
                break;
            }
        }
        for group in &mut self.input_groups {
            group.halt();
            group.join();
        }

        if let Some(reader) = &mut self.reader {
            reader.stop();
        }

        let process_ring = self.process.ring().clone();
        process_ring.halt();
        let upto = process_ring.cursor();
        self.decoders.drain(upto);
        self.decoders.halt();
        self.decoders.join();

        info!(
            incoming = self.metrics.incoming_messages(),
            decoded = self.metrics.decoded_messages(),
            journal_batches = self.metrics.journal_batches(),
            "Pipeline stopped"
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("input", &self.input)
            .field("process", &self.process)
            .field("journal_enabled", &self.is_journal_enabled())
            .field("stopped", &self.stopped)
            .finish()
    }
}
