use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sluice::{CodecRegistry, Journal, Pipeline, PipelineConfig, ProcessingPipeline, Result};
use sluice_journal::{MmapJournal, MmapJournalOptions};
use tracing::{info, warn};

use crate::receiver::UdpReceiver;
use crate::settings::ServerSettings;

const TICK: Duration = Duration::from_millis(50);

/// UDP receivers, the pipeline behind them and the journal it writes to.
pub struct Server {
    pipeline: Pipeline,
    journal: Option<Arc<MmapJournal>>,
    receivers: Vec<(SocketAddr, JoinHandle<u64>)>,
    local_addrs: Vec<SocketAddr>,
    running: Arc<AtomicBool>,
    usage_log_interval: Duration,
    stopped: bool,
}

impl Server {
    pub fn start(
        settings: ServerSettings,
        config: PipelineConfig,
        codecs: CodecRegistry,
        output: Arc<dyn ProcessingPipeline>,
    ) -> Result<Self> {
        settings.validate()?;

        let journal = if config.journal_enabled {
            if let Some(parent) = settings.journal_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let options = MmapJournalOptions {
                capacity: settings.journal_capacity_bytes,
                flush_on_write: settings.journal_flush_on_write,
            };
            Some(Arc::new(MmapJournal::open_or_create(&settings.journal_path, options)?))
        } else {
            None
        };

        let pipeline = Pipeline::start(
            config,
            journal.clone().map(|j| j as Arc<dyn Journal>),
            codecs,
            output,
        )?;

        let running = Arc::new(AtomicBool::new(true));
        let mut receivers = Vec::with_capacity(settings.bind.len());
        let mut local_addrs = Vec::with_capacity(settings.bind.len());
        for addr in &settings.bind {
            let receiver = UdpReceiver::bind(*addr, settings.recv_buffer_bytes)?;
            let local = receiver.local_addr();
            let handle = receiver.spawn(pipeline.input().clone(), running.clone(), settings.max_datagram_bytes)?;
            local_addrs.push(local);
            receivers.push((local, handle));
        }

        info!(addrs = ?local_addrs, journal = ?settings.journal_path, "Server started");
        Ok(Self {
            pipeline,
            journal,
            receivers,
            local_addrs,
            running,
            usage_log_interval: settings.usage_log_interval,
            stopped: false,
        })
    }

    /// Addresses actually bound, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn log_usage(&self) {
        let input = self.pipeline.input();
        let process = self.pipeline.process_buffer();
        let metrics = self.pipeline.metrics();
        info!(
            input_usage = input.usage(),
            input_capacity = input.capacity(),
            process_usage = process.usage(),
            process_capacity = process.capacity(),
            uncommitted = self.journal.as_ref().map_or(0, |j| j.uncommitted_entries()),
            incoming = metrics.incoming_messages(),
            decoded = metrics.decoded_messages(),
            journal_write_failures = metrics.journal_write_failures(),
            "Buffer usage"
        );
    }

    /// Block until `shutdown` is set, logging usage periodically, then stop.
    pub fn run_until(&mut self, shutdown: &AtomicBool) {
        let mut last_log = Instant::now();
        while !shutdown.load(Ordering::Acquire) {
            thread::sleep(TICK);
            if last_log.elapsed() >= self.usage_log_interval {
                self.log_usage();
                last_log = Instant::now();
            }
        }
        self.shutdown();
    }

    /// Stop receiving, drain the pipeline and flush the journal.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.running.store(false, Ordering::Release);
        for (addr, handle) in self.receivers.drain(..) {
            if handle.join().is_err() {
                warn!(%addr, "Receiver thread terminated abnormally");
            }
        }
        self.pipeline.shutdown();

        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!("Unable to flush journal: {}", err);
            }
        }
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
