//! Fault isolation for event processors.
//!
//! A fault raised while handling one event is reported here and the processor moves
//! on to the next event. Faults while starting or stopping a processor are reported
//! separately; they mean a worker may not be running at all.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::disruptor::Sequence;
use crate::error::SluiceError;

/// Something that went wrong inside a handler.
#[derive(Debug)]
pub enum Fault {
    Error(SluiceError),
    Panic(String),
}

impl Fault {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panic(message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{}", err),
            Self::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

impl From<SluiceError> for Fault {
    fn from(err: SluiceError) -> Self {
        Self::Error(err)
    }
}

/// Receives faults from every processor attached to a ring buffer.
pub trait FaultHandler: Send + Sync {
    fn handle_event_fault(&self, stage: &str, fault: &Fault, sequence: Sequence, event: &dyn fmt::Debug);

    fn handle_start_fault(&self, stage: &str, fault: &Fault);

    fn handle_shutdown_fault(&self, stage: &str, fault: &Fault);
}

/// Logs every fault and keeps the processor running.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFaultHandler;

impl FaultHandler for LoggingFaultHandler {
    fn handle_event_fault(&self, stage: &str, fault: &Fault, sequence: Sequence, event: &dyn fmt::Debug) {
        error!(
            stage,
            sequence,
            event = %describe_event(event),
            "Unable to process event: {}",
            fault
        );
    }

    fn handle_start_fault(&self, stage: &str, fault: &Fault) {
        error!(stage, "Exception starting processor, worker may not be running: {}", fault);
    }

    fn handle_shutdown_fault(&self, stage: &str, fault: &Fault) {
        error!(stage, "Exception during processor shutdown: {}", fault);
    }
}

/// Best-effort `Debug` rendering; a panicking formatter yields a placeholder.
pub fn describe_event(event: &dyn fmt::Debug) -> String {
    panic::catch_unwind(AssertUnwindSafe(|| format!("{:?}", event)))
        .unwrap_or_else(|_| "<event description unavailable>".to_string())
}
