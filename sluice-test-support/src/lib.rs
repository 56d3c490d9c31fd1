//! Test support for sluice - failing journals, delivery checks, waiting helpers.

pub mod chaos;
pub mod verify;

pub use chaos::{FailurePattern, FlakyJournal};
pub use verify::{wait_until, CollectingPipeline, DeliveryReport, DeliveryVerifier};
