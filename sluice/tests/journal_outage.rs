//! Journal failures: retries, backpressure and recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sluice::disruptor::{RingBufferConfig, WaitStrategyKind};
use sluice::{BackoffConfig, CodecRegistry, Journal, Pipeline, PipelineConfig, RawMessage};
use sluice_test_support::chaos::{FailurePattern, FlakyJournal};
use sluice_test_support::{wait_until, CollectingPipeline, DeliveryVerifier};

fn config(input_size: usize) -> PipelineConfig {
    PipelineConfig::new(
        RingBufferConfig::new(input_size)
            .unwrap()
            .with_consumers(2)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Blocking),
        RingBufferConfig::new(64).unwrap().with_consumers(2).unwrap(),
    )
    .unwrap()
    .with_retry(BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(10)).unwrap())
}

#[test]
fn test_failed_writes_are_retried_until_the_batch_lands_once() {
    let journal = Arc::new(FlakyJournal::in_memory(FailurePattern::FirstN { count: 5 }));
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(64),
        Some(journal.clone()),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let verifier = DeliveryVerifier::new();
    for i in 0..50 {
        let raw = RawMessage::new(format!("retry {}", i).into_bytes());
        verifier.expect(raw.id());
        pipeline.insert(raw).unwrap();
    }
    pipeline.shutdown();

    for id in output.ids() {
        verifier.record(id);
    }
    assert!(verifier.report().is_exactly_once());

    assert_eq!(journal.failures(), 5);
    assert_eq!(pipeline.metrics().journal_write_failures(), 5);
    // Failed attempts never reach the journal, so every entry is stored once.
    assert_eq!(journal.inner().next_offset(), 50);
    let attempts = journal.attempts();
    let written: usize = attempts.iter().filter(|a| a.succeeded).map(|a| a.entries).sum();
    assert_eq!(written, 50);
    assert_eq!(journal.committed_offset(), Some(49));
}

#[test]
fn test_producers_block_while_journal_is_down() {
    let journal = Arc::new(FlakyJournal::in_memory(FailurePattern::Always));
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(8),
        Some(journal.clone()),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let inserted = Arc::new(AtomicUsize::new(0));
    let producer = {
        let input = pipeline.input().clone();
        let inserted = inserted.clone();
        thread::spawn(move || {
            for i in 0..20 {
                input.insert(RawMessage::new(format!("held {}", i).into_bytes())).unwrap();
                inserted.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // The writer never advances past its first batch, so the ring fills and stays full.
    assert!(wait_until(Duration::from_secs(5), || inserted.load(Ordering::SeqCst) == 8));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(inserted.load(Ordering::SeqCst), 8);
    assert_eq!(pipeline.input().usage(), pipeline.input().capacity());
    assert!(output.is_empty());
    assert!(journal.failures() > 0);

    journal.set_pattern(FailurePattern::None);
    producer.join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || output.len() == 20));

    pipeline.shutdown();
    assert_eq!(journal.inner().next_offset(), 20);
    assert_eq!(journal.uncommitted_entries(), 0);
}

#[test]
fn test_random_failures_lose_nothing() {
    let journal = Arc::new(FlakyJournal::in_memory(FailurePattern::Random { probability: 0.3 }));
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(32),
        Some(journal.clone()),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let verifier = Arc::new(DeliveryVerifier::new());
    let handles: Vec<_> = (0..4)
        .map(|p| {
            let input = pipeline.input().clone();
            let verifier = verifier.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let raw = RawMessage::new(format!("p{} m{}", p, i).into_bytes());
                    verifier.expect(raw.id());
                    input.insert(raw).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    pipeline.shutdown();

    for id in output.ids() {
        verifier.record(id);
    }
    let report = verifier.report();
    assert!(report.is_exactly_once(), "{:?}", report);
    assert_eq!(journal.inner().next_offset(), 400);
}
