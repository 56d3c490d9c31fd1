//! End-to-end delivery through both pipeline modes.

use std::sync::Arc;
use std::thread;

use sluice::disruptor::{RingBufferConfig, WaitStrategyKind};
use sluice::codec::LINES_CODEC;
use sluice::{CodecRegistry, InMemoryJournal, Journal, Pipeline, PipelineConfig, RawMessage};
use sluice_test_support::{CollectingPipeline, DeliveryVerifier};

const PRODUCERS: usize = 10;
const MESSAGES_PER_PRODUCER: usize = 100;

fn config(journal_enabled: bool) -> PipelineConfig {
    PipelineConfig::new(
        RingBufferConfig::new(128)
            .unwrap()
            .with_consumers(2)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Blocking),
        RingBufferConfig::new(128)
            .unwrap()
            .with_consumers(4)
            .unwrap()
            .with_wait_strategy(WaitStrategyKind::Yielding),
    )
    .unwrap()
    .with_journal(journal_enabled)
}

/// Insert from `PRODUCERS` threads and register every id with the verifier.
fn produce(pipeline: &Pipeline, verifier: &Arc<DeliveryVerifier>) {
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let input = pipeline.input().clone();
            let verifier = verifier.clone();
            thread::spawn(move || {
                for i in 0..MESSAGES_PER_PRODUCER {
                    let raw = RawMessage::new(format!("producer {} message {}", producer, i).into_bytes())
                        .with_remote(format!("10.0.0.{}:5140", producer + 1).parse().unwrap());
                    verifier.expect(raw.id());
                    input.insert(raw).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_durable_pipeline_delivers_every_message_once() {
    let journal = Arc::new(InMemoryJournal::new());
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(true),
        Some(journal.clone()),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let verifier = Arc::new(DeliveryVerifier::new());
    produce(&pipeline, &verifier);
    pipeline.shutdown();

    for id in output.ids() {
        verifier.record(id);
    }
    let report = verifier.report();
    assert!(report.is_exactly_once(), "{:?}", report);
    assert_eq!(report.delivered, 1000);

    assert_eq!(journal.next_offset(), 1000);
    assert_eq!(journal.committed_offset(), Some(999));
    assert_eq!(journal.uncommitted_entries(), 0);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.incoming_messages(), 1000);
    assert_eq!(metrics.journal_entries(), 1000);
    assert_eq!(metrics.decoded_messages(), 1000);
    assert!(metrics.journal_batches() >= 1);
    assert!(metrics.journal_batches() <= 1000);
}

#[test]
fn test_durable_messages_carry_journal_offsets_and_sources() {
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(true),
        Some(Arc::new(InMemoryJournal::new())),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let verifier = Arc::new(DeliveryVerifier::new());
    produce(&pipeline, &verifier);
    pipeline.shutdown();

    let messages = output.messages();
    let mut offsets: Vec<_> = messages.iter().filter_map(|m| m.journal_offset()).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (0..1000).collect::<Vec<u64>>());
    assert!(messages.iter().all(|m| m.source().starts_with("10.0.0.")));
    assert!(messages.iter().all(|m| m.receive_time().is_some()));
}

#[test]
fn test_non_durable_pipeline_delivers_every_message_once() {
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(false),
        None,
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let verifier = Arc::new(DeliveryVerifier::new());
    produce(&pipeline, &verifier);
    pipeline.shutdown();

    for id in output.ids() {
        verifier.record(id);
    }
    let report = verifier.report();
    assert!(report.is_exactly_once(), "{:?}", report);
    assert!(output.messages().iter().all(|m| m.journal_offset().is_none()));
    assert_eq!(pipeline.metrics().journal_batches(), 0);
}

#[test]
fn test_usage_stays_within_capacity() {
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(true),
        Some(Arc::new(InMemoryJournal::new())),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let input = pipeline.input().clone();
    for i in 0..500 {
        input.insert(RawMessage::new(format!("m{}", i).into_bytes())).unwrap();
        assert!(input.usage() <= input.capacity());
        assert!(pipeline.process_buffer().usage() <= pipeline.process_buffer().capacity());
    }
    pipeline.shutdown();
    assert_eq!(output.len(), 500);
}

#[test]
fn test_multi_line_payloads_fan_out_through_the_journal() {
    let journal = Arc::new(InMemoryJournal::new());
    let output = Arc::new(CollectingPipeline::new());
    let mut pipeline = Pipeline::start(
        config(true),
        Some(journal.clone()),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    for batch in 0..20 {
        let body = format!("b{} one\nb{} two\n\nb{} three\n", batch, batch, batch);
        pipeline
            .insert(RawMessage::new(body.into_bytes()).with_codec(LINES_CODEC))
            .unwrap();
    }
    pipeline.shutdown();

    assert_eq!(output.len(), 60);
    assert_eq!(journal.next_offset(), 20);
    assert_eq!(journal.committed_offset(), Some(19));
    let metrics = pipeline.metrics();
    assert_eq!(metrics.decoded_messages(), 60);
    assert_eq!(metrics.decode_time().count(), 20);
    let mut lines: Vec<_> = output.messages().iter().map(|m| m.message().to_string()).collect();
    lines.sort();
    assert!(lines.contains(&"b7 two".to_string()));
    assert!(lines.iter().all(|line| !line.is_empty()));
}
