//! Datagrams in, decoded messages out.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use sluice::disruptor::RingBufferConfig;
use sluice::message::{FieldValue, FIELD_REMOTE_IP, FIELD_REMOTE_PORT};
use sluice::{CodecRegistry, PipelineConfig};
use sluice_server::{Server, ServerSettings};
use sluice_test_support::{wait_until, CollectingPipeline};
use tempfile::tempdir;

fn settings(dir: &std::path::Path) -> ServerSettings {
    ServerSettings {
        bind: vec!["127.0.0.1:0".parse().unwrap()],
        recv_buffer_bytes: 1024 * 1024,
        journal_path: dir.join("journal").join("sluice.log"),
        journal_capacity_bytes: 1024 * 1024,
        ..ServerSettings::default()
    }
}

fn config(journal_enabled: bool) -> PipelineConfig {
    PipelineConfig::new(
        RingBufferConfig::new(256).unwrap().with_consumers(2).unwrap(),
        RingBufferConfig::new(256).unwrap().with_consumers(2).unwrap(),
    )
    .unwrap()
    .with_journal(journal_enabled)
}

fn send_all(target: std::net::SocketAddr, count: usize) -> std::net::SocketAddr {
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..count {
        client.send_to(format!("<13>datagram {}\n", i).as_bytes(), target).unwrap();
        // Loopback drops datagrams when bursts overrun the socket buffer
        if i % 50 == 49 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    client.local_addr().unwrap()
}

#[test]
fn test_datagrams_flow_through_journal() {
    let dir = tempdir().unwrap();
    let output = Arc::new(CollectingPipeline::new());
    let mut server = Server::start(
        settings(dir.path()),
        config(true),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();

    let target = server.local_addrs()[0];
    let client = send_all(target, 200);
    assert!(wait_until(Duration::from_secs(10), || output.len() == 200));
    server.shutdown();

    let messages = output.messages();
    assert!(messages.iter().all(|m| m.source() == "127.0.0.1"));
    assert!(messages.iter().all(|m| !m.message().ends_with('\n')));
    assert!(messages.iter().all(|m| m.journal_offset().is_some()));
    assert_eq!(
        messages[0].field(FIELD_REMOTE_IP),
        Some(&FieldValue::Str("127.0.0.1".to_string()))
    );
    assert_eq!(
        messages[0].field(FIELD_REMOTE_PORT),
        Some(&FieldValue::Int(client.port() as i64))
    );
    assert!(dir.path().join("journal").join("sluice.log").exists());
}

#[test]
fn test_datagrams_flow_without_journal() {
    let dir = tempdir().unwrap();
    let output = Arc::new(CollectingPipeline::new());
    let mut server = Server::start(
        settings(dir.path()),
        config(false),
        CodecRegistry::with_defaults(),
        output.clone(),
    )
    .unwrap();
    assert!(!server.pipeline().is_journal_enabled());

    send_all(server.local_addrs()[0], 50);
    assert!(wait_until(Duration::from_secs(10), || output.len() == 50));
    server.log_usage();
    server.shutdown();
    server.shutdown();
    assert!(!dir.path().join("journal").exists());
}
