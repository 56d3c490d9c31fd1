//! Delivery verification for end-to-end tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sluice::{Message, MessageId, ProcessingPipeline, Result, SluiceError};

/// Tracks which message ids were sent and how often each arrived.
#[derive(Default)]
pub struct DeliveryVerifier {
    expected: Mutex<HashSet<MessageId>>,
    delivered: Mutex<HashMap<MessageId, u64>>,
}

impl DeliveryVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an id that must arrive exactly once
    pub fn expect(&self, id: MessageId) {
        self.expected.lock().insert(id);
    }

    /// Record an arrival
    pub fn record(&self, id: MessageId) {
        *self.delivered.lock().entry(id).or_insert(0) += 1;
    }

    pub fn report(&self) -> DeliveryReport {
        let expected = self.expected.lock();
        let delivered = self.delivered.lock();

        let mut missing: Vec<_> = expected
            .iter()
            .filter(|id| !delivered.contains_key(id))
            .copied()
            .collect();
        missing.sort();
        let mut duplicates: Vec<_> = delivered
            .iter()
            .filter(|(_, &count)| count > 1)
            .map(|(&id, _)| id)
            .collect();
        duplicates.sort();
        let mut unexpected: Vec<_> = delivered
            .keys()
            .filter(|id| !expected.contains(id))
            .copied()
            .collect();
        unexpected.sort();

        DeliveryReport {
            expected: expected.len() as u64,
            delivered: delivered.values().sum(),
            missing,
            duplicates,
            unexpected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub expected: u64,
    /// Arrivals, counting duplicates
    pub delivered: u64,
    pub missing: Vec<MessageId>,
    pub duplicates: Vec<MessageId>,
    pub unexpected: Vec<MessageId>,
}

impl DeliveryReport {
    /// Every expected id arrived exactly once and nothing else arrived.
    pub fn is_exactly_once(&self) -> bool {
        self.missing.is_empty()
            && self.duplicates.is_empty()
            && self.unexpected.is_empty()
            && self.delivered == self.expected
    }
}

type Rejector = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// Processing pipeline that keeps every message it is handed.
#[derive(Default)]
pub struct CollectingPipeline {
    messages: Mutex<Vec<Message>>,
    handled: AtomicU64,
    reject: Option<Rejector>,
}

impl CollectingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `handle` for messages matching `predicate`. They are not collected.
    pub fn rejecting<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self {
            reject: Some(Box::new(predicate)),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.handled.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.lock().iter().map(|m| m.id()).collect()
    }
}

impl ProcessingPipeline for CollectingPipeline {
    fn handle(&self, message: Message) -> Result<()> {
        if let Some(reject) = &self.reject {
            if reject(&message) {
                return Err(SluiceError::processing(format!(
                    "rejected message {}",
                    message.id()
                )));
            }
        }
        self.messages.lock().push(message);
        self.handled.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_exactly_once() {
        let verifier = DeliveryVerifier::new();
        let ids: Vec<_> = (0..3).map(|_| MessageId::generate()).collect();
        for id in &ids {
            verifier.expect(*id);
        }
        for id in &ids {
            verifier.record(*id);
        }
        let report = verifier.report();
        assert!(report.is_exactly_once());
        assert_eq!(report.delivered, 3);
    }

    #[test]
    fn test_missing_duplicate_unexpected() {
        let verifier = DeliveryVerifier::new();
        let a = MessageId::from_u128(1);
        let b = MessageId::from_u128(2);
        let stray = MessageId::from_u128(3);
        verifier.expect(a);
        verifier.expect(b);
        verifier.record(a);
        verifier.record(a);
        verifier.record(stray);

        let report = verifier.report();
        assert!(!report.is_exactly_once());
        assert_eq!(report.missing, vec![b]);
        assert_eq!(report.duplicates, vec![a]);
        assert_eq!(report.unexpected, vec![stray]);
        assert_eq!(report.delivered, 3);
    }

    #[test]
    fn test_collecting_pipeline_rejects() {
        let pipeline = CollectingPipeline::rejecting(|m| m.message().contains("bad"));
        let id = MessageId::generate();
        assert!(pipeline.handle(Message::new(id, "good", SystemTime::now())).is_ok());
        assert!(pipeline.handle(Message::new(id, "bad", SystemTime::now())).is_err());
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.ids(), vec![id]);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
