// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capture pipeline.
//!
//! Each captured packet is encoded into a trace record, classified, and
//! pushed to the queue when interesting. Packets are handled one at a time
//! in capture order on the calling thread.

use crate::capture::{CaptureError, CaptureEvent, PacketSource};
use crate::classify::Classifier;
use crate::queue::{QueueClient, QueueTransport};
use crate::record::{CaptureTime, RecordEncoder, RecordError};
use crate::shutdown::ShutdownToken;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Pipeline counters.
///
/// `captured >= interesting >= delivered` holds at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    /// Packets handed to the dispatcher.
    pub captured: u64,
    /// Packets classified as interesting.
    pub interesting: u64,
    /// Records acknowledged by the queue.
    pub delivered: u64,
    /// Packets dropped because the record would exceed the buffer.
    pub oversized: u64,
}

impl fmt::Display for PipelineCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets captured, {} interesting, {} delivered",
            self.captured, self.interesting, self.delivered
        )
    }
}

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Dropped before classification (record overflow).
    Oversized,
    /// Dropped before classification (record could not be written).
    EncodeFailed,
    /// Classified as not interesting.
    Filtered,
    /// Pushed to the queue.
    Delivered,
    /// Interesting, but the push failed; the record is lost.
    DeliveryFailed,
}

/// Owns the pipeline state for the lifetime of the process.
pub struct Dispatcher<T: QueueTransport> {
    encoder: RecordEncoder,
    classifier: Classifier,
    queue: QueueClient<T>,
    counters: PipelineCounters,
    shutdown: ShutdownToken,
    stats_interval: Option<Duration>,
}

impl<T: QueueTransport> Dispatcher<T> {
    pub fn new(
        encoder: RecordEncoder,
        classifier: Classifier,
        queue: QueueClient<T>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            encoder,
            classifier,
            queue,
            counters: PipelineCounters::default(),
            shutdown,
            stats_interval: None,
        }
    }

    /// Log progress every `interval` while running. Zero disables.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Handle one packet stamped with the current time.
    pub fn dispatch(&mut self, packet: &[u8]) -> DispatchOutcome {
        self.dispatch_at(packet, CaptureTime::now())
    }

    /// Handle one packet stamped with `time`.
    pub fn dispatch_at(&mut self, packet: &[u8], time: CaptureTime) -> DispatchOutcome {
        self.counters.captured += 1;

        let record = match self.encoder.encode(packet, time) {
            Ok(record) => record,
            Err(RecordError::Overflow { needed, capacity }) => {
                warn!(
                    "Dropping packet: record of {} bytes exceeds buffer capacity {}",
                    needed, capacity
                );
                self.counters.oversized += 1;
                return DispatchOutcome::Oversized;
            }
            Err(e) => {
                warn!("Dropping packet: {}", e);
                return DispatchOutcome::EncodeFailed;
            }
        };

        let verdict = self.classifier.classify(record.payload());
        trace!(
            "Packet of {} bytes: call_id={} interesting_method={}",
            packet.len(),
            verdict.has_call_id,
            verdict.has_interesting_method
        );
        if !verdict.is_interesting() {
            return DispatchOutcome::Filtered;
        }

        self.counters.interesting += 1;
        match self.queue.push(&record) {
            Ok(()) => {
                self.counters.delivered += 1;
                DispatchOutcome::Delivered
            }
            Err(e) => {
                debug!("Record lost: {}", e);
                DispatchOutcome::DeliveryFailed
            }
        }
    }

    /// Pull packets from `source` until shutdown or the source closes.
    ///
    /// A capture I/O error ends the loop and is returned; counters stay
    /// available through [`Dispatcher::counters`].
    pub fn run<S: PacketSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<PipelineCounters, CaptureError> {
        let mut last_report = Instant::now();

        while !self.shutdown.is_requested() {
            match source.next_event()? {
                CaptureEvent::Packet(packet) => {
                    self.dispatch(&packet);
                }
                CaptureEvent::Idle => {}
                CaptureEvent::Closed => {
                    debug!("Capture source closed");
                    break;
                }
            }

            if let Some(interval) = self.stats_interval {
                if last_report.elapsed() >= interval {
                    info!(
                        "Progress: {} delivered, {} captured, {} interesting",
                        self.counters.delivered, self.counters.captured, self.counters.interesting
                    );
                    last_report = Instant::now();
                }
            }
        }

        Ok(self.counters)
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    pub fn queue(&self) -> &QueueClient<T> {
        &self.queue
    }

    /// Mutable queue access, e.g. to connect before capture starts.
    pub fn queue_mut(&mut self) -> &mut QueueClient<T> {
        &mut self.queue
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueConnection, QueueError};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct MemoryQueue(Rc<RefCell<Vec<Vec<u8>>>>);

    impl QueueTransport for MemoryQueue {
        type Connection = MemoryQueue;

        fn connect(&self) -> Result<MemoryQueue, QueueError> {
            Ok(self.clone())
        }

        fn endpoint(&self) -> String {
            "memory".into()
        }
    }

    impl QueueConnection for MemoryQueue {
        fn ping(&mut self) -> Result<String, QueueError> {
            Ok("PONG".into())
        }

        fn push(&mut self, _key: &str, record: &[u8]) -> Result<(), QueueError> {
            self.0.borrow_mut().push(record.to_vec());
            Ok(())
        }
    }

    fn dispatcher(capacity: usize) -> (Dispatcher<MemoryQueue>, MemoryQueue) {
        let store = MemoryQueue::default();
        let shutdown = ShutdownToken::new();
        let mut queue = QueueClient::new(store.clone(), "sipcap:input", shutdown.clone());
        queue.connect().expect("connect");
        let dispatcher = Dispatcher::new(
            RecordEncoder::new(capacity),
            Classifier::default(),
            queue,
            shutdown,
        );
        (dispatcher, store)
    }

    const INVITE: &[u8] = b"INVITE sip:b@x SIP/2.0\r\nCall-ID: abc\r\nCSeq: 1 INVITE\r\n\r\n";
    const OPTIONS: &[u8] = b"OPTIONS sip:x SIP/2.0\r\nCall-ID: abc\r\nCSeq: 1 OPTIONS\r\n\r\n";

    #[test]
    fn test_interesting_packet_is_delivered() {
        let (mut dispatcher, store) = dispatcher(8192);

        assert_eq!(dispatcher.dispatch(INVITE), DispatchOutcome::Delivered);

        let pushed = store.0.borrow();
        assert_eq!(pushed.len(), 1);
        assert_eq!(&pushed[0][16..], INVITE);
    }

    #[test]
    fn test_excluded_method_is_filtered() {
        let (mut dispatcher, store) = dispatcher(8192);

        assert_eq!(dispatcher.dispatch(OPTIONS), DispatchOutcome::Filtered);
        assert!(store.0.borrow().is_empty());
        assert_eq!(
            dispatcher.counters(),
            PipelineCounters {
                captured: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_oversized_packet_is_counted() {
        let (mut dispatcher, store) = dispatcher(32);

        assert_eq!(dispatcher.dispatch(INVITE), DispatchOutcome::Oversized);
        let counters = dispatcher.counters();
        assert_eq!(counters.captured, 1);
        assert_eq!(counters.oversized, 1);
        assert_eq!(counters.interesting, 0);
        assert!(store.0.borrow().is_empty());
    }

    #[test]
    fn test_oversized_outcome_matches_counter() {
        let (mut dispatcher, _) = dispatcher(64);
        let big = vec![b'x'; 64];

        let mut oversized = 0;
        for packet in [INVITE, &big[..], OPTIONS, &big[..], &big[..48]] {
            if dispatcher.dispatch(packet) == DispatchOutcome::Oversized {
                oversized += 1;
            }
        }

        let counters = dispatcher.counters();
        assert_eq!(oversized, 4);
        assert_eq!(counters.oversized, oversized);
        assert_eq!(counters.captured, 5);
        assert_eq!(counters.interesting, 0);
    }

    #[test]
    fn test_record_carries_capture_time() {
        let (mut dispatcher, store) = dispatcher(8192);
        let time = CaptureTime {
            secs: 42,
            micros: 7,
        };

        dispatcher.dispatch_at(INVITE, time);

        let record =
            crate::record::TraceRecord::decode(&store.0.borrow()[0]).expect("decode");
        assert_eq!(record.header().time, time);
    }

    #[test]
    fn test_summary_format() {
        let counters = PipelineCounters {
            captured: 3,
            interesting: 1,
            delivered: 1,
            oversized: 0,
        };
        assert_eq!(
            counters.to_string(),
            "3 packets captured, 1 interesting, 1 delivered"
        );
    }

    #[test]
    fn test_stats_interval_zero_disables() {
        let (dispatcher, _) = dispatcher(8192);
        let dispatcher = dispatcher.with_stats_interval(Duration::ZERO);
        assert!(dispatcher.stats_interval.is_none());
    }
}
