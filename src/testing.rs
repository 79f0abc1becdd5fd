//! Test doubles shared between colocated unit tests and `tests/` integration
//! tests: a freezable clock, a deterministic id generator, and an in-memory
//! HTTP client that records every request instead of touching the network.
//!
//! Grounded on `opentelemetry-sdk/src/trace/in_memory_exporter.rs`'s
//! in-memory exporter pattern (capture instead of transmit), generalized to
//! an `HttpClient` double.

use crate::collector::{HttpClient, Response, TransportError};
use crate::ids::{Clock, IdGenerator, SpanId, Timestamp, TraceId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Instant, SystemTime};

/// A clock whose `now()` is set explicitly by the test, rather than reading
/// the system clock. The monotonic tick always advances with wall time so
/// durations computed from it remain meaningful.
#[derive(Debug)]
pub struct ManualClock {
    wall: RwLock<SystemTime>,
    tick: RwLock<Instant>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        ManualClock {
            wall: RwLock::new(start),
            tick: RwLock::new(Instant::now()),
        }
    }

    pub fn advance(&self, duration: std::time::Duration) {
        *self.wall.write().unwrap() += duration;
        *self.tick.write().unwrap() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            wall: *self.wall.read().unwrap(),
            tick: *self.tick.read().unwrap(),
        }
    }
}

/// An [`IdGenerator`] that yields ids from a fixed, caller-supplied sequence,
/// falling back to a counter once the sequence is exhausted.
#[derive(Debug)]
pub struct FixedIdGenerator {
    next: AtomicU64,
}

impl FixedIdGenerator {
    pub fn starting_at(first: u64) -> Self {
        FixedIdGenerator { next: AtomicU64::new(first) }
    }
}

impl Default for FixedIdGenerator {
    fn default() -> Self {
        FixedIdGenerator::starting_at(1)
    }
}

impl IdGenerator for FixedIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from_low(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn new_span_id(&self) -> SpanId {
        SpanId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// One recorded flush POST.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// An [`HttpClient`] double that records every request and replays a queue
/// of scripted responses (defaulting to an empty `200 {}` once the queue is
/// drained).
#[derive(Debug, Default)]
pub struct RecordingHttpClient {
    requests: Mutex<Vec<RecordedRequest>>,
    responses: Mutex<VecDeque<Result<Response, String>>>,
}

impl RecordingHttpClient {
    pub fn new() -> Self {
        RecordingHttpClient::default()
    }

    pub fn push_response(&self, response: Response) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpClient for RecordingHttpClient {
    fn post(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.to_vec(),
            body,
        });
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(TransportError(message)),
            None => Ok(Response {
                status: 200,
                headers: std::collections::HashMap::new(),
                body: b"{}".to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_advances_on_request() {
        let start = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let clock = ManualClock::new(start);
        let first = clock.now();
        assert_eq!(first.wall, start);
        clock.advance(std::time::Duration::from_secs(5));
        let second = clock.now();
        assert_eq!(second.wall, start + std::time::Duration::from_secs(5));
        assert!(second.tick > first.tick);
    }

    #[test]
    fn fixed_id_generator_yields_sequential_ids() {
        let gen = FixedIdGenerator::starting_at(10);
        assert_eq!(gen.new_trace_id().low, 10);
        assert_eq!(gen.new_span_id(), SpanId(11));
    }

    #[test]
    fn recording_http_client_captures_request_bodies() {
        let client = RecordingHttpClient::new();
        client.post("http://agent/v0.4/traces", &[("Content-Type".to_string(), "application/msgpack".to_string())], vec![1, 2, 3]).unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(client.requests()[0].body, vec![1, 2, 3]);
    }

    #[test]
    fn scripted_failure_is_returned_once_then_reverts_to_default() {
        let client = RecordingHttpClient::new();
        client.push_failure("connection refused");
        assert!(client.post("http://agent", &[], vec![]).is_err());
        assert!(client.post("http://agent", &[], vec![]).is_ok());
    }
}
