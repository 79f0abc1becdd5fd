//! Batches finalized trace segments, encodes them in MessagePack, and ships
//! them to the Datadog agent.
//!
//! Grounded on `opentelemetry-datadog/src/exporter/mod.rs`'s
//! `DatadogExporter::export` (group-by-trace, encode, POST with
//! `Content-Type: application/msgpack` and `X-Datadog-Trace-Count`) for the
//! flush protocol, and on `BatchSpanProcessor`'s queue/backpressure
//! discipline (`opentelemetry-sdk/src/trace/span_processor.rs`) for the
//! bounded pending queue.

use crate::logging::{Level, Logger};
use crate::msgpack::Writer;
use crate::sampling::trace_sampler::TraceSampler;
use crate::span::SpanData;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An HTTP response, as returned by an injected [`HttpClient`].
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A transport-level failure (connection refused, timeout, DNS, etc).
#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for TransportError {}

/// The HTTP transport the collector posts batches through. Synchronous
/// because the collector's flush always runs on the scheduler thread, never
/// on a span-finishing thread — no async runtime is required.
pub trait HttpClient: Send + Sync + std::fmt::Debug {
    fn post(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<Response, TransportError>;
}

const DEFAULT_QUEUE_CAP: usize = 1000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const DROPPED_SEGMENTS_TAG: &str = "_dd.tracer.dropped_segments";

/// One finalized segment's span list, ready to be grouped with others into
/// an outer trace array.
pub type FinishedTrace = Vec<SpanData>;

struct CollectorState {
    queue: std::collections::VecDeque<FinishedTrace>,
    dropped_segments: u64,
}

/// Client metadata sent with every flush so the agent can attribute traffic.
#[derive(Clone, Debug)]
pub struct TracerMeta {
    pub language: String,
    pub language_version: String,
    pub tracer_version: String,
}

impl Default for TracerMeta {
    fn default() -> Self {
        TracerMeta {
            language: "rust".to_string(),
            language_version: rustc_version_placeholder(),
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn rustc_version_placeholder() -> String {
    "unknown".to_string()
}

/// Owns the pending queue, ships batches to the agent, and feeds the
/// agent's per-service rate response back into the trace sampler.
pub struct DatadogAgentCollector {
    url: String,
    http_client: Arc<dyn HttpClient>,
    sampler: Arc<TraceSampler>,
    logger: Arc<dyn Logger>,
    meta: TracerMeta,
    queue_cap: usize,
    computed_stats: bool,
    state: Mutex<CollectorState>,
    consecutive_failures: AtomicU64,
}

impl std::fmt::Debug for DatadogAgentCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatadogAgentCollector").field("url", &self.url).finish()
    }
}

impl DatadogAgentCollector {
    pub fn new(
        url: String,
        http_client: Arc<dyn HttpClient>,
        sampler: Arc<TraceSampler>,
        logger: Arc<dyn Logger>,
        meta: TracerMeta,
        computed_stats: bool,
    ) -> Arc<Self> {
        Arc::new(DatadogAgentCollector {
            url,
            http_client,
            sampler,
            logger,
            meta,
            queue_cap: DEFAULT_QUEUE_CAP,
            computed_stats,
            state: Mutex::new(CollectorState {
                queue: std::collections::VecDeque::new(),
                dropped_segments: 0,
            }),
            consecutive_failures: AtomicU64::new(0),
        })
    }

    pub fn default_flush_interval() -> Duration {
        DEFAULT_FLUSH_INTERVAL
    }

    /// Enqueues one finalized segment's spans. On overflow, the oldest
    /// queued trace is dropped and a counter is incremented, to be reported
    /// as a best-effort tag on the next successful flush.
    pub fn push(&self, trace: FinishedTrace) {
        let mut state = self.state.lock().unwrap();
        if state.queue.len() >= self.queue_cap {
            state.queue.pop_front();
            state.dropped_segments += 1;
        }
        state.queue.push_back(trace);
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Runs one flush cycle: swap the queue, encode, POST, ingest the
    /// response. Never panics on transport or encoding failure — those are
    /// logged and the batch is discarded.
    pub fn flush(&self) {
        let mut traces = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.queue)
        };
        if traces.is_empty() {
            return;
        }

        let dropped = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.dropped_segments)
        };
        if dropped > 0 {
            if let Some(first_trace) = traces.front_mut() {
                if let Some(root) = first_trace.first_mut() {
                    root.numeric_tags.insert(DROPPED_SEGMENTS_TAG.to_string(), dropped as f64);
                }
            }
        }

        let trace_count = traces.len();
        let body = match encode_traces(traces.make_contiguous()) {
            Ok(body) => body,
            Err(err) => {
                self.logger.log(Level::Warn, &format!("failed to encode trace batch: {}", err), None);
                return;
            }
        };

        let mut headers = vec![
            ("Content-Type".to_string(), "application/msgpack".to_string()),
            ("X-Datadog-Trace-Count".to_string(), trace_count.to_string()),
            ("Datadog-Meta-Lang".to_string(), self.meta.language.clone()),
            ("Datadog-Meta-Lang-Version".to_string(), self.meta.language_version.clone()),
            ("Datadog-Meta-Tracer-Version".to_string(), self.meta.tracer_version.clone()),
        ];
        if self.computed_stats {
            headers.push(("Datadog-Client-Computed-Stats".to_string(), "yes".to_string()));
        }

        match self.http_client.post(&self.url, &headers, body) {
            Ok(response) if (200..300).contains(&response.status) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.ingest_response(&response.body);
            }
            Ok(response) => {
                self.logger
                    .log(Level::Warn, &format!("agent returned non-2xx status {}", response.status), None);
                self.note_failure();
            }
            Err(err) => {
                self.logger.log(Level::Warn, &format!("agent request failed: {}", err), Some(&err));
                self.note_failure();
            }
        }
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= 30 {
            self.logger
                .log(Level::Error, "repeated agent flush failures over the last ~minute", None);
        }
    }

    fn ingest_response(&self, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        #[derive(serde::Deserialize)]
        struct AgentResponse {
            #[serde(default)]
            rate_by_service: HashMap<String, f64>,
        }
        match serde_json::from_slice::<AgentResponse>(body) {
            Ok(parsed) => self.sampler.update_rates(parsed.rate_by_service),
            Err(err) => {
                self.logger
                    .log(Level::Warn, &format!("malformed agent response: {}", err), Some(&err));
            }
        }
    }

    /// Final synchronous flush with a bounded timeout, used on tracer
    /// shutdown. If the flush doesn't complete in time, pending segments are
    /// discarded rather than blocking shutdown indefinitely.
    pub fn shutdown_flush(self: &Arc<Self>, timeout: Duration) {
        let (tx, rx) = std::sync::mpsc::channel();
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            this.flush();
            let _ = tx.send(());
        });
        if rx.recv_timeout(timeout).is_err() {
            self.logger.log(Level::Warn, "shutdown flush timed out; discarding pending segments", None);
            let mut state = self.state.lock().unwrap();
            state.queue.clear();
        }
        let _ = handle.join();
    }
}

/// Encodes a batch of finalized traces in the agent's array-of-arrays wire
/// format: each span a 12-field map, matching the v0.4 `/traces` endpoint.
pub fn encode_traces(traces: &[FinishedTrace]) -> Result<Vec<u8>, crate::error::Error> {
    let mut writer = Writer::new();
    writer.write_array_len(traces.len() as u32)?;
    for trace in traces {
        writer.write_array_len(trace.len() as u32)?;
        for span in trace {
            encode_span(&mut writer, span)?;
        }
    }
    Ok(writer.into_bytes())
}

fn encode_span(writer: &mut Writer, span: &SpanData) -> Result<(), crate::error::Error> {
    let has_type = span.span_type.is_some();
    writer.write_map_len(if has_type { 11 } else { 10 })?;

    writer.write_str("service")?;
    writer.write_str(&span.service)?;
    writer.write_str("name")?;
    writer.write_str(&span.name)?;
    writer.write_str("resource")?;
    writer.write_str(&span.resource)?;
    writer.write_str("trace_id")?;
    writer.write_uint(span.trace_id.low)?;
    writer.write_str("span_id")?;
    writer.write_uint(span.span_id.0)?;
    writer.write_str("parent_id")?;
    writer.write_uint(span.parent_id.0)?;
    writer.write_str("start")?;
    writer.write_int(span.start_nanos)?;
    writer.write_str("duration")?;
    writer.write_int(span.duration_nanos)?;
    writer.write_str("error")?;
    writer.write_int(if span.error { 1 } else { 0 })?;

    writer.write_str("meta")?;
    let mut meta: BTreeMap<&str, String> = BTreeMap::new();
    for (k, v) in &span.tags {
        meta.insert(k.as_str(), v.clone());
    }
    if let Some(env) = &span.environment {
        meta.entry("env").or_insert_with(|| env.clone());
    }
    if let Some(version) = &span.version {
        meta.entry("version").or_insert_with(|| version.clone());
    }
    if span.trace_id.high != 0 {
        meta.insert("_dd.p.tid", format!("{:016x}", span.trace_id.high));
    }
    if let Some(msg) = &span.error_message {
        meta.insert("error.message", msg.clone());
    }
    if let Some(t) = &span.error_type {
        meta.insert("error.type", t.clone());
    }
    if let Some(stack) = &span.error_stack {
        meta.insert("error.stack", stack.clone());
    }
    writer.write_map_len(meta.len() as u32)?;
    for (k, v) in &meta {
        writer.write_str(k)?;
        writer.write_str(v)?;
    }

    writer.write_str("metrics")?;
    writer.write_map_len(span.numeric_tags.len() as u32)?;
    for (k, v) in &span.numeric_tags {
        writer.write_str(k)?;
        writer.write_f64(*v)?;
    }

    if let Some(span_type) = &span.span_type {
        writer.write_str("type")?;
        writer.write_str(span_type)?;
    }

    Ok(())
}
