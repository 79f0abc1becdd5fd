//! In-memory trace model: `SpanData`, `TraceSegment`, `Span`.
//!
//! Ownership is reshaped from the arena-plus-handle design note: a
//! `TraceSegment` owns every finished `SpanData`; a live `Span` holds a
//! shared handle to its segment plus a private draft of its own data until
//! it finishes. This avoids the cyclic span/segment references a naive port
//! would produce. Grounded in shape on `opentelemetry-sdk/src/trace/span.rs`
//! (span owns data, finish is idempotent) generalized to the segment model.

use crate::ids::{Clock, IdGenerator, SpanId, TraceId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Sampling priority, per the external wire contract: `-1, 0, 1, 2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingPriority {
    UserDrop = -1,
    AutoDrop = 0,
    AutoKeep = 1,
    UserKeep = 2,
}

impl SamplingPriority {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn is_keep(self) -> bool {
        matches!(self, SamplingPriority::AutoKeep | SamplingPriority::UserKeep)
    }
}

/// Why a sampling decision was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingMechanism {
    Default,
    Rule,
    AgentRate,
    Manual,
    Remote,
}

impl SamplingMechanism {
    /// The `_dd.p.dm` decision-maker code written onto the root span.
    pub fn dm_code(self) -> i32 {
        match self {
            SamplingMechanism::Default => 0,
            SamplingMechanism::AgentRate => 1,
            SamplingMechanism::Rule => 3,
            SamplingMechanism::Manual => 4,
            SamplingMechanism::Remote => -1, // never written directly; see finalize().
        }
    }
}

/// A fully-formed trace-level sampling decision.
#[derive(Clone, Copy, Debug)]
pub struct SamplingDecision {
    pub priority: SamplingPriority,
    pub mechanism: SamplingMechanism,
    pub rule_rate: Option<f64>,
    pub agent_rate: Option<f64>,
    pub limit_rate: Option<f64>,
}

impl SamplingDecision {
    pub fn new(priority: SamplingPriority, mechanism: SamplingMechanism) -> Self {
        SamplingDecision {
            priority,
            mechanism,
            rule_rate: None,
            agent_rate: None,
            limit_rate: None,
        }
    }
}

/// A finished span record. Mutated only by its owning [`Span`] before
/// finish; read-only afterward.
#[derive(Clone, Debug)]
pub struct SpanData {
    pub service: String,
    pub service_type: Option<String>,
    pub environment: Option<String>,
    pub version: Option<String>,
    pub name: String,
    pub resource: String,
    pub span_type: Option<String>,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_id: SpanId,
    pub start_nanos: i64,
    pub duration_nanos: i64,
    pub tags: HashMap<String, String>,
    pub numeric_tags: HashMap<String, f64>,
    pub error: bool,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub error_stack: Option<String>,
}

/// Defaults snapshotted at segment creation and applied to every span
/// created within it unless explicitly overridden.
#[derive(Clone, Debug, Default)]
pub struct SpanDefaults {
    pub service: String,
    pub service_type: Option<String>,
    pub environment: Option<String>,
    pub version: Option<String>,
}

/// Parameters for creating a new span (root or child).
#[derive(Clone, Debug, Default)]
pub struct SpanConfig {
    pub name: String,
    pub resource: Option<String>,
    pub service: Option<String>,
    pub span_type: Option<String>,
}

/// Hands a fully finalized segment to whatever wires sampling and delivery
/// together (the tracer façade). Kept as a trait so this module doesn't
/// depend on the sampling or collector modules directly.
pub trait SegmentFinalizer: Send + Sync + fmt::Debug {
    fn finalize(&self, segment: FinalizingSegment);
}

/// Owned view of a segment at the instant its last open span finishes.
/// Mutating `spans[local_root_index]`'s tags here is how the sampling
/// decision and its diagnostic tags get stamped onto the root before the
/// segment is handed to the collector.
#[derive(Debug)]
pub struct FinalizingSegment {
    pub trace_id: TraceId,
    pub spans: Vec<SpanData>,
    pub local_root_index: usize,
    pub origin: Option<String>,
    pub tags_to_propagate: HashMap<String, String>,
    pub extracted_priority: Option<SamplingPriority>,
    pub manual_override: Option<SamplingPriority>,
}

impl FinalizingSegment {
    pub fn root(&self) -> &SpanData {
        &self.spans[self.local_root_index]
    }

    pub fn root_mut(&mut self) -> &mut SpanData {
        &mut self.spans[self.local_root_index]
    }
}

struct SegmentInner {
    creation_tick: Instant,
    local_root_span_id: SpanId,
    defaults: SpanDefaults,
    origin: Option<String>,
    tags_to_propagate: HashMap<String, String>,
    extracted_priority: Option<SamplingPriority>,
    manual_override: Option<SamplingPriority>,
    spans: Vec<SpanData>,
    num_open: u32,
    num_finished: u32,
    finalized: bool,
}

/// Shared state for every [`Span`] in one trace segment, guarded by a
/// single mutex per the concurrency model: holding the lock excludes all
/// other mutation of this segment, and segments never lock against each
/// other.
pub struct TraceSegment {
    trace_id: TraceId,
    finalizer: Arc<dyn SegmentFinalizer>,
    clock: Arc<dyn Clock>,
    id_gen: Arc<dyn IdGenerator>,
    inner: Mutex<SegmentInner>,
}

impl fmt::Debug for TraceSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSegment").field("trace_id", &self.trace_id).finish()
    }
}

impl TraceSegment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        trace_id: TraceId,
        local_root_span_id: SpanId,
        defaults: SpanDefaults,
        origin: Option<String>,
        tags_to_propagate: HashMap<String, String>,
        extracted_priority: Option<SamplingPriority>,
        finalizer: Arc<dyn SegmentFinalizer>,
        clock: Arc<dyn Clock>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Arc<Self> {
        Arc::new(TraceSegment {
            trace_id,
            finalizer,
            clock,
            id_gen,
            inner: Mutex::new(SegmentInner {
                creation_tick: Instant::now(),
                local_root_span_id,
                defaults,
                origin,
                tags_to_propagate,
                extracted_priority,
                manual_override: None,
                spans: Vec::new(),
                num_open: 0,
                num_finished: 0,
                finalized: false,
            }),
        })
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// May be called on any still-open segment; locks the decision from
    /// later recomputation at finalize time.
    pub fn override_sampling_priority(&self, priority: SamplingPriority) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.finalized {
            inner.manual_override = Some(priority);
        }
    }

    /// The best currently-known priority for injection into downstream
    /// headers before the segment finalizes: the manual override if one was
    /// set, else the extracted remote priority, else `None` (not yet
    /// decided — injection omits the sampling-priority field in that case).
    pub fn current_priority(&self) -> Option<SamplingPriority> {
        let inner = self.inner.lock().unwrap();
        inner.manual_override.or(inner.extracted_priority)
    }

    pub fn origin(&self) -> Option<String> {
        self.inner.lock().unwrap().origin.clone()
    }

    pub fn tags_to_propagate(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().tags_to_propagate.clone()
    }

    fn next_span_id(&self) -> SpanId {
        self.id_gen.new_span_id()
    }

    fn reserve_open(&self) {
        self.inner.lock().unwrap().num_open += 1;
    }

    fn defaults(&self) -> SpanDefaults {
        self.inner.lock().unwrap().defaults.clone()
    }

    /// Records a finished span's data and, if this was the local root and
    /// every other span has already finished, finalizes the segment.
    fn commit_finish(self: &Arc<Self>, data: SpanData) {
        let finalizing = {
            let mut inner = self.inner.lock().unwrap();
            let is_root = data.span_id == inner.local_root_span_id;
            inner.spans.push(data);
            inner.num_open -= 1;
            inner.num_finished += 1;

            if is_root && inner.num_open == 0 && !inner.finalized {
                inner.finalized = true;
                let local_root_index = inner
                    .spans
                    .iter()
                    .position(|s| s.span_id == inner.local_root_span_id)
                    .expect("root span was just pushed");
                Some(FinalizingSegment {
                    trace_id: self.trace_id,
                    spans: std::mem::take(&mut inner.spans),
                    local_root_index,
                    origin: inner.origin.clone(),
                    tags_to_propagate: inner.tags_to_propagate.clone(),
                    extracted_priority: inner.extracted_priority,
                    manual_override: inner.manual_override,
                })
            } else {
                None
            }
        };

        if let Some(finalizing) = finalizing {
            self.finalizer.finalize(finalizing);
        }
    }
}

/// Exclusive owner of one `SpanData` slot inside its segment. Mutable
/// setters are valid only before finish; finish is guaranteed exactly once,
/// on drop or explicit call.
pub struct Span {
    segment: Arc<TraceSegment>,
    draft: Mutex<Option<SpanData>>,
    start_tick: Instant,
    finished: AtomicBool,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish()
    }
}

impl Span {
    pub(crate) fn new_root(segment: Arc<TraceSegment>, span_id: SpanId, parent_id: SpanId, config: SpanConfig) -> Self {
        Self::new_with_id(segment, span_id, parent_id, config)
    }

    fn new_with_id(segment: Arc<TraceSegment>, span_id: SpanId, parent_id: SpanId, config: SpanConfig) -> Self {
        let defaults = segment.defaults();
        let now = segment.clock.now();
        let resource = config.resource.clone().unwrap_or_else(|| config.name.clone());
        let data = SpanData {
            service: config.service.unwrap_or(defaults.service),
            service_type: defaults.service_type,
            environment: defaults.environment,
            version: defaults.version,
            name: config.name,
            resource,
            span_type: config.span_type,
            trace_id: segment.trace_id,
            span_id,
            parent_id,
            start_nanos: crate::ids::unix_nanos(now.wall),
            duration_nanos: 0,
            tags: HashMap::new(),
            numeric_tags: HashMap::new(),
            error: false,
            error_message: None,
            error_type: None,
            error_stack: None,
        };
        segment.reserve_open();
        Span {
            segment,
            draft: Mutex::new(Some(data)),
            start_tick: now.tick,
            finished: AtomicBool::new(false),
        }
    }

    /// Creates a new span sharing this span's segment: same `trace_id`,
    /// `parent_id` equal to this span's `span_id`.
    pub fn create_child(&self, config: SpanConfig) -> Span {
        let parent_id = self.span_id();
        let span_id = self.segment.next_span_id();
        Span::new_with_id(Arc::clone(&self.segment), span_id, parent_id, config)
    }

    pub fn trace_id(&self) -> TraceId {
        self.segment.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.draft
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.span_id)
            .unwrap_or(SpanId::ZERO)
    }

    pub fn segment(&self) -> &Arc<TraceSegment> {
        &self.segment
    }

    fn with_draft<F: FnOnce(&mut SpanData)>(&self, f: F) {
        if let Some(data) = self.draft.lock().unwrap().as_mut() {
            f(data);
        }
    }

    pub fn set_tag<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        let (k, v) = (key.into(), value.into());
        self.with_draft(|d| {
            d.tags.insert(k, v);
        });
    }

    pub fn set_numeric_tag<K: Into<String>>(&self, key: K, value: f64) {
        let k = key.into();
        self.with_draft(|d| {
            d.numeric_tags.insert(k, value);
        });
    }

    pub fn set_name<S: Into<String>>(&self, name: S) {
        let name = name.into();
        self.with_draft(|d| d.name = name);
    }

    pub fn set_resource_name<S: Into<String>>(&self, resource: S) {
        let resource = resource.into();
        self.with_draft(|d| d.resource = resource);
    }

    pub fn set_service_name<S: Into<String>>(&self, service: S) {
        let service = service.into();
        self.with_draft(|d| d.service = service);
    }

    pub fn set_error(&self, error: bool) {
        self.with_draft(|d| d.error = error);
    }

    pub fn set_error_message<S: Into<String>>(&self, message: S) {
        let message = message.into();
        self.with_draft(|d| {
            d.error = true;
            d.error_message = Some(message);
        });
    }

    pub fn set_error_type<S: Into<String>>(&self, error_type: S) {
        let error_type = error_type.into();
        self.with_draft(|d| {
            d.error = true;
            d.error_type = Some(error_type);
        });
    }

    pub fn set_error_stack<S: Into<String>>(&self, stack: S) {
        let stack = stack.into();
        self.with_draft(|d| {
            d.error = true;
            d.error_stack = Some(stack);
        });
    }

    /// Finishes the span. Idempotent: a second call is a silent no-op,
    /// matching the "double-finish is a no-op" design note.
    pub fn finish(&self) {
        self.finish_at(self.segment.clock.now().tick)
    }

    /// Finishes the span using an explicit end tick, overriding the
    /// computed `clock.now() - start` duration.
    pub fn finish_at(&self, end_tick: Instant) {
        if self.finished.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let mut data = match self.draft.lock().unwrap().take() {
            Some(data) => data,
            None => return,
        };
        data.duration_nanos = end_tick.saturating_duration_since(self.start_tick).as_nanos() as i64;
        self.segment.commit_finish(data);
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}
