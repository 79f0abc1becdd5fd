//! Top-level façade wiring the samplers, scheduler, collector, and
//! propagators together, grounded on `opentelemetry-datadog`'s
//! `DatadogPipelineBuilder`/`new_pipeline()` construction flow (builder
//! produces a fully wired exporter/tracer pair) generalized to this
//! crate's own span model instead of the OTel SDK's.

use crate::collector::{DatadogAgentCollector, HttpClient, TracerMeta};
use crate::config::Config;
use crate::ids::{Clock, IdGenerator, RandomIdGenerator, SystemClock};
use crate::logging::{default_logger, Level, Logger};
use crate::propagation::b3::B3Propagator;
use crate::propagation::datadog::DatadogPropagator;
use crate::propagation::w3c::W3cPropagator;
use crate::propagation::{Extractor, InjectContext, Injector, Propagator};
use crate::sampling::span_sampler::SpanSampler;
use crate::sampling::trace_sampler::TraceSampler;
use crate::scheduler::EventScheduler;
use crate::span::{FinalizingSegment, SamplingMechanism, SegmentFinalizer, Span, SpanConfig, SpanDefaults, SpanData, TraceSegment};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const PROPAGATION_ERROR_TAG: &str = "_dd.propagation_error";
const ORIGIN_TAG: &str = "_dd.origin";
const HOSTNAME_TAG: &str = "_dd.hostname";
const SAMPLING_PRIORITY_TAG: &str = "_sampling_priority_v1";
const DECISION_MAKER_TAG: &str = "_dd.p.dm";
const RULE_RATE_TAG: &str = "_dd.rule_psr";
const AGENT_RATE_TAG: &str = "_dd.agent_psr";
const LIMIT_RATE_TAG: &str = "_dd.limit_psr";
const SPAN_SAMPLING_MECHANISM_TAG: &str = "_dd.span_sampling.mechanism";
const SPAN_SAMPLING_RULE_RATE_TAG: &str = "_dd.span_sampling.rule_rate";
const SPAN_SAMPLING_MAX_PER_SECOND_TAG: &str = "_dd.span_sampling.max_per_second";

fn propagator_by_name(name: &str) -> Option<Arc<dyn Propagator>> {
    match name {
        "datadog" => Some(Arc::new(DatadogPropagator::new())),
        "tracecontext" => Some(Arc::new(W3cPropagator::new())),
        "b3" => Some(Arc::new(B3Propagator::new())),
        _ => None,
    }
}

/// Performs the sampling-decision-and-tag-stamping sequence and hands the
/// finished segment to the collector. The seam `span.rs` depends on so it
/// never needs to know about sampling or delivery.
struct Finalizer {
    trace_sampler: Arc<TraceSampler>,
    span_sampler: Arc<SpanSampler>,
    collector: Arc<DatadogAgentCollector>,
    clock: Arc<dyn Clock>,
    global_tags: HashMap<String, String>,
    report_hostname: bool,
    logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer").finish()
    }
}

impl Finalizer {
    fn stamp_trace_decision(&self, segment: &mut FinalizingSegment, now: Instant) {
        let root = segment.root();
        let decision = self.trace_sampler.decide(
            root.trace_id.low,
            &root.service,
            root.environment.as_deref(),
            &root.name,
            &root.resource,
            &root.tags,
            segment.extracted_priority,
            segment.manual_override,
            now,
        );

        let origin = segment.origin.clone();
        let tags_to_propagate = segment.tags_to_propagate.clone();
        let global_tags = self.global_tags.clone();
        let report_hostname = self.report_hostname;

        let root = segment.root_mut();
        root.numeric_tags.insert(SAMPLING_PRIORITY_TAG.to_string(), decision.priority.as_i8() as f64);
        if decision.mechanism != SamplingMechanism::Remote {
            root.tags.insert(DECISION_MAKER_TAG.to_string(), format!("-{}", decision.mechanism.dm_code()));
        }
        if let Some(rate) = decision.rule_rate {
            root.numeric_tags.insert(RULE_RATE_TAG.to_string(), rate);
        }
        if let Some(rate) = decision.agent_rate {
            root.numeric_tags.insert(AGENT_RATE_TAG.to_string(), rate);
        }
        if let Some(rate) = decision.limit_rate {
            root.numeric_tags.insert(LIMIT_RATE_TAG.to_string(), rate);
        }

        for (k, v) in tags_to_propagate {
            if k.starts_with("_dd.p.") {
                root.tags.entry(k).or_insert(v);
            }
        }
        if let Some(origin) = origin {
            root.tags.insert(ORIGIN_TAG.to_string(), origin);
        }
        for (k, v) in global_tags {
            root.tags.entry(k).or_insert(v);
        }
        if report_hostname {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            root.tags.entry(HOSTNAME_TAG.to_string()).or_insert(hostname);
        }
    }

    fn stamp_span_sampling(&self, spans: &mut [SpanData], now: Instant) {
        for span in spans.iter_mut() {
            let outcome = match self.span_sampler.sample(span, now) {
                Some(outcome) => outcome,
                None => continue,
            };
            span.numeric_tags.insert(SPAN_SAMPLING_MECHANISM_TAG.to_string(), outcome.mechanism as f64);
            span.numeric_tags.insert(SPAN_SAMPLING_RULE_RATE_TAG.to_string(), outcome.rule_rate);
            if let Some(max_per_second) = outcome.max_per_second {
                span.numeric_tags.insert(SPAN_SAMPLING_MAX_PER_SECOND_TAG.to_string(), max_per_second);
            }
        }
    }
}

impl SegmentFinalizer for Finalizer {
    fn finalize(&self, mut segment: FinalizingSegment) {
        let now = self.clock.now().tick;
        self.stamp_trace_decision(&mut segment, now);
        self.stamp_span_sampling(&mut segment.spans, now);
        self.logger.log(
            Level::Debug,
            &format!("segment finalized: trace_id={} spans={}", segment.trace_id, segment.spans.len()),
            None,
        );
        self.collector.push(segment.spans);
    }
}

/// Outcome of an attempted multi-style extraction: the context to use, plus
/// whether any two successful styles disagreed on trace id.
struct ExtractionResult {
    trace_id: crate::ids::TraceId,
    parent_id: crate::ids::SpanId,
    priority: Option<crate::span::SamplingPriority>,
    origin: Option<String>,
    tags_to_propagate: HashMap<String, String>,
    inconsistent: bool,
}

/// The tracer façade: creates and extracts spans, owns the sampling,
/// scheduling, and delivery machinery for as long as any span is open.
pub struct Tracer {
    config: Config,
    extract_propagators: Vec<Arc<dyn Propagator>>,
    inject_propagators: Vec<Arc<dyn Propagator>>,
    trace_sampler: Arc<TraceSampler>,
    span_sampler: Arc<SpanSampler>,
    scheduler: Arc<EventScheduler>,
    collector: Arc<DatadogAgentCollector>,
    finalizer: Arc<Finalizer>,
    clock: Arc<dyn Clock>,
    id_gen: Arc<dyn IdGenerator>,
    logger: Arc<dyn Logger>,
    flush_cancel: std::sync::Mutex<Option<crate::scheduler::CancelToken>>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").field("service", &self.config.service).finish()
    }
}

impl Tracer {
    /// Builds a tracer from finalized config and the trace/span sampling
    /// rules the host configured alongside it. Infallible: `Config` is
    /// already validated by the time it reaches here, per the propagation
    /// policy that construction never fails once config is finalized.
    pub fn new(
        config: Config,
        trace_sampler: Arc<TraceSampler>,
        span_sampler: Arc<SpanSampler>,
        http_client: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        Self::with_clock_and_ids(
            config,
            trace_sampler,
            span_sampler,
            http_client,
            Arc::new(SystemClock),
            Arc::new(RandomIdGenerator::default()),
            default_logger(),
        )
    }

    /// Full constructor accepting injected clock/id-generator/logger, used
    /// by tests that need determinism.
    pub fn with_clock_and_ids(
        config: Config,
        trace_sampler: Arc<TraceSampler>,
        span_sampler: Arc<SpanSampler>,
        http_client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        id_gen: Arc<dyn IdGenerator>,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        let extract_propagators = config
            .propagation_styles_extract
            .iter()
            .filter_map(|name| propagator_by_name(name))
            .collect();
        let inject_propagators: Vec<Arc<dyn Propagator>> = config
            .propagation_styles_inject
            .iter()
            .filter_map(|name| propagator_by_name(name))
            .collect();

        let collector = DatadogAgentCollector::new(
            format!("{}/v0.4/traces", config.agent_url.trim_end_matches('/')),
            http_client,
            Arc::clone(&trace_sampler),
            Arc::clone(&logger),
            TracerMeta::default(),
            false,
        );

        let finalizer = Arc::new(Finalizer {
            trace_sampler: Arc::clone(&trace_sampler),
            span_sampler: Arc::clone(&span_sampler),
            collector: Arc::clone(&collector),
            clock: Arc::clone(&clock),
            global_tags: config.tags.clone(),
            report_hostname: config.report_hostname,
            logger: Arc::clone(&logger),
        });

        let scheduler = EventScheduler::new();
        let flush_interval = config.flush_interval;
        let collector_for_flush = Arc::clone(&collector);
        let flush_cancel = scheduler.schedule_recurring(flush_interval, move || {
            collector_for_flush.flush();
        });

        Arc::new(Tracer {
            config,
            extract_propagators,
            inject_propagators,
            trace_sampler,
            span_sampler,
            scheduler,
            collector,
            finalizer,
            clock,
            id_gen,
            logger,
            flush_cancel: std::sync::Mutex::new(Some(flush_cancel)),
        })
    }

    fn defaults(&self) -> SpanDefaults {
        SpanDefaults {
            service: self.config.service.clone(),
            service_type: None,
            environment: self.config.environment.clone(),
            version: self.config.version.clone(),
        }
    }

    /// Creates a fresh local-root span starting a brand-new trace segment.
    pub fn create_span(&self, config: SpanConfig) -> Span {
        let trace_id = self.id_gen.new_trace_id();
        let span_id = self.id_gen.new_span_id();
        let segment = TraceSegment::new(
            trace_id,
            span_id,
            self.defaults(),
            None,
            HashMap::new(),
            None,
            Arc::clone(&self.finalizer) as Arc<dyn SegmentFinalizer>,
            Arc::clone(&self.clock),
            Arc::clone(&self.id_gen),
        );
        Span::new_root(segment, span_id, crate::ids::SpanId::ZERO, config)
    }

    fn try_extract(&self, carrier: &dyn Extractor) -> Option<ExtractionResult> {
        let mut result: Option<ExtractionResult> = None;
        for propagator in &self.extract_propagators {
            match propagator.extract(carrier) {
                Ok(Some(ctx)) => match &mut result {
                    None => {
                        result = Some(ExtractionResult {
                            trace_id: ctx.trace_id,
                            parent_id: ctx.parent_id,
                            priority: ctx.priority,
                            origin: ctx.origin,
                            tags_to_propagate: ctx.tags_to_propagate,
                            inconsistent: false,
                        });
                    }
                    Some(existing) => {
                        if existing.trace_id != ctx.trace_id {
                            existing.inconsistent = true;
                        }
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    self.logger.log(
                        Level::Warn,
                        &format!("propagation style {} failed to extract: {}", propagator.name(), err),
                        Some(&err),
                    );
                }
            }
        }
        result
    }

    /// Extracts trace context from `carrier` using the configured extract
    /// styles in order, creating a remote-child root span if any style
    /// succeeds, or a fresh local-root span otherwise. Extraction failures
    /// are recovered locally per the propagation policy: never propagated to
    /// the caller.
    pub fn extract_or_create_span(&self, carrier: &dyn Extractor, config: SpanConfig) -> Span {
        let extracted = match self.try_extract(carrier) {
            Some(extracted) => extracted,
            None => return self.create_span(config),
        };

        if extracted.inconsistent {
            self.logger.log(Level::Warn, "extraction styles disagreed on trace id", None);
        }

        let span_id = self.id_gen.new_span_id();
        let segment = TraceSegment::new(
            extracted.trace_id,
            span_id,
            self.defaults(),
            extracted.origin,
            extracted.tags_to_propagate,
            extracted.priority,
            Arc::clone(&self.finalizer) as Arc<dyn SegmentFinalizer>,
            Arc::clone(&self.clock),
            Arc::clone(&self.id_gen),
        );
        let span = Span::new_root(segment, span_id, extracted.parent_id, config);
        if extracted.inconsistent {
            span.set_tag(PROPAGATION_ERROR_TAG, crate::error::Error::InconsistentExtractionStyles.code());
        }
        span
    }

    /// Injects `span`'s current trace context into `carrier` using every
    /// configured inject style.
    pub fn inject(&self, span: &Span, carrier: &mut dyn Injector) {
        let segment = span.segment();
        let origin = segment.origin();
        let tags_to_propagate = segment.tags_to_propagate();
        let priority = segment.current_priority();
        let ctx = InjectContext {
            trace_id: span.trace_id(),
            span_id: span.span_id(),
            priority,
            origin: origin.as_deref(),
            tags_to_propagate: &tags_to_propagate,
        };
        for propagator in &self.inject_propagators {
            propagator.inject(&ctx, carrier);
        }
    }

    pub fn trace_sampler(&self) -> &Arc<TraceSampler> {
        &self.trace_sampler
    }

    pub fn span_sampler(&self) -> &Arc<SpanSampler> {
        &self.span_sampler
    }

    pub fn collector(&self) -> &Arc<DatadogAgentCollector> {
        &self.collector
    }

    /// Final synchronous flush with the configured shutdown timeout, then
    /// stops the scheduler thread. Idempotent.
    pub fn shutdown(&self) {
        if let Some(token) = self.flush_cancel.lock().unwrap().take() {
            token.cancel();
        }
        self.collector.shutdown_flush(self.config.shutdown_timeout);
        self.scheduler.shutdown();
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::propagation::datadog::{PARENT_ID_HEADER, SAMPLING_PRIORITY_HEADER, TRACE_ID_HEADER};
    use crate::propagation::MapCarrier;
    use crate::rate::Rate;
    use crate::testing::{FixedIdGenerator, ManualClock, RecordingHttpClient};

    fn test_tracer(http: Arc<RecordingHttpClient>) -> Arc<Tracer> {
        let config = ConfigBuilder::new().with_service("svc").finalize_with_env(&HashMap::new()).unwrap();
        let trace_sampler = Arc::new(TraceSampler::new(vec![], Rate::new(1.0).unwrap(), 1000.0));
        let span_sampler = Arc::new(SpanSampler::new(vec![]));
        Tracer::with_clock_and_ids(
            config,
            trace_sampler,
            span_sampler,
            http,
            Arc::new(ManualClock::new(std::time::SystemTime::UNIX_EPOCH)),
            Arc::new(FixedIdGenerator::starting_at(1)),
            Arc::new(crate::logging::NoopLogger),
        )
    }

    #[test]
    fn fresh_span_is_kept_by_default_and_tagged_with_decision_maker() {
        let http = Arc::new(RecordingHttpClient::new());
        let tracer = test_tracer(Arc::clone(&http));
        let span = tracer.create_span(SpanConfig { name: "s1".into(), ..Default::default() });
        span.finish();
        tracer.collector().flush();
        assert_eq!(http.request_count(), 1);
        tracer.shutdown();
    }

    #[test]
    fn extracted_context_becomes_the_new_root_parent() {
        let http = Arc::new(RecordingHttpClient::new());
        let tracer = test_tracer(http);
        let mut carrier = MapCarrier::default();
        carrier.set(TRACE_ID_HEADER, "12345".to_string());
        carrier.set(PARENT_ID_HEADER, "67".to_string());
        carrier.set(SAMPLING_PRIORITY_HEADER, "2".to_string());
        let span = tracer.extract_or_create_span(&carrier, SpanConfig { name: "op".into(), ..Default::default() });
        assert_eq!(span.trace_id().low, 12345);
        span.finish();
        tracer.shutdown();
    }

    #[test]
    fn injecting_before_finish_round_trips_through_datadog_style() {
        let http = Arc::new(RecordingHttpClient::new());
        let tracer = test_tracer(http);
        let span = tracer.create_span(SpanConfig { name: "op".into(), ..Default::default() });
        let mut carrier = MapCarrier::default();
        tracer.inject(&span, &mut carrier);
        assert_eq!(carrier.get(TRACE_ID_HEADER), Some(span.trace_id().low.to_string()).as_deref());
        span.finish();
        tracer.shutdown();
    }

    #[test]
    fn shutdown_flushes_all_open_segments_within_one_post() {
        let http = Arc::new(RecordingHttpClient::new());
        let tracer = test_tracer(Arc::clone(&http));
        for i in 0..10 {
            let span = tracer.create_span(SpanConfig { name: format!("s{}", i), ..Default::default() });
            span.finish();
        }
        tracer.shutdown();
        assert_eq!(http.request_count(), 1);
    }
}
