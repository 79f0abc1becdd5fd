use crate::glob::SpanMatcher;
use crate::rate::{Limiter, Rate};
use crate::sampling::sample_by_hash;
use crate::span::SpanData;
use std::time::Instant;

/// Tags written onto a span kept by the span sampler.
pub struct SpanSamplingOutcome {
    pub mechanism: i32,
    pub rule_rate: f64,
    pub max_per_second: Option<f64>,
}

/// One ordered span-sampling rule: independent of the trace decision, with
/// its own rate and an optional per-rule limiter.
pub struct SpanSamplingRule {
    matcher: SpanMatcher,
    rate: Rate,
    max_per_second: Option<f64>,
    limiter: Option<Limiter>,
}

impl SpanSamplingRule {
    pub fn new(matcher: SpanMatcher, rate: Rate, max_per_second: Option<f64>) -> Self {
        SpanSamplingRule {
            matcher,
            rate,
            limiter: max_per_second.map(Limiter::new),
            max_per_second,
        }
    }
}

/// Single-span sampler, applied regardless of the trace-level decision.
#[derive(Default)]
pub struct SpanSampler {
    rules: Vec<SpanSamplingRule>,
}

impl std::fmt::Debug for SpanSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanSampler").field("rules", &self.rules.len()).finish()
    }
}

/// The `_dd.span_sampling.mechanism` value for single-span-sampled spans.
pub const SPAN_SAMPLING_MECHANISM: i32 = 8;

impl SpanSampler {
    pub fn new(rules: Vec<SpanSamplingRule>) -> Self {
        SpanSampler { rules }
    }

    /// Evaluates the first matching rule against `span`. Returns `None` if
    /// no rule matches, the hash draw misses, or a configured limiter vetoes.
    pub fn sample(&self, span: &SpanData, now: Instant) -> Option<SpanSamplingOutcome> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.matcher.matches(&span.service, &span.name, &span.resource, &span.tags))?;

        if !sample_by_hash(span.span_id.0, rule.rate.value()) {
            return None;
        }

        if let Some(limiter) = &rule.limiter {
            let (allowed, _) = limiter.allow(now);
            if !allowed {
                return None;
            }
        }

        Some(SpanSamplingOutcome {
            mechanism: SPAN_SAMPLING_MECHANISM,
            rule_rate: rule.rate.value(),
            max_per_second: rule.max_per_second,
        })
    }
}
