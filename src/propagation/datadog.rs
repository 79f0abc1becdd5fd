//! Datadog-style propagation headers.
//!
//! Grounded on `opentelemetry-datadog/src/lib.rs`'s `propagator` module
//! (`extract_trace_id`/`extract_span_id`/`extract_sampling_priority`), with
//! the header set extended per this system's field list (`x-datadog-tags`,
//! 128-bit trace id carried via `_dd.p.tid`).

use crate::error::Error;
use crate::ids::{SpanId, TraceId};
use crate::propagation::{parse_decimal_u64, ExtractedContext, Extractor, InjectContext, Injector, Propagator};
use crate::span::SamplingPriority;
use std::collections::HashMap;

pub const TRACE_ID_HEADER: &str = "x-datadog-trace-id";
pub const PARENT_ID_HEADER: &str = "x-datadog-parent-id";
pub const SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
pub const ORIGIN_HEADER: &str = "x-datadog-origin";
pub const TAGS_HEADER: &str = "x-datadog-tags";

/// Trace-tag key carrying the high 64 bits of a 128-bit trace id.
pub const TRACE_ID_HIGH_TAG: &str = "_dd.p.tid";

/// Default cap on the decoded length of `x-datadog-tags`, per the header
/// contract (configurable by constructing with [`DatadogPropagator::with_max_tags_len`]).
pub const DEFAULT_MAX_TAGS_LEN: usize = 512;

fn priority_from_i8(v: i64) -> Option<SamplingPriority> {
    match v {
        -1 => Some(SamplingPriority::UserDrop),
        0 => Some(SamplingPriority::AutoDrop),
        1 => Some(SamplingPriority::AutoKeep),
        2 => Some(SamplingPriority::UserKeep),
        _ => None,
    }
}

/// Encodes `tags` as the comma-separated `k=v` value of `x-datadog-tags`.
/// Values containing `=` or `,` are dropped (they cannot be represented)
/// rather than corrupting the header.
pub fn encode_tags(tags: &HashMap<String, String>) -> String {
    let mut entries: Vec<&String> = tags.keys().collect();
    entries.sort();
    entries
        .into_iter()
        .filter(|k| k.starts_with("_dd.p."))
        .filter_map(|k| {
            let v = &tags[k];
            if v.contains('=') || v.contains(',') {
                None
            } else {
                Some(format!("{}={}", k, v))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decodes the `x-datadog-tags` value, dropping any entry that doesn't fit
/// the `_dd.p.`-prefixed-key contract or that would push the decoded length
/// past `max_len`.
pub fn decode_tags(raw: &str, max_len: usize) -> HashMap<String, String> {
    if raw.len() > max_len {
        return HashMap::new();
    }
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k.starts_with("_dd.p.") {
                Some((k.to_string(), v.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Datadog-style header propagation.
#[derive(Debug, Clone)]
pub struct DatadogPropagator {
    max_tags_len: usize,
}

impl Default for DatadogPropagator {
    fn default() -> Self {
        DatadogPropagator {
            max_tags_len: DEFAULT_MAX_TAGS_LEN,
        }
    }
}

impl DatadogPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tags_len(max_tags_len: usize) -> Self {
        DatadogPropagator { max_tags_len }
    }
}

impl Propagator for DatadogPropagator {
    fn name(&self) -> &'static str {
        "datadog"
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<Option<ExtractedContext>, Error> {
        let trace_id_raw = match carrier.get(TRACE_ID_HEADER) {
            Some(v) => v,
            None => return Ok(None),
        };
        let trace_id_low =
            parse_decimal_u64(trace_id_raw).ok_or_else(|| Error::MalformedTraceId(trace_id_raw.to_string()))?;

        let parent_id_raw = carrier.get(PARENT_ID_HEADER).ok_or(Error::MissingParentSpanId)?;
        let parent_id = parse_decimal_u64(parent_id_raw).ok_or_else(|| Error::MalformedSpanId(parent_id_raw.to_string()))?;

        let priority = carrier
            .get(SAMPLING_PRIORITY_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(priority_from_i8);

        let origin = carrier.get(ORIGIN_HEADER).map(|s| s.to_string());

        let mut tags_to_propagate = carrier
            .get(TAGS_HEADER)
            .map(|raw| decode_tags(raw, self.max_tags_len))
            .unwrap_or_default();

        let mut trace_id = TraceId::from_low(trace_id_low);
        if let Some(high_hex) = tags_to_propagate.get(TRACE_ID_HIGH_TAG) {
            if let Ok(high) = u64::from_str_radix(high_hex, 16) {
                trace_id.high = high;
            } else {
                tags_to_propagate.remove(TRACE_ID_HIGH_TAG);
            }
        }

        Ok(Some(ExtractedContext {
            trace_id,
            parent_id: SpanId(parent_id),
            priority,
            origin,
            tags_to_propagate,
        }))
    }

    fn inject(&self, ctx: &InjectContext, carrier: &mut dyn Injector) {
        carrier.set(TRACE_ID_HEADER, ctx.trace_id.low.to_string());
        carrier.set(PARENT_ID_HEADER, ctx.span_id.0.to_string());
        if let Some(priority) = ctx.priority {
            carrier.set(SAMPLING_PRIORITY_HEADER, priority.as_i8().to_string());
        }
        if let Some(origin) = ctx.origin {
            carrier.set(ORIGIN_HEADER, origin.to_string());
        }

        let mut tags = ctx.tags_to_propagate.clone();
        if ctx.trace_id.high != 0 {
            tags.insert(TRACE_ID_HIGH_TAG.to_string(), format!("{:016x}", ctx.trace_id.high));
        }
        let encoded = encode_tags(&tags);
        if !encoded.is_empty() {
            carrier.set(TAGS_HEADER, encoded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::MapCarrier;

    fn carrier_with(pairs: &[(&str, &str)]) -> MapCarrier {
        let mut c = MapCarrier::default();
        for (k, v) in pairs {
            c.set(k, v.to_string());
        }
        c
    }

    #[test]
    fn extracts_trace_id_parent_id_and_priority() {
        let carrier = carrier_with(&[
            (TRACE_ID_HEADER, "12345"),
            (PARENT_ID_HEADER, "67"),
            (SAMPLING_PRIORITY_HEADER, "2"),
        ]);
        let ctx = DatadogPropagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.trace_id.low, 12345);
        assert_eq!(ctx.parent_id, SpanId(67));
        assert_eq!(ctx.priority, Some(SamplingPriority::UserKeep));
    }

    #[test]
    fn absent_trace_id_header_yields_no_context() {
        let carrier = MapCarrier::default();
        assert!(DatadogPropagator::new().extract(&carrier).unwrap().is_none());
    }

    #[test]
    fn malformed_trace_id_is_an_error() {
        let carrier = carrier_with(&[(TRACE_ID_HEADER, "not-a-number"), (PARENT_ID_HEADER, "1")]);
        let err = DatadogPropagator::new().extract(&carrier).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_TRACE_ID");
    }

    #[test]
    fn missing_parent_id_is_an_error_when_trace_id_present() {
        let carrier = carrier_with(&[(TRACE_ID_HEADER, "1")]);
        let err = DatadogPropagator::new().extract(&carrier).unwrap_err();
        assert_eq!(err.code(), "MISSING_PARENT_SPAN_ID");
    }

    #[test]
    fn injection_round_trips_through_extraction() {
        let mut tags = HashMap::new();
        tags.insert("_dd.p.dm".to_string(), "-0".to_string());
        let ctx = InjectContext {
            trace_id: TraceId::from_low(12345),
            span_id: SpanId(67),
            priority: Some(SamplingPriority::UserKeep),
            origin: Some("synthetics"),
            tags_to_propagate: &tags,
        };
        let mut carrier = MapCarrier::default();
        DatadogPropagator::new().inject(&ctx, &mut carrier);

        let extracted = DatadogPropagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(extracted.trace_id.low, 12345);
        assert_eq!(extracted.parent_id, SpanId(67));
        assert_eq!(extracted.priority, Some(SamplingPriority::UserKeep));
        assert_eq!(extracted.origin.as_deref(), Some("synthetics"));
        assert_eq!(extracted.tags_to_propagate.get("_dd.p.dm"), Some(&"-0".to_string()));
    }

    #[test]
    fn high_half_round_trips_via_tid_tag() {
        let tags = HashMap::new();
        let ctx = InjectContext {
            trace_id: TraceId::new(0x0af7651916cd43dd, 8448),
            span_id: SpanId(1),
            priority: None,
            origin: None,
            tags_to_propagate: &tags,
        };
        let mut carrier = MapCarrier::default();
        DatadogPropagator::new().inject(&ctx, &mut carrier);
        let extracted = DatadogPropagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(extracted.trace_id.high, 0x0af7651916cd43dd);
    }

    #[test]
    fn values_containing_forbidden_characters_are_dropped_from_tags_header() {
        let mut tags = HashMap::new();
        tags.insert("_dd.p.bad".to_string(), "has,comma".to_string());
        tags.insert("_dd.p.good".to_string(), "fine".to_string());
        let encoded = encode_tags(&tags);
        assert!(!encoded.contains("bad"));
        assert!(encoded.contains("_dd.p.good=fine"));
    }
}
