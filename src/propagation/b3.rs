//! B3 propagation: single-header and multi-header variants on extract,
//! single-header only on inject.
//!
//! Grounded on `opentelemetry-zipkin/src/propagator/mod.rs`'s `Propagator`
//! (`extract_single_header`/`extract_multi_header`, `B3Encoding` bitmask),
//! narrowed to always inject the single-header form per this system's
//! requirement.

use crate::error::Error;
use crate::ids::{SpanId, TraceId};
use crate::propagation::{ExtractedContext, Extractor, InjectContext, Injector, Propagator};
use crate::span::SamplingPriority;
use std::collections::HashMap;

pub const B3_SINGLE_HEADER: &str = "b3";
pub const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const B3_SAMPLED_HEADER: &str = "x-b3-sampled";
pub const B3_FLAGS_HEADER: &str = "x-b3-flags";

fn parse_trace_id_hex(s: &str) -> Option<TraceId> {
    if s.len() != 16 && s.len() != 32 {
        return None;
    }
    TraceId::from_hex(s)
}

fn sampled_from_flag(s: &str) -> Option<SamplingPriority> {
    match s {
        "0" => Some(SamplingPriority::AutoDrop),
        "1" | "d" | "true" => Some(SamplingPriority::AutoKeep),
        _ => None,
    }
}

/// B3 propagation.
#[derive(Debug, Clone, Default)]
pub struct B3Propagator;

impl B3Propagator {
    pub fn new() -> Self {
        B3Propagator
    }

    fn extract_single(&self, value: &str) -> Result<Option<ExtractedContext>, Error> {
        if value == "0" {
            // Explicit "do not sample, no context" signal; nothing to extract.
            return Ok(None);
        }
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() < 2 {
            return Err(Error::MalformedHeaders("b3 single header requires at least traceid-spanid".into()));
        }
        let trace_id = parse_trace_id_hex(parts[0]).ok_or_else(|| Error::MalformedTraceId(parts[0].to_string()))?;
        let span_id = SpanId::from_hex(parts[1]).ok_or_else(|| Error::MalformedSpanId(parts[1].to_string()))?;
        let priority = parts.get(2).and_then(|s| sampled_from_flag(s));

        Ok(Some(ExtractedContext {
            trace_id,
            parent_id: span_id,
            priority,
            origin: None,
            tags_to_propagate: HashMap::new(),
        }))
    }

    fn extract_multi(&self, carrier: &dyn Extractor) -> Result<Option<ExtractedContext>, Error> {
        let trace_id_raw = match carrier.get(B3_TRACE_ID_HEADER) {
            Some(v) => v,
            None => return Ok(None),
        };
        let trace_id = parse_trace_id_hex(trace_id_raw).ok_or_else(|| Error::MalformedTraceId(trace_id_raw.to_string()))?;

        let span_id_raw = carrier.get(B3_SPAN_ID_HEADER).ok_or(Error::MissingParentSpanId)?;
        let span_id = SpanId::from_hex(span_id_raw).ok_or_else(|| Error::MalformedSpanId(span_id_raw.to_string()))?;

        let priority = carrier
            .get(B3_FLAGS_HEADER)
            .filter(|f| *f == "1")
            .map(|_| SamplingPriority::AutoKeep)
            .or_else(|| carrier.get(B3_SAMPLED_HEADER).and_then(sampled_from_flag));

        Ok(Some(ExtractedContext {
            trace_id,
            parent_id: span_id,
            priority,
            origin: None,
            tags_to_propagate: HashMap::new(),
        }))
    }
}

impl Propagator for B3Propagator {
    fn name(&self) -> &'static str {
        "b3"
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<Option<ExtractedContext>, Error> {
        if let Some(single) = carrier.get(B3_SINGLE_HEADER) {
            return self.extract_single(single);
        }
        self.extract_multi(carrier)
    }

    fn inject(&self, ctx: &InjectContext, carrier: &mut dyn Injector) {
        let trace_id_hex = if ctx.trace_id.high != 0 {
            ctx.trace_id.to_hex32()
        } else {
            format!("{:016x}", ctx.trace_id.low)
        };
        let sampled = match ctx.priority {
            Some(p) if p.is_keep() => "1",
            Some(_) => "0",
            None => "0",
        };
        carrier.set(B3_SINGLE_HEADER, format!("{}-{}-{}", trace_id_hex, ctx.span_id.to_hex16(), sampled));
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
    fn extracts_single_header_form() {
        let carrier = carrier_with(&[(B3_SINGLE_HEADER, "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1")]);
        let ctx = B3Propagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.trace_id.to_hex32(), "80f198ee56343ba864fe8b2a57d3eff7");
        assert_eq!(ctx.parent_id, SpanId::from_hex("e457b5a2e4d86bd1").unwrap());
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn bare_zero_is_a_drop_signal_with_no_context() {
        let carrier = carrier_with(&[(B3_SINGLE_HEADER, "0")]);
        assert!(B3Propagator::new().extract(&carrier).unwrap().is_none());
    }

    #[test]
    fn extracts_multi_header_form() {
        let carrier = carrier_with(&[
            (B3_TRACE_ID_HEADER, "80f198ee56343ba864fe8b2a57d3eff7"),
            (B3_SPAN_ID_HEADER, "e457b5a2e4d86bd1"),
            (B3_SAMPLED_HEADER, "1"),
        ]);
        let ctx = B3Propagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn debug_flag_forces_sampled_regardless_of_sampled_header() {
        let carrier = carrier_with(&[
            (B3_TRACE_ID_HEADER, "80f198ee56343ba864fe8b2a57d3eff7"),
            (B3_SPAN_ID_HEADER, "e457b5a2e4d86bd1"),
            (B3_SAMPLED_HEADER, "0"),
            (B3_FLAGS_HEADER, "1"),
        ]);
        let ctx = B3Propagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn injection_always_uses_single_header_form() {
        let tags = HashMap::new();
        let ctx = InjectContext {
            trace_id: TraceId::from_low(0xe457b5a2e4d86bd1),
            span_id: SpanId(0x1234),
            priority: Some(SamplingPriority::AutoKeep),
            origin: None,
            tags_to_propagate: &tags,
        };
        let mut carrier = MapCarrier::default();
        B3Propagator::new().inject(&ctx, &mut carrier);
        assert!(carrier.get(B3_SINGLE_HEADER).is_some());
        assert!(carrier.get(B3_TRACE_ID_HEADER).is_none());
    }

    #[test]
    fn missing_span_id_in_multi_header_is_an_error() {
        let carrier = carrier_with(&[(B3_TRACE_ID_HEADER, "80f198ee56343ba864fe8b2a57d3eff7")]);
        let err = B3Propagator::new().extract(&carrier).unwrap_err();
        assert_eq!(err.code(), "MISSING_PARENT_SPAN_ID");
    }
}
