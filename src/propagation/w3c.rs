//! W3C `traceparent` / `tracestate` propagation.
//!
//! Grounded on `opentelemetry-sdk/src/propagation/trace_context.rs`: the
//! `version-traceid-spanid-flags` grammar, lowercase-hex validation, and the
//! all-zeros-is-invalid checks are carried over from that implementation;
//! the `dd=` vendor section of `tracestate` is added per this system's
//! interop requirement with the Datadog agent.

use crate::error::Error;
use crate::ids::{SpanId, TraceId};
use crate::propagation::{ExtractedContext, Extractor, InjectContext, Injector, Propagator};
use crate::span::SamplingPriority;
use std::collections::HashMap;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Trace-tag key under which unrecognized `tracestate` list members are
/// preserved verbatim so they can be re-emitted unchanged on injection.
const OTHER_TRACESTATE_TAG: &str = "_w3c.tracestate.other";

fn is_lowercase_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn all_zero_hex(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

fn priority_from_code(v: i64) -> Option<SamplingPriority> {
    match v {
        -1 => Some(SamplingPriority::UserDrop),
        0 => Some(SamplingPriority::AutoDrop),
        1 => Some(SamplingPriority::AutoKeep),
        2 => Some(SamplingPriority::UserKeep),
        _ => None,
    }
}

fn parse_traceparent(value: &str) -> Result<(TraceId, SpanId, u8), Error> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() < 4 {
        return Err(Error::MalformedHeaders("traceparent has fewer than 4 fields".into()));
    }
    let (version, trace_id_hex, span_id_hex, flags_hex) = (parts[0], parts[1], parts[2], parts[3]);

    if !is_lowercase_hex(version, 2) || version == "ff" {
        return Err(Error::MalformedHeaders("invalid traceparent version".into()));
    }
    if !is_lowercase_hex(trace_id_hex, 32) || all_zero_hex(trace_id_hex) {
        return Err(Error::MalformedTraceId(trace_id_hex.to_string()));
    }
    if !is_lowercase_hex(span_id_hex, 16) || all_zero_hex(span_id_hex) {
        return Err(Error::MalformedSpanId(span_id_hex.to_string()));
    }
    if !is_lowercase_hex(flags_hex, 2) {
        return Err(Error::MalformedHeaders("invalid traceparent flags".into()));
    }
    // Strict grammar for the only version this system emits; unknown
    // versions are accepted as long as the base 4 fields are well formed.
    if version == "00" && parts.len() != 4 {
        return Err(Error::MalformedHeaders("version 00 traceparent must have exactly 4 fields".into()));
    }

    let trace_id = TraceId::from_hex(trace_id_hex).ok_or_else(|| Error::MalformedTraceId(trace_id_hex.to_string()))?;
    let span_id = SpanId::from_hex(span_id_hex).ok_or_else(|| Error::MalformedSpanId(span_id_hex.to_string()))?;
    let flags = u8::from_str_radix(flags_hex, 16).map_err(|_| Error::MalformedHeaders("invalid flags hex".into()))?;
    Ok((trace_id, span_id, flags))
}

struct ParsedTracestate {
    priority: Option<SamplingPriority>,
    origin: Option<String>,
    tags: HashMap<String, String>,
    other_raw: String,
}

fn parse_tracestate(value: &str) -> ParsedTracestate {
    let mut priority = None;
    let mut origin = None;
    let mut tags = HashMap::new();
    let mut other_entries = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(dd_value) = entry.strip_prefix("dd=") {
            for field in dd_value.split(';') {
                let Some((key, val)) = field.split_once(':') else { continue };
                match key {
                    "s" => priority = val.parse::<i64>().ok().and_then(priority_from_code),
                    "o" => origin = Some(val.to_string()),
                    "p" => {
                        tags.insert("_dd.p.last_parent".to_string(), val.to_string());
                    }
                    t if t.starts_with("t.") => {
                        tags.insert(format!("_dd.p.{}", &t[2..]), val.to_string());
                    }
                    _ => {}
                }
            }
        } else {
            other_entries.push(entry.to_string());
        }
    }

    ParsedTracestate {
        priority,
        origin,
        tags,
        other_raw: other_entries.join(","),
    }
}

/// W3C `traceparent`/`tracestate` propagation.
#[derive(Debug, Clone, Default)]
pub struct W3cPropagator;

impl W3cPropagator {
    pub fn new() -> Self {
        W3cPropagator
    }
}

impl Propagator for W3cPropagator {
    fn name(&self) -> &'static str {
        "tracecontext"
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<Option<ExtractedContext>, Error> {
        let traceparent = match carrier.get(TRACEPARENT_HEADER) {
            Some(v) => v,
            None => return Ok(None),
        };
        let (trace_id, span_id, flags) = parse_traceparent(traceparent)?;
        let sampled = flags & 0x01 != 0;
        let mut priority = Some(if sampled {
            SamplingPriority::AutoKeep
        } else {
            SamplingPriority::AutoDrop
        });

        let mut tags_to_propagate = HashMap::new();
        let mut origin = None;
        if let Some(tracestate) = carrier.get(TRACESTATE_HEADER) {
            let parsed = parse_tracestate(tracestate);
            if let Some(p) = parsed.priority {
                priority = Some(p);
            }
            origin = parsed.origin;
            tags_to_propagate = parsed.tags;
            if !parsed.other_raw.is_empty() {
                tags_to_propagate.insert(OTHER_TRACESTATE_TAG.to_string(), parsed.other_raw);
            }
        }

        Ok(Some(ExtractedContext {
            trace_id,
            parent_id: span_id,
            priority,
            origin,
            tags_to_propagate,
        }))
    }

    fn inject(&self, ctx: &InjectContext, carrier: &mut dyn Injector) {
        let sampled = ctx.priority.map(SamplingPriority::is_keep).unwrap_or(false);
        let flags = if sampled { "01" } else { "00" };
        carrier.set(
            TRACEPARENT_HEADER,
            format!("00-{}-{}-{}", ctx.trace_id.to_hex32(), ctx.span_id.to_hex16(), flags),
        );

        let mut dd_fields = Vec::new();
        if let Some(priority) = ctx.priority {
            dd_fields.push(format!("s:{}", priority.as_i8()));
        }
        if let Some(origin) = ctx.origin {
            dd_fields.push(format!("o:{}", origin));
        }
        dd_fields.push(format!("p:{}", ctx.span_id.to_hex16()));
        for (k, v) in ctx.tags_to_propagate {
            if let Some(suffix) = k.strip_prefix("_dd.p.") {
                if suffix == "last_parent" {
                    continue;
                }
                dd_fields.push(format!("t.{}:{}", suffix, v));
            }
        }

        let mut entries = vec![format!("dd={}", dd_fields.join(";"))];
        if let Some(other) = ctx.tags_to_propagate.get(OTHER_TRACESTATE_TAG) {
            if !other.is_empty() {
                entries.push(other.clone());
            }
        }
        carrier.set(TRACESTATE_HEADER, entries.join(","));
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
    fn extracts_128_bit_trace_id_and_sampled_flag() {
        let carrier = carrier_with(&[(
            TRACEPARENT_HEADER,
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )]);
        let ctx = W3cPropagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.trace_id.to_u128(), 0x0af7651916cd43dd8448eb211c80319c);
        assert_eq!(ctx.parent_id, SpanId(0xb7ad6b7169203331));
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn reinjecting_produces_identical_traceparent_and_dd_section() {
        let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
        let span_id = SpanId::from_hex("b7ad6b7169203331").unwrap();
        let tags = HashMap::new();
        let ctx = InjectContext {
            trace_id,
            span_id,
            priority: Some(SamplingPriority::AutoKeep),
            origin: None,
            tags_to_propagate: &tags,
        };
        let mut carrier = MapCarrier::default();
        W3cPropagator::new().inject(&ctx, &mut carrier);
        assert_eq!(
            carrier.get(TRACEPARENT_HEADER),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        assert_eq!(carrier.get(TRACESTATE_HEADER), Some("dd=s:1;p:b7ad6b7169203331"));
    }

    #[test]
    fn rejects_all_zero_trace_id() {
        let carrier = carrier_with(&[(TRACEPARENT_HEADER, "00-00000000000000000000000000000000-b7ad6b7169203331-01")]);
        let err = W3cPropagator::new().extract(&carrier).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_TRACE_ID");
    }

    #[test]
    fn rejects_all_zero_span_id() {
        let carrier = carrier_with(&[(TRACEPARENT_HEADER, "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01")]);
        let err = W3cPropagator::new().extract(&carrier).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_SPAN_ID");
    }

    #[test]
    fn rejects_uppercase_hex() {
        let carrier = carrier_with(&[(TRACEPARENT_HEADER, "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01")]);
        assert!(W3cPropagator::new().extract(&carrier).is_err());
    }

    #[test]
    fn rejects_too_few_fields() {
        let carrier = carrier_with(&[(TRACEPARENT_HEADER, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331")]);
        assert!(W3cPropagator::new().extract(&carrier).is_err());
    }

    #[test]
    fn unknown_tracestate_entries_are_preserved_verbatim() {
        let carrier = carrier_with(&[
            (TRACEPARENT_HEADER, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            (TRACESTATE_HEADER, "other=value,dd=s:1;p:b7ad6b7169203331"),
        ]);
        let ctx = W3cPropagator::new().extract(&carrier).unwrap().unwrap();
        let mut carrier_out = MapCarrier::default();
        let inject_ctx = InjectContext {
            trace_id: ctx.trace_id,
            span_id: ctx.parent_id,
            priority: ctx.priority,
            origin: ctx.origin.as_deref(),
            tags_to_propagate: &ctx.tags_to_propagate,
        };
        W3cPropagator::new().inject(&inject_ctx, &mut carrier_out);
        assert!(carrier_out.get(TRACESTATE_HEADER).unwrap().contains("other=value"));
    }

    #[test]
    fn dd_priority_overrides_sampled_flag_derived_priority() {
        let carrier = carrier_with(&[
            (TRACEPARENT_HEADER, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00"),
            (TRACESTATE_HEADER, "dd=s:2;p:b7ad6b7169203331"),
        ]);
        let ctx = W3cPropagator::new().extract(&carrier).unwrap().unwrap();
        assert_eq!(ctx.priority, Some(SamplingPriority::UserKeep));
    }
}
