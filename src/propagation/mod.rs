//! Context propagation: extraction from and injection into header-style
//! carriers, across the Datadog, W3C `tracecontext`, and B3 styles.
//!
//! The `Extractor`/`Injector` carrier traits are modeled on
//! `opentelemetry-http/src/lib.rs`'s `HeaderExtractor`/`HeaderInjector`,
//! generalized from `http::HeaderMap` to any ordered string map so the core
//! crate doesn't need to depend on `http` for its propagation surface.

pub mod b3;
pub mod datadog;
pub mod w3c;

use crate::error::Error;
use crate::ids::{SpanId, TraceId};
use crate::span::SamplingPriority;
use std::collections::HashMap;

/// Read side of a carrier: an ordered string-to-string multimap.
pub trait Extractor {
    /// The first value for `key`, if any. Lookups are case-insensitive on
    /// header-style carriers, so implementations should lowercase `key`
    /// before looking it up if their backing store is not already
    /// normalized.
    fn get(&self, key: &str) -> Option<&str>;
    /// All values for `key`, in carrier order.
    fn get_all(&self, key: &str) -> Vec<&str>;
    fn keys(&self) -> Vec<&str>;
}

/// Write side of a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// A plain in-memory carrier, primarily used in tests and by hosts that
/// don't already have an `http::HeaderMap` on hand.
#[derive(Clone, Debug, Default)]
pub struct MapCarrier(pub HashMap<String, String>);

impl Extractor for MapCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
    fn get_all(&self, key: &str) -> Vec<&str> {
        self.get(key).into_iter().collect()
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl Injector for MapCarrier {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

/// The trace context recovered from a carrier by one propagation style.
#[derive(Clone, Debug)]
pub struct ExtractedContext {
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub priority: Option<SamplingPriority>,
    pub origin: Option<String>,
    pub tags_to_propagate: HashMap<String, String>,
}

/// The trace context handed to a style's `inject`.
#[derive(Clone, Debug)]
pub struct InjectContext<'a> {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub priority: Option<SamplingPriority>,
    pub origin: Option<&'a str>,
    pub tags_to_propagate: &'a HashMap<String, String>,
}

/// One context propagation style: Datadog headers, W3C `traceparent`, or B3.
pub trait Propagator: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn extract(&self, carrier: &dyn Extractor) -> Result<Option<ExtractedContext>, Error>;
    fn inject(&self, ctx: &InjectContext, carrier: &mut dyn Injector);
}

/// Parses a decimal (Datadog-style) or hex (W3C/B3-style) id string,
/// rejecting embedded whitespace and non-digit characters that `FromStr`
/// would otherwise silently truncate.
pub(crate) fn parse_decimal_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_carrier_round_trips_a_header() {
        let mut carrier = MapCarrier::default();
        carrier.set("X-Datadog-Trace-Id", "123".to_string());
        assert_eq!(carrier.get("x-datadog-trace-id"), Some("123"));
    }

    #[test]
    fn parse_decimal_rejects_non_digit_input() {
        assert_eq!(parse_decimal_u64("123"), Some(123));
        assert_eq!(parse_decimal_u64("12a"), None);
        assert_eq!(parse_decimal_u64(""), None);
        assert_eq!(parse_decimal_u64(" 1"), None);
    }
}
