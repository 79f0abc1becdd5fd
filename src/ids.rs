//! Trace/span identifiers, injectable clock, and injectable id generation.
//!
//! Grounded on `opentelemetry-sdk/src/trace/id_generator/mod.rs` (thread-local
//! RNG backed `IdGenerator`) and the Datadog propagator's 64/128-bit id
//! handling in `opentelemetry-datadog/src/lib.rs`.

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 128-bit trace identifier. The low 64 bits are the legacy Datadog trace id;
/// the high 64 bits only exist for W3C / 128-bit-aware wire formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub const ZERO: TraceId = TraceId { high: 0, low: 0 };

    pub fn new(high: u64, low: u64) -> Self {
        TraceId { high, low }
    }

    pub fn from_low(low: u64) -> Self {
        TraceId { high: 0, low }
    }

    pub fn from_u128(v: u128) -> Self {
        TraceId {
            high: (v >> 64) as u64,
            low: v as u64,
        }
    }

    pub fn to_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    pub fn is_zero(self) -> bool {
        self.high == 0 && self.low == 0
    }

    /// 32 lowercase hex chars, as used by W3C `traceparent` and B3.
    pub fn to_hex32(self) -> String {
        format!("{:032x}", self.to_u128())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() > 32 || s.is_empty() {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(Self::from_u128)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({:032x})", self.to_u128())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.to_u128())
    }
}

/// 64-bit span identifier. Zero means "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(pub u64);

impl SpanId {
    pub const ZERO: SpanId = SpanId(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_hex16(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() > 16 || s.is_empty() {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(SpanId)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({:016x})", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A wall-clock / monotonic-tick pair. Durations are always computed from the
/// monotonic `tick` half so that system clock adjustments can't produce
/// negative durations; `wall` alone is used for span start timestamps.
#[derive(Clone, Copy, Debug)]
pub struct Timestamp {
    pub wall: SystemTime,
    pub tick: Instant,
}

/// Interface for the tracer's notion of time. Pluggable so tests can freeze
/// or advance time deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Default [`Clock`] backed by `SystemTime::now()` / `Instant::now()`.
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            wall: SystemTime::now(),
            tick: Instant::now(),
        }
    }
}

/// Nanoseconds since the Unix epoch, saturating for any timestamp that
/// predates it (which should not happen for real wall clocks).
pub fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Interface for generating span and trace ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    fn new_trace_id(&self) -> TraceId;
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`], using a thread-local RNG the way
/// `opentelemetry_sdk::trace::RandomIdGenerator` does.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from_u128(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        // Span ids must never be zero (zero means "absent" in this model).
        CURRENT_RNG.with(|rng| loop {
            let id = rng.borrow_mut().gen::<u64>();
            if id != 0 {
                return SpanId(id);
            }
        })
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_round_trips_through_u128() {
        let id = TraceId::new(0x0af7651916cd43dd, 0x8448eb211c80319c);
        assert_eq!(TraceId::from_u128(id.to_u128()), id);
        assert_eq!(id.to_hex32(), "0af7651916cd43dd8448eb211c80319c");
    }

    #[test]
    fn trace_id_from_hex_rejects_oversized_input() {
        assert!(TraceId::from_hex(&"a".repeat(33)).is_none());
        assert!(TraceId::from_hex("").is_none());
    }

    #[test]
    fn span_id_hex_round_trip() {
        let id = SpanId(0xb7ad6b7169203331);
        assert_eq!(SpanId::from_hex(&id.to_hex16()), Some(id));
    }

    #[test]
    fn random_id_generator_never_yields_zero_span_id() {
        let gen = RandomIdGenerator::default();
        for _ in 0..1000 {
            assert!(!gen.new_span_id().is_zero());
        }
    }

    #[test]
    fn random_id_generator_ids_are_not_all_equal() {
        let gen = RandomIdGenerator::default();
        let a = gen.new_trace_id();
        let b = gen.new_trace_id();
        assert_ne!(a, b);
    }
}
