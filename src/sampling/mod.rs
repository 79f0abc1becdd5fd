//! Trace-level and span-level sampling.
//!
//! Grounded on `opentelemetry-sdk/src/trace/sampler.rs`'s `ShouldSample`
//! shape (rule list + rate + decision) and on
//! `opentelemetry-sdk/src/trace/sampler/jaeger_remote/rate_limit.rs`'s
//! `LeakyBucket` for the limiter integration, generalized to the exact
//! deterministic trace-id-hash formula specified for this system.

pub mod span_sampler;
pub mod trace_sampler;

pub use span_sampler::{SpanSampler, SpanSamplingOutcome, SpanSamplingRule};
pub use trace_sampler::{TraceSampler, TraceSamplerRule};

/// Deterministic keep/drop draw shared by the trace and span samplers:
/// `keep iff (id * 1111111111111111111 mod 2^64) / 2^64 < rate`.
pub(crate) fn sample_by_hash(id_low: u64, rate: f64) -> bool {
    const KNUTH_CONSTANT: u64 = 1_111_111_111_111_111_111;
    let product = id_low.wrapping_mul(KNUTH_CONSTANT);
    let fraction = product as f64 / (u64::MAX as f64 + 1.0);
    fraction < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_draw_is_deterministic_for_fixed_inputs() {
        let a = sample_by_hash(12345, 0.5);
        let b = sample_by_hash(12345, 0.5);
        assert_eq!(a, b);
    }

    #[test]
    fn rate_zero_never_keeps_and_rate_one_always_keeps() {
        for id in [0u64, 1, 42, u64::MAX, 987654321] {
            assert!(!sample_by_hash(id, 0.0));
            assert!(sample_by_hash(id, 1.0));
        }
    }
}
