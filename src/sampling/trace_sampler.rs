use crate::glob::SpanMatcher;
use crate::rate::{Limiter, Rate};
use crate::sampling::sample_by_hash;
use crate::span::{SamplingDecision, SamplingMechanism, SamplingPriority};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// One ordered trace-sampling rule: a span predicate plus the rate to apply
/// when it matches.
pub struct TraceSamplerRule {
    pub matcher: SpanMatcher,
    pub rate: Rate,
}

/// Decides keep/drop for the local-root span of a segment, per the
/// precedence: manual override > extracted remote decision > first matching
/// user rule > agent-pushed per-service rate > default rate, gated by a
/// global token-bucket limiter.
pub struct TraceSampler {
    rules: Vec<TraceSamplerRule>,
    default_rate: Rate,
    agent_rates: RwLock<std::sync::Arc<HashMap<String, f64>>>,
    limiter: Limiter,
}

impl std::fmt::Debug for TraceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSampler")
            .field("rules", &self.rules.len())
            .field("default_rate", &self.default_rate)
            .finish()
    }
}

/// Builds the `service:svc,env:e` key the Datadog agent uses in its
/// `rate_by_service` response.
pub fn agent_rate_key(service: &str, env: Option<&str>) -> String {
    match env {
        Some(env) if !env.is_empty() => format!("service:{},env:{}", service, env),
        _ => format!("service:{},env:", service),
    }
}

impl TraceSampler {
    pub fn new(rules: Vec<TraceSamplerRule>, default_rate: Rate, max_per_second: f64) -> Self {
        TraceSampler {
            rules,
            default_rate,
            agent_rates: RwLock::new(std::sync::Arc::new(HashMap::new())),
            limiter: Limiter::new(max_per_second),
        }
    }

    /// Atomically replaces the agent rate table, per the agent's
    /// `rate_by_service` ingestion.
    pub fn update_rates(&self, rates: HashMap<String, f64>) {
        *self.agent_rates.write().unwrap() = std::sync::Arc::new(rates);
    }

    fn agent_rate_for(&self, service: &str, env: Option<&str>) -> Option<f64> {
        let snapshot = self.agent_rates.read().unwrap().clone();
        snapshot.get(&agent_rate_key(service, env)).copied()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        trace_id_low: u64,
        service: &str,
        env: Option<&str>,
        name: &str,
        resource: &str,
        tags: &HashMap<String, String>,
        extracted_priority: Option<SamplingPriority>,
        manual_override: Option<SamplingPriority>,
        now: Instant,
    ) -> SamplingDecision {
        if let Some(priority) = manual_override {
            return SamplingDecision::new(priority, SamplingMechanism::Manual);
        }
        if let Some(priority) = extracted_priority {
            return SamplingDecision::new(priority, SamplingMechanism::Remote);
        }

        let (rate, mechanism) = if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.matcher.matches(service, name, resource, tags))
        {
            (rule.rate.value(), SamplingMechanism::Rule)
        } else if let Some(agent_rate) = self.agent_rate_for(service, env) {
            (agent_rate, SamplingMechanism::AgentRate)
        } else {
            (self.default_rate.value(), SamplingMechanism::Default)
        };

        let mut decision = SamplingDecision::new(SamplingPriority::AutoDrop, mechanism);
        match mechanism {
            SamplingMechanism::Rule => decision.rule_rate = Some(rate),
            SamplingMechanism::AgentRate => decision.agent_rate = Some(rate),
            _ => {}
        }

        if !sample_by_hash(trace_id_low, rate) {
            return decision;
        }

        let (allowed, effective_rate) = self.limiter.allow(now);
        decision.limit_rate = Some(effective_rate);
        decision.priority = if allowed {
            SamplingPriority::AutoKeep
        } else {
            SamplingPriority::AutoDrop
        };
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tags() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn manual_override_wins_over_everything() {
        let sampler = TraceSampler::new(vec![], Rate::new(0.0).unwrap(), 1000.0);
        let decision = sampler.decide(
            1,
            "svc",
            None,
            "op",
            "op",
            &tags(),
            Some(SamplingPriority::AutoKeep),
            Some(SamplingPriority::UserKeep),
            Instant::now(),
        );
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, SamplingMechanism::Manual);
    }

    #[test]
    fn extracted_priority_is_honored_with_remote_mechanism() {
        let sampler = TraceSampler::new(vec![], Rate::new(0.0).unwrap(), 1000.0);
        let decision = sampler.decide(1, "svc", None, "op", "op", &tags(), Some(SamplingPriority::UserKeep), None, Instant::now());
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, SamplingMechanism::Remote);
    }

    #[test]
    fn default_rate_one_always_keeps_with_default_mechanism() {
        let sampler = TraceSampler::new(vec![], Rate::new(1.0).unwrap(), 1000.0);
        for trace_id_low in [1u64, 99999, u64::MAX / 3] {
            let decision = sampler.decide(trace_id_low, "svc", None, "op", "op", &tags(), None, None, Instant::now());
            assert_eq!(decision.priority, SamplingPriority::AutoKeep);
            assert_eq!(decision.mechanism, SamplingMechanism::Default);
        }
    }

    #[test]
    fn default_rate_zero_always_drops() {
        let sampler = TraceSampler::new(vec![], Rate::new(0.0).unwrap(), 1000.0);
        let decision = sampler.decide(42, "svc", None, "op", "op", &tags(), None, None, Instant::now());
        assert_eq!(decision.priority, SamplingPriority::AutoDrop);
    }

    #[test]
    fn matching_rule_takes_precedence_over_agent_and_default_rate() {
        let sampler = TraceSampler::new(
            vec![TraceSamplerRule {
                matcher: SpanMatcher::new().with_name("db.*"),
                rate: Rate::new(1.0).unwrap(),
            }],
            Rate::new(0.0).unwrap(),
            1000.0,
        );
        let decision = sampler.decide(7, "svc", None, "db.query", "db.query", &tags(), None, None, Instant::now());
        assert_eq!(decision.mechanism, SamplingMechanism::Rule);
        assert_eq!(decision.rule_rate, Some(1.0));
    }

    #[test]
    fn agent_rate_is_used_when_no_rule_matches() {
        let sampler = TraceSampler::new(vec![], Rate::new(0.0).unwrap(), 1000.0);
        let mut rates = HashMap::new();
        rates.insert(agent_rate_key("svc", Some("prod")), 1.0);
        sampler.update_rates(rates);
        let decision = sampler.decide(7, "svc", Some("prod"), "op", "op", &tags(), None, None, Instant::now());
        assert_eq!(decision.mechanism, SamplingMechanism::AgentRate);
        assert_eq!(decision.priority, SamplingPriority::AutoKeep);
    }

    #[test]
    fn limiter_downgrades_to_auto_drop_once_exhausted() {
        let sampler = TraceSampler::new(vec![], Rate::new(1.0).unwrap(), 1.0);
        let base = Instant::now();
        let first = sampler.decide(1, "svc", None, "op", "op", &tags(), None, None, base);
        assert_eq!(first.priority, SamplingPriority::AutoKeep);
        let second = sampler.decide(2, "svc", None, "op", "op", &tags(), None, None, base + Duration::from_millis(1));
        assert_eq!(second.priority, SamplingPriority::AutoDrop);
        assert_eq!(second.mechanism, SamplingMechanism::Default);
        assert!(second.limit_rate.is_some());
    }
}
