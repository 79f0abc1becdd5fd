//! Configuration builder and environment-variable overlay.
//!
//! Grounded on `opentelemetry-sdk/src/trace/config.rs`'s builder shape and
//! `opentelemetry-datadog/src/exporter/model/unified_tags.rs`'s
//! `env::var(...)`-overlay pattern for reading `DD_*` variables.

use crate::error::{ConfigError, Error};
use crate::glob::SpanMatcher;
use crate::rate::Rate;
use std::collections::HashMap;
use std::time::Duration;

/// One user-configured trace sampling rule, prior to being turned into a
/// [`crate::sampling::trace_sampler::TraceSamplerRule`].
#[derive(Clone)]
pub struct TraceRuleConfig {
    pub matcher: SpanMatcher,
    pub rate: f64,
}

/// One user-configured span sampling rule.
#[derive(Clone)]
pub struct SpanRuleConfig {
    pub matcher: SpanMatcher,
    pub rate: f64,
    pub max_per_second: Option<f64>,
}

/// Finalized, validated configuration consumed by `Tracer::new`.
#[derive(Clone, Debug)]
pub struct Config {
    pub service: String,
    pub environment: Option<String>,
    pub version: Option<String>,
    pub agent_url: String,
    pub sample_rate: Rate,
    pub max_per_second: f64,
    pub propagation_styles_extract: Vec<String>,
    pub propagation_styles_inject: Vec<String>,
    pub report_hostname: bool,
    pub tags: HashMap<String, String>,
    pub startup_logs: bool,
    pub debug: bool,
    pub agent_timeout: Duration,
    pub flush_interval: Duration,
    pub shutdown_timeout: Duration,
}

const DEFAULT_AGENT_URL: &str = "http://localhost:8126";
const DEFAULT_MAX_PER_SECOND: f64 = 100.0;
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Builds a [`Config`], accepting explicit overrides before `finalize()`
/// applies the `DD_*` environment overlay and validates the result.
#[derive(Clone, Default)]
pub struct ConfigBuilder {
    service: Option<String>,
    environment: Option<String>,
    version: Option<String>,
    agent_url: Option<String>,
    sample_rate: Option<f64>,
    max_per_second: Option<f64>,
    propagation_styles_extract: Option<Vec<String>>,
    propagation_styles_inject: Option<Vec<String>>,
    report_hostname: Option<bool>,
    tags: HashMap<String, String>,
    startup_logs: Option<bool>,
    debug: Option<bool>,
    agent_timeout: Option<Duration>,
    trace_rules: Vec<TraceRuleConfig>,
    span_rules: Vec<SpanRuleConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    pub fn with_service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_env<S: Into<String>>(mut self, env: S) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_agent_url<S: Into<String>>(mut self, url: S) -> Self {
        self.agent_url = Some(url.into());
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn with_max_per_second(mut self, max_per_second: f64) -> Self {
        self.max_per_second = Some(max_per_second);
        self
    }

    pub fn with_propagation_styles_extract(mut self, styles: Vec<String>) -> Self {
        self.propagation_styles_extract = Some(styles);
        self
    }

    pub fn with_propagation_styles_inject(mut self, styles: Vec<String>) -> Self {
        self.propagation_styles_inject = Some(styles);
        self
    }

    pub fn with_report_hostname(mut self, report: bool) -> Self {
        self.report_hostname = Some(report);
        self
    }

    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_startup_logs(mut self, enabled: bool) -> Self {
        self.startup_logs = Some(enabled);
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = Some(enabled);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    pub fn with_trace_rule(mut self, rule: TraceRuleConfig) -> Self {
        self.trace_rules.push(rule);
        self
    }

    pub fn with_span_rule(mut self, rule: SpanRuleConfig) -> Self {
        self.span_rules.push(rule);
        self
    }

    pub fn trace_rules(&self) -> &[TraceRuleConfig] {
        &self.trace_rules
    }

    pub fn span_rules(&self) -> &[SpanRuleConfig] {
        &self.span_rules
    }

    /// Applies the `DD_*` environment overlay and validates. Explicit
    /// builder values take precedence over the environment; the environment
    /// takes precedence over hardcoded defaults.
    pub fn finalize(self) -> Result<Config, ConfigError> {
        self.finalize_with_env(&std::env::vars().collect::<HashMap<_, _>>())
    }

    /// Testable variant of [`Self::finalize`] taking an explicit environment
    /// map instead of reading the process environment.
    pub fn finalize_with_env(self, env: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let service = self
            .service
            .or_else(|| env.get("DD_SERVICE").cloned())
            .ok_or(Error::ServiceNameRequired)?;

        let environment = self.environment.or_else(|| env.get("DD_ENV").cloned());
        let version = self.version.or_else(|| env.get("DD_VERSION").cloned());

        let agent_url = self
            .agent_url
            .or_else(|| env.get("DD_TRACE_AGENT_URL").cloned())
            .or_else(|| {
                let host = env.get("DD_AGENT_HOST")?;
                let port = env.get("DD_TRACE_AGENT_PORT").map(String::as_str).unwrap_or("8126");
                Some(format!("http://{}:{}", host, port))
            })
            .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string());

        let sample_rate_value = match self.sample_rate {
            Some(v) => v,
            None => match env.get("DD_TRACE_SAMPLE_RATE") {
                Some(raw) => parse_f64(raw, "DD_TRACE_SAMPLE_RATE")?,
                None => 1.0,
            },
        };
        let sample_rate = Rate::new(sample_rate_value)?;

        let max_per_second = match self.max_per_second {
            Some(v) => v,
            None => match env.get("DD_TRACE_RATE_LIMIT") {
                Some(raw) => parse_f64(raw, "DD_TRACE_RATE_LIMIT")?,
                None => DEFAULT_MAX_PER_SECOND,
            },
        };

        let propagation_styles_extract = self
            .propagation_styles_extract
            .or_else(|| env.get("DD_TRACE_PROPAGATION_STYLE_EXTRACT").map(|v| parse_style_list(v)))
            .unwrap_or_else(default_styles);

        let propagation_styles_inject = self
            .propagation_styles_inject
            .or_else(|| env.get("DD_TRACE_PROPAGATION_STYLE_INJECT").map(|v| parse_style_list(v)))
            .unwrap_or_else(default_styles);

        let report_hostname = self
            .report_hostname
            .or_else(|| env.get("DD_TRACE_REPORT_HOSTNAME").map(|v| parse_bool(v)))
            .unwrap_or(false);

        let mut tags = self.tags;
        if let Some(raw) = env.get("DD_TAGS") {
            for (k, v) in parse_tag_list(raw) {
                tags.entry(k).or_insert(v);
            }
        }

        let startup_logs = self
            .startup_logs
            .or_else(|| env.get("DD_TRACE_STARTUP_LOGS").map(|v| parse_bool(v)))
            .unwrap_or(false);

        let debug = self
            .debug
            .or_else(|| env.get("DD_TRACE_DEBUG").map(|v| parse_bool(v)))
            .unwrap_or(false);

        let agent_timeout = match self.agent_timeout {
            Some(v) => v,
            None => match env.get("DD_TRACE_AGENT_TIMEOUT") {
                Some(raw) => Duration::from_secs_f64(parse_f64(raw, "DD_TRACE_AGENT_TIMEOUT")?),
                None => DEFAULT_AGENT_TIMEOUT,
            },
        };

        Ok(Config {
            service,
            environment,
            version,
            agent_url,
            sample_rate,
            max_per_second,
            propagation_styles_extract,
            propagation_styles_inject,
            report_hostname,
            tags,
            startup_logs,
            debug,
            agent_timeout,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }
}

fn default_styles() -> Vec<String> {
    vec!["datadog".to_string(), "tracecontext".to_string()]
}

fn parse_style_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty()).collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_tag_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_f64(raw: &str, var_name: &str) -> Result<f64, Error> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| Error::Other(format!("invalid numeric value for {}: {:?}", var_name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn service_is_required() {
        let err = ConfigBuilder::new().finalize_with_env(&HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "SERVICE_NAME_REQUIRED");
    }

    #[test]
    fn explicit_service_satisfies_the_requirement() {
        let config = ConfigBuilder::new().with_service("svc").finalize_with_env(&HashMap::new()).unwrap();
        assert_eq!(config.service, "svc");
        assert_eq!(config.agent_url, DEFAULT_AGENT_URL);
        assert_eq!(config.sample_rate.value(), 1.0);
    }

    #[test]
    fn env_overlay_fills_unset_fields() {
        let config = ConfigBuilder::new()
            .finalize_with_env(&env(&[("DD_SERVICE", "svc"), ("DD_ENV", "prod"), ("DD_TRACE_SAMPLE_RATE", "0.5")]))
            .unwrap();
        assert_eq!(config.environment.as_deref(), Some("prod"));
        assert_eq!(config.sample_rate.value(), 0.5);
    }

    #[test]
    fn explicit_builder_value_wins_over_env() {
        let config = ConfigBuilder::new()
            .with_service("explicit")
            .finalize_with_env(&env(&[("DD_SERVICE", "from-env")]))
            .unwrap();
        assert_eq!(config.service, "explicit");
    }

    #[test]
    fn agent_host_and_port_env_vars_combine_into_a_url() {
        let config = ConfigBuilder::new()
            .finalize_with_env(&env(&[("DD_SERVICE", "svc"), ("DD_AGENT_HOST", "agent.internal"), ("DD_TRACE_AGENT_PORT", "9126")]))
            .unwrap();
        assert_eq!(config.agent_url, "http://agent.internal:9126");
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let err = ConfigBuilder::new()
            .finalize_with_env(&env(&[("DD_SERVICE", "svc"), ("DD_TRACE_SAMPLE_RATE", "1.5")]))
            .unwrap_err();
        assert_eq!(err.code(), "RATE_OUT_OF_RANGE");
    }

    #[test]
    fn dd_tags_are_parsed_as_colon_separated_pairs() {
        let config = ConfigBuilder::new()
            .finalize_with_env(&env(&[("DD_SERVICE", "svc"), ("DD_TAGS", "team:infra,tier:1")]))
            .unwrap();
        assert_eq!(config.tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(config.tags.get("tier").map(String::as_str), Some("1"));
    }

    #[test]
    fn propagation_styles_default_to_datadog_and_tracecontext() {
        let config = ConfigBuilder::new().with_service("svc").finalize_with_env(&HashMap::new()).unwrap();
        assert_eq!(config.propagation_styles_extract, vec!["datadog", "tracecontext"]);
    }
}
