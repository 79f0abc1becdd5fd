//! # dd-trace-core
//!
//! A Datadog-compatible distributed tracing client core: span/trace-segment
//! data model, Datadog/W3C/B3 context propagation, trace- and span-level
//! sampling with token-bucket rate limiting, a MessagePack-encoding agent
//! HTTP client, and the background scheduler that drives periodic flush.
//!
//! This crate deliberately does not ship an HTTP transport: hosts inject
//! their own [`collector::HttpClient`] implementation, the way
//! `opentelemetry-http`'s `HttpClient` trait decouples the OTel SDK from any
//! particular async runtime or HTTP stack.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use dd_trace_core::collector::HttpClient;
//! use dd_trace_core::config::ConfigBuilder;
//! use dd_trace_core::sampling::span_sampler::SpanSampler;
//! use dd_trace_core::sampling::trace_sampler::TraceSampler;
//! use dd_trace_core::span::SpanConfig;
//! use dd_trace_core::tracer::Tracer;
//!
//! # fn example(http_client: Arc<dyn HttpClient>) {
//! let config = ConfigBuilder::new()
//!     .with_service("my-service")
//!     .finalize()
//!     .expect("DD_SERVICE or an explicit service name is required");
//!
//! let trace_sampler = Arc::new(TraceSampler::new(vec![], config.sample_rate, config.max_per_second));
//! let span_sampler = Arc::new(SpanSampler::new(vec![]));
//! let tracer = Tracer::new(config, trace_sampler, span_sampler, http_client);
//!
//! let span = tracer.create_span(SpanConfig { name: "web.request".into(), ..Default::default() });
//! span.finish();
//! tracer.shutdown();
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod glob;
pub mod ids;
pub mod logging;
pub mod msgpack;
pub mod propagation;
pub mod rate;
pub mod sampling;
pub mod scheduler;
pub mod span;
pub mod tracer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Error, Result};
