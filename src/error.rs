//! Crate-wide error taxonomy.
//!
//! Grounded on `opentelemetry-datadog/src/exporter/model/mod.rs::Error`: a
//! flat `thiserror`-derived enum with one variant per stable failure code.

use thiserror::Error;

/// Stable error codes, per the external interface contract.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Other(String),

    #[error("service name is required")]
    ServiceNameRequired,

    #[error("rate must be within [0.0, 1.0], got {0}")]
    RateOutOfRange(f64),

    #[error("invalid integer in configuration value {0:?}: {1}")]
    InvalidInteger(String, std::num::ParseIntError),

    #[error("integer {0} out of allowed range for {1:?}")]
    OutOfRangeInteger(i64, String),

    #[error("malformed trace id: {0:?}")]
    MalformedTraceId(String),

    #[error("malformed span id: {0:?}")]
    MalformedSpanId(String),

    #[error("malformed headers: {0}")]
    MalformedHeaders(String),

    #[error("missing parent span id")]
    MissingParentSpanId,

    #[error("missing trace id")]
    MissingTraceId,

    #[error("extraction styles disagreed on trace context")]
    InconsistentExtractionStyles,

    #[error("agent request failed: {0}")]
    AgentHttpFailure(String),

    #[error("agent response malformed: {0}")]
    AgentResponseMalformed(String),

    #[error("buffer overflow: payload exceeds 4 GiB")]
    BufferOverflow,
}

impl Error {
    /// The stable string code associated with this error, suitable for
    /// metrics tagging or log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Other(_) => "OTHER",
            Error::ServiceNameRequired => "SERVICE_NAME_REQUIRED",
            Error::RateOutOfRange(_) => "RATE_OUT_OF_RANGE",
            Error::InvalidInteger(_, _) => "INVALID_INTEGER",
            Error::OutOfRangeInteger(_, _) => "OUT_OF_RANGE_INTEGER",
            Error::MalformedTraceId(_) => "MALFORMED_TRACE_ID",
            Error::MalformedSpanId(_) => "MALFORMED_SPAN_ID",
            Error::MalformedHeaders(_) => "MALFORMED_HEADERS",
            Error::MissingParentSpanId => "MISSING_PARENT_SPAN_ID",
            Error::MissingTraceId => "MISSING_TRACE_ID",
            Error::InconsistentExtractionStyles => "INCONSISTENT_EXTRACTION_STYLES",
            Error::AgentHttpFailure(_) => "AGENT_HTTP_FAILURE",
            Error::AgentResponseMalformed(_) => "AGENT_RESPONSE_MALFORMED",
            Error::BufferOverflow => "BUFFER_OVERFLOW",
        }
    }
}

/// Alias used specifically by configuration finalization.
pub type ConfigError = Error;

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_for_each_variant() {
        assert_eq!(Error::ServiceNameRequired.code(), "SERVICE_NAME_REQUIRED");
        assert_eq!(Error::BufferOverflow.code(), "BUFFER_OVERFLOW");
        assert_eq!(Error::RateOutOfRange(1.5).code(), "RATE_OUT_OF_RANGE");
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = Error::MissingTraceId;
        assert_eq!(err.to_string(), "missing trace id");
    }
}
