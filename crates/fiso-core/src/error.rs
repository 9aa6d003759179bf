//! Unified error type for the fiso runtime.
//!
//! [`FisoError`] collects every failure mode the core distinguishes so that
//! callers can match on a single type instead of threading per-component
//! errors through the call stack. Each variant maps to one of the error
//! kinds the runtime's admission and retry logic treat differently:
//! admission failures are never retried internally, upstream transient
//! failures are retried per the target's retry config, and processing
//! failures are routed to the dead-letter queue.

use std::fmt;

/// The stage of pipeline processing a [`FisoError::Processing`] failure
/// occurred in. Used by the dead-letter router to pick an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Transform,
    Interceptor,
    EnvelopeWrap,
    SinkDelivery,
}

impl ProcessingStage {
    /// The DLQ error code associated with this stage, per §8 of the spec
    /// (`TRANSFORM_FAILED`, `INTERCEPTOR_FAILED`, `ENVELOPE_WRAP_FAILED`,
    /// `SINK_DELIVERY_FAILED`).
    pub fn error_code(&self) -> &'static str {
        match self {
            ProcessingStage::Transform => "TRANSFORM_FAILED",
            ProcessingStage::Interceptor => "INTERCEPTOR_FAILED",
            ProcessingStage::EnvelopeWrap => "ENVELOPE_WRAP_FAILED",
            ProcessingStage::SinkDelivery => "SINK_DELIVERY_FAILED",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_code())
    }
}

/// Unified error type shared by Link and Flow.
#[derive(Debug, thiserror::Error)]
pub enum FisoError {
    /// Configuration is malformed or missing a required field. Fatal at
    /// startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Breaker rejected the call.
    #[error("circuit-open")]
    CircuitOpen,

    /// Rate limiter rejected the call.
    #[error("rate limited")]
    RateLimited,

    /// Allow-list denied the path.
    #[error("path denied")]
    PathDenied,

    /// Target does not permit the requested HTTP method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// No target registered under this name.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// Resolver, credential, or upstream failure that is worth retrying.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// Upstream responded with a non-retryable status.
    #[error("upstream permanent error ({status}): {message}")]
    UpstreamPermanent { status: u16, message: String },

    /// Transform, interceptor, envelope-build, or sink failure.
    #[error("{stage}: {message}")]
    Processing {
        stage: ProcessingStage,
        message: String,
    },

    /// Resolver failure with no cached fallback, or credential fetch
    /// failure. Surfaced as 500/502 and never retried by this layer.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The operation's cancellation token fired before it completed.
    #[error("cancelled")]
    Cancelled,
}

impl FisoError {
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            FisoError::CircuitOpen
                | FisoError::RateLimited
                | FisoError::PathDenied
                | FisoError::MethodNotAllowed
                | FisoError::UnknownTarget(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FisoError::UpstreamTransient(_))
    }

    pub fn processing(stage: ProcessingStage, message: impl Into<String>) -> Self {
        FisoError::Processing {
            stage,
            message: message.into(),
        }
    }
}

/// Marks whether an error produced by a retried operation should halt
/// retries immediately. Retry classification must use this wrapper rather
/// than string matching against the inner error (see §9, "Permanent vs
/// transient classification").
#[derive(Debug)]
pub enum Classified<E> {
    /// Worth another attempt.
    Transient(E),
    /// Stop retrying; return this error now.
    Permanent(E),
}

impl<E> Classified<E> {
    pub fn into_inner(self) -> E {
        match self {
            Classified::Transient(e) => e,
            Classified::Permanent(e) => e,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Classified::Permanent(_))
    }
}

/// Classifies an HTTP-like status code per §4.10 step 8: 5xx and 429 are
/// retryable, the rest of 4xx is permanent, everything else is success.
pub fn classify_status(status: u16) -> Classified<u16> {
    if status >= 500 || status == 429 {
        Classified::Transient(status)
    } else {
        Classified::Permanent(status)
    }
}
