//! Canonical event envelope construction and dead-letter routing.

pub mod dlq;
pub mod envelope;

pub use dlq::{DeadLetterRouter, FailureRecord, TopicNaming};
pub use envelope::{EnvelopeBuilder, EnvelopeOverrides};
