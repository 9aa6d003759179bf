//! External interfaces (§6) that Link and Flow compose against. Concrete
//! message-broker clients, workflow-engine clients, and expression-language
//! compilers are out of scope for the core; it only depends on these narrow
//! traits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FisoError;

/// One unit of data flowing through a Flow pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub correlation_id: String,
}

/// Handler invoked by a [`Source`] for each event it delivers.
pub type EventHandler = Box<
    dyn Fn(Event) -> futures::future::BoxFuture<'static, Result<(), FisoError>> + Send + Sync,
>;

/// Delivers events serially from one driver loop. Broker sources commit
/// the offset only after the handler returns `Ok`; HTTP/gRPC sources
/// translate the handler's error into a non-2xx response.
#[async_trait]
pub trait Source: Send + Sync {
    async fn start(&self, handler: EventHandler) -> Result<(), FisoError>;
    async fn close(&self) -> Result<(), FisoError>;
}

/// Delivers a transformed, enveloped event. Delivery is synchronous from
/// the pipeline's point of view; at-least-once.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, bytes: &[u8], headers: &HashMap<String, String>) -> Result<(), FisoError>;
    async fn close(&self) -> Result<(), FisoError>;
}

/// Used by the dead-letter router and by broker sinks. A no-op
/// implementation (see [`NoopPublisher`]) is required when no broker is
/// configured.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(), FisoError>;
    async fn close(&self) -> Result<(), FisoError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(
        &self,
        _topic: &str,
        _key: Option<&[u8]>,
        _value: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<(), FisoError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), FisoError> {
        Ok(())
    }
}

/// Optional payload transform. A `None` transformer means passthrough;
/// this is a distinct concept from a transformer present but inert (the
/// "typed-nil" hazard called out in §9), so callers check `Option` rather
/// than an always-present trait object that might do nothing.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, FisoError>;
}

/// Direction an [`InterceptorRequest`] is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct InterceptorRequest {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub direction: Direction,
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn process(&self, request: InterceptorRequest) -> Result<InterceptorRequest, FisoError>;
    async fn close(&self) -> Result<(), FisoError>;
}

// `Resolver` lives in [`crate::resolver`] alongside its concrete
// implementations (`CachingResolver`, `StaticResolver`).

/// A compiled expression program. `Compile` returns `None` for a literal
/// (a string that does not parse as an expression); the envelope builder
/// treats a `None` program as "use the literal text".
pub trait Expression: Send + Sync {
    type Program: Send + Sync;

    fn compile(&self, expr: &str) -> Option<Self::Program>;
    fn evaluate(&self, program: &Self::Program, bindings: &serde_json::Value) -> serde_json::Value;
}
