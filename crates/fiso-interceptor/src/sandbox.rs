//! Sandbox lifecycle (§4.6): untrusted payload-rewriting modules are
//! invoked through a JSON-in/JSON-out ABI so the host never depends on a
//! module's native type layout.
//!
//! No WASM or other native sandboxing runtime is wired in here — Link and
//! Flow only need the boundary, not a specific isolation technology, and
//! the in-process implementation below is sufficient for modules trusted
//! enough to run natively while still respecting the ABI contract.

use async_trait::async_trait;
use serde_json::Value;

use fiso_core::error::FisoError;

/// A loaded sandbox entry point. `invoke` receives the serialized
/// `{payload, headers, direction}` envelope and must return
/// `{payload, headers}`; anything that fails to deserialize as that shape
/// is an error.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn invoke(&self, input: Value) -> Result<Value, FisoError>;
    async fn close(&self) -> Result<(), FisoError>;
}

/// A sandbox backed by a native Rust closure. Stands in for modules that
/// would otherwise be loaded from an untrusted artifact: the host-side
/// contract (JSON in, JSON out, closable) is identical either way.
pub struct NativeSandbox<F>
where
    F: Fn(Value) -> Result<Value, FisoError> + Send + Sync,
{
    entry: F,
}

impl<F> NativeSandbox<F>
where
    F: Fn(Value) -> Result<Value, FisoError> + Send + Sync,
{
    pub fn new(entry: F) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl<F> Sandbox for NativeSandbox<F>
where
    F: Fn(Value) -> Result<Value, FisoError> + Send + Sync,
{
    async fn invoke(&self, input: Value) -> Result<Value, FisoError> {
        (self.entry)(input)
    }

    async fn close(&self) -> Result<(), FisoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn native_sandbox_round_trips_json() {
        let sandbox = NativeSandbox::new(|input: Value| {
            let mut out = input;
            out["payload"] = serde_json::json!({"rewritten": true});
            Ok(out)
        });
        let result = sandbox
            .invoke(serde_json::json!({"payload": {"x": 1}, "headers": {}, "direction": "outbound"}))
            .await
            .unwrap();
        assert_eq!(result["payload"], serde_json::json!({"rewritten": true}));
        sandbox.close().await.unwrap();
    }
}
