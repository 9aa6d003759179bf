//! Interceptor chain (§4.6): runs interceptors in declared order, each
//! wrapped with metrics recording and a fail-open/fail-closed policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use fiso_core::contracts::{Direction, Interceptor, InterceptorRequest};
use fiso_core::error::FisoError;

use crate::sandbox::Sandbox;

/// Adapts a [`Sandbox`] entry point into the [`Interceptor`] contract:
/// serializes the request, invokes the sandbox, and reconstructs the
/// request from its JSON reply, preserving direction.
pub struct SandboxedInterceptor {
    module: String,
    sandbox: Arc<dyn Sandbox>,
}

impl SandboxedInterceptor {
    pub fn new(module: impl Into<String>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            module: module.into(),
            sandbox,
        }
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Inbound => "inbound",
        Direction::Outbound => "outbound",
    }
}

#[async_trait]
impl Interceptor for SandboxedInterceptor {
    async fn process(&self, request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
        let payload: Value = serde_json::from_slice(&request.payload).unwrap_or(Value::Null);
        let input = serde_json::json!({
            "payload": payload,
            "headers": request.headers,
            "direction": direction_str(request.direction),
        });

        let output = self.sandbox.invoke(input).await?;

        let new_payload = output.get("payload").cloned().ok_or_else(|| {
            FisoError::Fatal(format!(
                "module {}: sandbox output missing payload field",
                self.module
            ))
        })?;
        let new_headers: HashMap<String, String> = output
            .get("headers")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| FisoError::Fatal(format!("module {}: invalid headers: {e}", self.module)))?
            .unwrap_or_default();

        let new_payload_bytes = serde_json::to_vec(&new_payload)
            .map_err(|e| FisoError::Fatal(format!("module {}: re-serialize payload: {e}", self.module)))?;

        Ok(InterceptorRequest {
            payload: new_payload_bytes,
            headers: new_headers,
            direction: request.direction,
        })
    }

    async fn close(&self) -> Result<(), FisoError> {
        self.sandbox.close().await
    }
}

/// Wraps a configured interceptor with always-on metrics recording and
/// the fail-open/fail-closed policy: when `fail_open` is true, an error is
/// logged and the *original* request is returned; when false, it
/// propagates.
pub struct WrappedInterceptor {
    module: String,
    phase_label: &'static str,
    fail_open: bool,
    inner: Arc<dyn Interceptor>,
}

impl WrappedInterceptor {
    pub fn new(
        module: impl Into<String>,
        phase_label: &'static str,
        fail_open: bool,
        inner: Arc<dyn Interceptor>,
    ) -> Self {
        Self {
            module: module.into(),
            phase_label,
            fail_open,
            inner,
        }
    }
}

#[async_trait]
impl Interceptor for WrappedInterceptor {
    async fn process(&self, request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
        let started = Instant::now();
        let original = request.clone();
        let result = self.inner.process(request).await;
        let success = result.is_ok();
        let duration = started.elapsed();

        #[cfg(feature = "metrics")]
        metrics::histogram!(
            "fiso_interceptor_duration_seconds",
            "module" => self.module.clone(),
            "phase" => self.phase_label,
            "success" => success.to_string()
        )
        .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;

        match result {
            Ok(req) => Ok(req),
            Err(err) if self.fail_open => {
                #[cfg(feature = "tracing")]
                tracing::warn!(module = %self.module, phase = self.phase_label, error = %err, "interceptor failed open");
                #[cfg(not(feature = "tracing"))]
                let _ = &err;
                Ok(original)
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> Result<(), FisoError> {
        self.inner.close().await
    }
}

/// Runs interceptors in declared order, threading each step's output into
/// the next. The first error aborts the chain without invoking subsequent
/// interceptors.
#[derive(Default, Clone)]
pub struct Chain {
    steps: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    pub fn new(steps: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(&self, mut request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
        for (i, step) in self.steps.iter().enumerate() {
            request = step
                .process(request)
                .await
                .map_err(|e| FisoError::Fatal(format!("interceptor[{i}]: {e}")))?;
        }
        Ok(request)
    }

    /// Closes every member, continuing even if one errors, and returns the
    /// first error encountered (if any).
    pub async fn close(&self) -> Result<(), FisoError> {
        let mut first_err = None;
        for step in &self.steps {
            if let Err(e) = step.close().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingInterceptor;

    #[async_trait]
    impl Interceptor for FailingInterceptor {
        async fn process(&self, _request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
            Err(FisoError::Fatal("boom".to_string()))
        }
        async fn close(&self) -> Result<(), FisoError> {
            Ok(())
        }
    }

    struct UppercaseInterceptor;

    #[async_trait]
    impl Interceptor for UppercaseInterceptor {
        async fn process(&self, mut request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
            request.headers.insert("X-Seen".to_string(), "yes".to_string());
            Ok(request)
        }
        async fn close(&self) -> Result<(), FisoError> {
            Ok(())
        }
    }

    fn req() -> InterceptorRequest {
        InterceptorRequest {
            payload: b"{}".to_vec(),
            headers: HashMap::new(),
            direction: Direction::Outbound,
        }
    }

    #[tokio::test]
    async fn chain_threads_output_through_steps() {
        let chain = Chain::new(vec![Arc::new(UppercaseInterceptor), Arc::new(UppercaseInterceptor)]);
        let result = chain.run(req()).await.unwrap();
        assert_eq!(result.headers.get("X-Seen").unwrap(), "yes");
    }

    #[tokio::test]
    async fn chain_aborts_on_first_error() {
        let chain = Chain::new(vec![Arc::new(FailingInterceptor), Arc::new(UppercaseInterceptor)]);
        let err = chain.run(req()).await.unwrap_err();
        assert!(err.to_string().contains("interceptor[0]"));
    }

    #[tokio::test]
    async fn fail_open_wrapper_returns_original_request_on_error() {
        let wrapped = WrappedInterceptor::new("mod", "outbound", true, Arc::new(FailingInterceptor));
        let request = req();
        let result = wrapped.process(request.clone()).await.unwrap();
        assert_eq!(result.payload, request.payload);
    }

    #[tokio::test]
    async fn fail_closed_wrapper_propagates_error() {
        let wrapped = WrappedInterceptor::new("mod", "outbound", false, Arc::new(FailingInterceptor));
        assert!(wrapped.process(req()).await.is_err());
    }

    struct RecordingCloseInterceptor(Arc<std::sync::atomic::AtomicUsize>, bool);

    #[async_trait]
    impl Interceptor for RecordingCloseInterceptor {
        async fn process(&self, request: InterceptorRequest) -> Result<InterceptorRequest, FisoError> {
            Ok(request)
        }
        async fn close(&self) -> Result<(), FisoError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.1 {
                Err(FisoError::Fatal("close failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn chain_close_continues_past_errors_and_returns_first() {
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let chain = Chain::new(vec![
            Arc::new(RecordingCloseInterceptor(closes.clone(), true)),
            Arc::new(RecordingCloseInterceptor(closes.clone(), false)),
        ]);
        let result = chain.close().await;
        assert!(result.is_err());
        assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
