//! HTTP source and sink for fiso-flow. The HTTP source translates the
//! handler's result into the response status per §6 ("HTTP/gRPC sources
//! translate the handler's error into a non-2xx response"); the sink POSTs
//! the enveloped bytes to a configured URL.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use fiso_core::contracts::{Event, EventHandler, Sink, Source};
use fiso_core::error::FisoError;
use tokio::sync::Notify;

struct SourceState {
    handler: EventHandler,
    topic: String,
}

/// Drives the pipeline from inbound HTTP POSTs. `propagate-errors` is
/// expected `true` for this source: the caller needs the non-2xx status to
/// know delivery failed.
pub struct HttpSource {
    listen_addr: String,
    topic: String,
    shutdown: Notify,
}

impl HttpSource {
    pub fn new(listen_addr: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            topic: topic.into(),
            shutdown: Notify::new(),
        }
    }

    async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn start(&self, handler: EventHandler) -> Result<(), FisoError> {
        let state = Arc::new(SourceState {
            handler,
            topic: self.topic.clone(),
        });

        let app = Router::new().route("/", post(handle_event)).with_state(state);

        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|e| FisoError::Config(format!("invalid source listen-addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| FisoError::Fatal(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(addr = %addr, topic = %self.topic, "http source listening");

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(self.wait_for_shutdown())
            .await
            .map_err(|e| FisoError::Fatal(format!("http source server error: {e}")))
    }

    async fn close(&self) -> Result<(), FisoError> {
        self.shutdown.notify_one();
        Ok(())
    }
}

async fn handle_event(
    State(state): State<Arc<SourceState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let correlation_id = headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let event = Event {
        key: None,
        value: body.to_vec(),
        headers: header_map,
        topic: state.topic.clone(),
        partition: None,
        offset: None,
        correlation_id,
    };

    match (state.handler)(event).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "http source handler failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Delivers enveloped events by POSTing to a fixed URL.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, bytes: &[u8], headers: &HashMap<String, String>) -> Result<(), FisoError> {
        let mut request = self.client.post(&self.url).body(bytes.to_vec());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FisoError::UpstreamTransient(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(FisoError::UpstreamTransient(format!(
                "sink responded with status {}",
                response.status()
            )))
        }
    }

    async fn close(&self) -> Result<(), FisoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_reports_non_success_as_transient() {
        let client = reqwest::Client::new();
        let sink = HttpSink::new(client, "http://127.0.0.1:1/unreachable");
        let result = sink.deliver(b"{}", &HashMap::new()).await;
        assert!(result.is_err());
    }
}
