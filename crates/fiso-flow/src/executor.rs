//! Pipeline executor (§4.9): runs each event through transform, interceptor
//! chain, envelope build, and sink delivery, routing any stage failure to
//! the dead-letter queue.

use std::collections::HashMap;
use std::sync::Arc;

use fiso_core::contracts::{Direction, Event, EventHandler, InterceptorRequest, Sink, Transformer};
use fiso_core::error::{FisoError, ProcessingStage};
use fiso_envelope::envelope::{EnvelopeBuilder, EnvelopeOverrides, CLOUDEVENTS_CONTENT_TYPE};
use fiso_envelope::DeadLetterRouter;
use fiso_interceptor::Chain;

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub flow_name: String,
    pub default_event_type: String,
    pub propagate_errors: bool,
    pub envelope_overrides: EnvelopeOverrides,
}

pub struct Executor<X: fiso_core::contracts::Expression> {
    config: FlowConfig,
    transformer: Option<Arc<dyn Transformer>>,
    chain: Chain,
    sink: Arc<dyn Sink>,
    dlq: Arc<DeadLetterRouter>,
    envelope: EnvelopeBuilder<X>,
}

impl<X> Executor<X>
where
    X: fiso_core::contracts::Expression + Send + Sync + 'static,
{
    pub fn new(
        config: FlowConfig,
        transformer: Option<Arc<dyn Transformer>>,
        chain: Chain,
        sink: Arc<dyn Sink>,
        dlq: Arc<DeadLetterRouter>,
        envelope: EnvelopeBuilder<X>,
    ) -> Self {
        Self {
            config,
            transformer,
            chain,
            sink,
            dlq,
            envelope,
        }
    }

    /// Produces the handler a [`fiso_core::contracts::Source`] drives per
    /// event. `self` must already be wrapped in an `Arc` since the handler
    /// outlives any single `start` call.
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let this = Arc::clone(self);
        Box::new(move |event: Event| {
            let this = Arc::clone(&this);
            Box::pin(async move { this.process(event).await })
        })
    }

    async fn process(&self, event: Event) -> Result<(), FisoError> {
        let original = event.value.clone();
        let mut payload = event.value.clone();

        if let Some(transformer) = &self.transformer {
            match transformer.transform(&payload).await {
                Ok(p) => payload = p,
                Err(e) => return self.fail(ProcessingStage::Transform, e, &original, &event).await,
            }
        }

        if !self.chain.is_empty() {
            let request = InterceptorRequest {
                payload: payload.clone(),
                headers: event.headers.clone(),
                direction: Direction::Inbound,
            };
            match self.chain.run(request).await {
                Ok(r) => payload = r.payload,
                Err(e) => return self.fail(ProcessingStage::Interceptor, e, &original, &event).await,
            }
        }

        let mut overrides = self.config.envelope_overrides.clone();
        if overrides.r#type.is_none() {
            overrides.r#type = Some(self.config.default_event_type.clone());
        }
        let envelope = match self.envelope.build(&payload, &original, &self.config.flow_name, &overrides) {
            Ok(v) => v,
            Err(e) => {
                let err = FisoError::processing(ProcessingStage::EnvelopeWrap, e.to_string());
                return self.fail(ProcessingStage::EnvelopeWrap, err, &original, &event).await;
            }
        };

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                let err = FisoError::processing(ProcessingStage::EnvelopeWrap, e.to_string());
                return self.fail(ProcessingStage::EnvelopeWrap, err, &original, &event).await;
            }
        };

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), CLOUDEVENTS_CONTENT_TYPE.to_string());

        if let Err(e) = self.sink.deliver(&bytes, &headers).await {
            return self.fail(ProcessingStage::SinkDelivery, e, &original, &event).await;
        }

        Ok(())
    }

    async fn fail(
        &self,
        stage: ProcessingStage,
        error: FisoError,
        original: &[u8],
        event: &Event,
    ) -> Result<(), FisoError> {
        let failure = fiso_envelope::FailureRecord::from_stage(
            stage,
            error.to_string(),
            event.topic.clone(),
            self.config.flow_name.clone(),
            event.correlation_id.clone(),
            0,
        );
        self.dlq.route(original, &failure).await;

        if self.config.propagate_errors {
            Err(error)
        } else {
            Ok(())
        }
    }

    /// Closes chain, sink, and DLQ in that order, joining all close errors
    /// (§4.9's shutdown ordering; the source itself is closed by its own
    /// driver loop before this runs).
    pub async fn close(&self) -> Result<(), FisoError> {
        let mut first_err = None;
        if let Err(e) = self.chain.close().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.sink.close().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.dlq.close().await {
            first_err.get_or_insert(e);
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
    use async_trait::async_trait;
    use fiso_core::contracts::{NoopPublisher, Publisher};
    use fiso_expr_jsonpath::JsonPathExpression;
    use std::sync::Mutex;

    struct UppercaseTransformer;

    #[async_trait]
    impl Transformer for UppercaseTransformer {
        async fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, FisoError> {
            let text = String::from_utf8_lossy(bytes).to_uppercase();
            Ok(text.into_bytes())
        }
    }

    struct FailingTransformer;

    #[async_trait]
    impl Transformer for FailingTransformer {
        async fn transform(&self, _bytes: &[u8]) -> Result<Vec<u8>, FisoError> {
            Err(FisoError::Fatal("boom".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(Vec<u8>, HashMap<String, String>)>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn deliver(&self, bytes: &[u8], headers: &HashMap<String, String>) -> Result<(), FisoError> {
            self.delivered.lock().unwrap().push((bytes.to_vec(), headers.clone()));
            Ok(())
        }
        async fn close(&self) -> Result<(), FisoError> {
            Ok(())
        }
    }

    fn event(value: &[u8]) -> Event {
        Event {
            key: None,
            value: value.to_vec(),
            headers: HashMap::new(),
            topic: "orders".to_string(),
            partition: None,
            offset: None,
            correlation_id: "corr-1".to_string(),
        }
    }

    fn flow_config(propagate: bool) -> FlowConfig {
        FlowConfig {
            flow_name: "f1".to_string(),
            default_event_type: "event".to_string(),
            propagate_errors: propagate,
            envelope_overrides: EnvelopeOverrides::default(),
        }
    }

    #[tokio::test]
    async fn delivers_transformed_envelope_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let dlq = Arc::new(DeadLetterRouter::new(
            Arc::new(NoopPublisher),
            fiso_envelope::TopicNaming::Default { dlq_prefix: "dlq-".to_string() },
            "x",
        ));
        let executor = Arc::new(Executor::new(
            flow_config(true),
            Some(Arc::new(UppercaseTransformer)),
            Chain::new(vec![]),
            sink.clone(),
            dlq,
            EnvelopeBuilder::new(JsonPathExpression, "fiso"),
        ));

        executor.process(event(br#""hi""#)).await.unwrap();

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let (bytes, headers) = &delivered[0];
        let envelope: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(envelope["data"], serde_json::json!("\"HI\""));
        assert_eq!(headers.get("Content-Type").unwrap(), CLOUDEVENTS_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn transform_failure_routes_to_dlq_and_propagates_when_configured() {
        #[derive(Default)]
        struct RecordingPublisher {
            calls: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl Publisher for RecordingPublisher {
            async fn publish(
                &self,
                topic: &str,
                _key: Option<&[u8]>,
                _value: &[u8],
                _headers: &HashMap<String, String>,
            ) -> Result<(), FisoError> {
                self.calls.lock().unwrap().push(topic.to_string());
                Ok(())
            }
            async fn close(&self) -> Result<(), FisoError> {
                Ok(())
            }
        }

        let publisher = Arc::new(RecordingPublisher::default());
        let dlq = Arc::new(DeadLetterRouter::new(
            publisher.clone(),
            fiso_envelope::TopicNaming::Default { dlq_prefix: "dlq-".to_string() },
            "x",
        ));
        let sink = Arc::new(RecordingSink::default());
        let executor = Arc::new(Executor::new(
            flow_config(true),
            Some(Arc::new(FailingTransformer)),
            Chain::new(vec![]),
            sink.clone(),
            dlq,
            EnvelopeBuilder::new(JsonPathExpression, "fiso"),
        ));

        let result = executor.process(event(b"{}")).await;
        assert!(result.is_err());
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_source_style_config_absorbs_errors() {
        let dlq = Arc::new(DeadLetterRouter::new(
            Arc::new(NoopPublisher),
            fiso_envelope::TopicNaming::Default { dlq_prefix: "dlq-".to_string() },
            "x",
        ));
        let sink = Arc::new(RecordingSink::default());
        let executor = Arc::new(Executor::new(
            flow_config(false),
            Some(Arc::new(FailingTransformer)),
            Chain::new(vec![]),
            sink,
            dlq,
            EnvelopeBuilder::new(JsonPathExpression, "fiso"),
        ));

        let result = executor.process(event(b"{}")).await;
        assert!(result.is_ok());
    }
}
