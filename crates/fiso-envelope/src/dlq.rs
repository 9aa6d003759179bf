//! Dead-letter router (§4.8): publishes failed events to a DLQ topic with
//! structured failure headers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fiso_core::contracts::Publisher;
use fiso_core::error::ProcessingStage;

/// Everything the router needs to describe why an event failed.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub original_topic: String,
    pub error_code: String,
    pub error_message: String,
    pub retry_count: u32,
    pub flow_name: String,
    pub correlation_id: String,
}

impl FailureRecord {
    pub fn from_stage(
        stage: ProcessingStage,
        message: impl Into<String>,
        original_topic: impl Into<String>,
        flow_name: impl Into<String>,
        correlation_id: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            original_topic: original_topic.into(),
            error_code: stage.error_code().to_string(),
            error_message: message.into(),
            retry_count,
            flow_name: flow_name.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Builds DLQ topic names. Default: `<dlq-prefix><flow-name>`; a custom
/// function can override the mapping per §4.8.
pub enum TopicNaming {
    Default { dlq_prefix: String },
    Custom(Box<dyn Fn(&str) -> String + Send + Sync>),
}

impl TopicNaming {
    pub fn topic_for(&self, flow_name: &str) -> String {
        match self {
            TopicNaming::Default { dlq_prefix } => format!("{dlq_prefix}{flow_name}"),
            TopicNaming::Custom(f) => f(flow_name),
        }
    }
}

/// Publishes failures to a DLQ topic. Publisher failures are logged, not
/// propagated: event processing continues with the next event regardless
/// of whether the dead-letter actually lands.
pub struct DeadLetterRouter {
    publisher: Arc<dyn Publisher>,
    naming: TopicNaming,
    header_prefix: String,
}

impl DeadLetterRouter {
    pub fn new(publisher: Arc<dyn Publisher>, naming: TopicNaming, header_prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            naming,
            header_prefix: header_prefix.into(),
        }
    }

    pub async fn route(&self, value: &[u8], failure: &FailureRecord) {
        let topic = self.naming.topic_for(&failure.flow_name);
        let mut headers = HashMap::new();
        let p = &self.header_prefix;
        headers.insert(format!("{p}-original-topic"), failure.original_topic.clone());
        headers.insert(format!("{p}-error-code"), failure.error_code.clone());
        headers.insert(format!("{p}-error-message"), failure.error_message.clone());
        headers.insert(format!("{p}-retry-count"), failure.retry_count.to_string());
        headers.insert(format!("{p}-failed-at"), Utc::now().to_rfc3339());
        headers.insert(format!("{p}-flow-name"), failure.flow_name.clone());
        headers.insert(format!("{p}-correlation-id"), failure.correlation_id.clone());

        if let Err(_err) = self.publisher.publish(&topic, None, value, &headers).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(topic = %topic, error = %_err, "dead-letter publish failed");
        }
    }

    pub async fn close(&self) -> Result<(), fiso_core::error::FisoError> {
        self.publisher.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fiso_core::error::FisoError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<(String, Option<Vec<u8>>, Vec<u8>, HashMap<String, String>)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            key: Option<&[u8]>,
            value: &[u8],
            headers: &HashMap<String, String>,
        ) -> Result<(), FisoError> {
            self.calls.lock().unwrap().push((
                topic.to_string(),
                key.map(|k| k.to_vec()),
                value.to_vec(),
                headers.clone(),
            ));
            Ok(())
        }
        async fn close(&self) -> Result<(), FisoError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_to_default_topic_with_structured_headers() {
        let publisher = Arc::new(RecordingPublisher::default());
        let router = DeadLetterRouter::new(
            publisher.clone(),
            TopicNaming::Default {
                dlq_prefix: "dlq-".to_string(),
            },
            "x",
        );

        let failure = FailureRecord::from_stage(
            ProcessingStage::Transform,
            "x",
            "orders",
            "f1",
            "corr-1",
            0,
        );
        router.route(br#"{"bad":true}"#, &failure).await;

        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (topic, _key, value, headers) = &calls[0];
        assert_eq!(topic, "dlq-f1");
        assert_eq!(value, br#"{"bad":true}"#);
        assert_eq!(headers.get("x-error-code").unwrap(), "TRANSFORM_FAILED");
        assert_eq!(headers.get("x-original-topic").unwrap(), "orders");
        assert_eq!(headers.get("x-flow-name").unwrap(), "f1");
    }

    #[tokio::test]
    async fn custom_naming_overrides_default_topic() {
        let publisher = Arc::new(RecordingPublisher::default());
        let router = DeadLetterRouter::new(
            publisher.clone(),
            TopicNaming::Custom(Box::new(|flow| format!("custom-{flow}-dead"))),
            "x",
        );
        let failure = FailureRecord::from_stage(
            ProcessingStage::SinkDelivery,
            "boom",
            "orders",
            "f2",
            "corr-2",
            1,
        );
        router.route(b"{}", &failure).await;
        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls[0].0, "custom-f2-dead");
    }
}
