//! Kafka source and sink for fiso-flow, enabled by the `kafka` feature.
//! The source commits the consumer offset only after the handler returns
//! `Ok` (§6); the sink publishes enveloped bytes to a fixed topic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fiso_core::contracts::{Event, EventHandler, Publisher, Sink, Source};
use fiso_core::error::FisoError;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::sync::Notify;

/// Drives the pipeline from a Kafka topic. `propagate-errors` is expected
/// `false` for this source: a handler failure routes to the DLQ and the
/// consumer keeps advancing rather than redelivering the same message.
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
    shutdown: Notify,
}

impl KafkaSource {
    pub fn new(bootstrap_servers: &str, topic: impl Into<String>, group_id: &str) -> Result<Self, FisoError> {
        let topic = topic.into();
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| FisoError::Fatal(format!("kafka consumer init: {e}")))?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| FisoError::Fatal(format!("kafka subscribe to {topic}: {e}")))?;
        Ok(Self {
            consumer,
            topic,
            shutdown: Notify::new(),
        })
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn start(&self, handler: EventHandler) -> Result<(), FisoError> {
        let mut stream = self.consumer.stream();
        tracing::info!(topic = %self.topic, "kafka source subscribed");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!(topic = %self.topic, "kafka source shutting down");
                    return Ok(());
                }
                next = stream.next() => {
                    let Some(message) = next else {
                        return Ok(());
                    };
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(error = %e, "kafka consumer poll error");
                            continue;
                        }
                    };

                    let mut headers = HashMap::new();
                    if let Some(h) = message.headers() {
                        for i in 0..h.count() {
                            let header = h.get(i);
                            if let Ok(v) = std::str::from_utf8(header.value.unwrap_or_default()) {
                                headers.insert(header.key.to_string(), v.to_string());
                            }
                        }
                    }

                    let event = Event {
                        key: message.key().map(|k| k.to_vec()),
                        value: message.payload().unwrap_or_default().to_vec(),
                        headers,
                        topic: self.topic.clone(),
                        partition: Some(message.partition()),
                        offset: Some(message.offset()),
                        correlation_id: uuid::Uuid::new_v4().to_string(),
                    };

                    match handler(event).await {
                        Ok(()) => {
                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(error = %e, "kafka offset commit failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "kafka source handler failed, skipping commit");
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), FisoError> {
        self.shutdown.notify_one();
        Ok(())
    }
}

/// Delivers enveloped events to a fixed Kafka topic, unkeyed.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(bootstrap_servers: &str, topic: impl Into<String>) -> Result<Self, FisoError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| FisoError::Fatal(format!("kafka producer init: {e}")))?;
        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn deliver(&self, bytes: &[u8], headers: &HashMap<String, String>) -> Result<(), FisoError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(bytes);
        let mut kafka_headers = rdkafka::message::OwnedHeaders::new();
        for (name, value) in headers {
            kafka_headers = kafka_headers.insert(rdkafka::message::Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }
        record = record.headers(kafka_headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|(e, _)| FisoError::UpstreamTransient(format!("kafka publish: {e}")))
    }

    async fn close(&self) -> Result<(), FisoError> {
        Ok(())
    }
}

/// Generic Kafka publisher, topic-per-call. Used as the dead-letter
/// publisher (§4.8) when the flow is wired to a Kafka source or sink, so a
/// failed event's DLQ entry actually reaches a topic instead of being
/// dropped by a no-op publisher.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(bootstrap_servers: &str) -> Result<Self, FisoError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| FisoError::Fatal(format!("kafka producer init: {e}")))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(), FisoError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(value);
        if let Some(k) = key {
            record = record.key(k);
        }
        let mut kafka_headers = rdkafka::message::OwnedHeaders::new();
        for (name, value) in headers {
            kafka_headers = kafka_headers.insert(rdkafka::message::Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }
        record = record.headers(kafka_headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|(e, _)| FisoError::UpstreamTransient(format!("kafka publish: {e}")))
    }

    async fn close(&self) -> Result<(), FisoError> {
        Ok(())
    }
}
