//! `rdkafka`-backed [`Publisher`] used for broker egress and DLQ routing
//! when the `kafka` feature is enabled.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fiso_core::contracts::Publisher;
use fiso_core::error::FisoError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;

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
