//! YAML config loading for fiso-flow (§4.9, modeled after §4.11's loader).

use fiso_core::target::InterceptorConfig;
use fiso_envelope::envelope::EnvelopeOverrides as RuntimeOverrides;
use serde::Deserialize;

fn default_flow_prefix() -> String {
    "fiso".to_string()
}

fn default_event_type() -> String {
    "event".to_string()
}

fn default_dlq_prefix() -> String {
    "dlq-".to_string()
}

fn default_header_prefix() -> String {
    "x-fiso".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Http {
        #[serde(rename = "listen-addr")]
        listen_addr: String,
        topic: String,
    },
    #[cfg(feature = "kafka")]
    Kafka {
        #[serde(rename = "bootstrap-servers")]
        bootstrap_servers: String,
        topic: String,
        #[serde(rename = "group-id")]
        group_id: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Http {
        url: String,
    },
    #[cfg(feature = "kafka")]
    Kafka {
        #[serde(rename = "bootstrap-servers")]
        bootstrap_servers: String,
        topic: String,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformerConfig {
    #[default]
    None,
    Passthrough,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvelopeOverridesConfig {
    pub id: Option<String>,
    pub source: Option<String>,
    pub r#type: Option<String>,
    pub subject: Option<String>,
    pub data: Option<String>,
    pub data_content_type: Option<String>,
    pub data_schema: Option<String>,
}

impl From<EnvelopeOverridesConfig> for RuntimeOverrides {
    fn from(c: EnvelopeOverridesConfig) -> Self {
        RuntimeOverrides {
            id: c.id,
            source: c.source,
            r#type: c.r#type,
            subject: c.subject,
            data: c.data,
            data_content_type: c.data_content_type,
            data_schema: c.data_schema,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawConfig {
    pub flow_name: String,
    #[serde(default = "default_flow_prefix")]
    pub flow_prefix: String,
    #[serde(default = "default_event_type")]
    pub default_event_type: String,
    #[serde(default)]
    pub propagate_errors: bool,
    #[serde(default = "default_dlq_prefix")]
    pub dlq_prefix: String,
    #[serde(default = "default_header_prefix")]
    pub dlq_header_prefix: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub envelope_overrides: EnvelopeOverridesConfig,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration:\n{}", .0.join("\n"))]
pub struct ConfigError(pub Vec<String>);

pub fn load(yaml: &str) -> Result<RawConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError(vec![e.to_string()]))?;
    validate(&raw)?;
    Ok(raw)
}

fn validate(raw: &RawConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    if raw.flow_name.is_empty() {
        errors.push("flow-name must not be empty".to_string());
    }
    match &raw.source {
        SourceConfig::Http { listen_addr, topic } => {
            if listen_addr.is_empty() {
                errors.push("source.listen-addr must not be empty".to_string());
            }
            if topic.is_empty() {
                errors.push("source.topic must not be empty".to_string());
            }
        }
        #[cfg(feature = "kafka")]
        SourceConfig::Kafka { bootstrap_servers, topic, group_id } => {
            if bootstrap_servers.is_empty() {
                errors.push("source.bootstrap-servers must not be empty".to_string());
            }
            if topic.is_empty() {
                errors.push("source.topic must not be empty".to_string());
            }
            if group_id.is_empty() {
                errors.push("source.group-id must not be empty".to_string());
            }
        }
    }
    match &raw.sink {
        SinkConfig::Http { url } => {
            if url.is_empty() {
                errors.push("sink.url must not be empty".to_string());
            }
        }
        #[cfg(feature = "kafka")]
        SinkConfig::Kafka { bootstrap_servers, topic } => {
            if bootstrap_servers.is_empty() {
                errors.push("sink.bootstrap-servers must not be empty".to_string());
            }
            if topic.is_empty() {
                errors.push("sink.topic must not be empty".to_string());
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_http_to_http_config() {
        let yaml = r#"
flow-name: orders
source:
  kind: http
  listen-addr: 0.0.0.0:8081
  topic: orders
sink:
  kind: http
  url: https://downstream.example.com/ingest
"#;
        let config = load(yaml).unwrap();
        assert_eq!(config.flow_name, "orders");
        assert_eq!(config.default_event_type, "event");
        assert!(!config.propagate_errors);
    }

    #[test]
    fn rejects_empty_flow_name() {
        let yaml = r#"
flow-name: ""
source:
  kind: http
  listen-addr: 0.0.0.0:8081
  topic: orders
sink:
  kind: http
  url: https://downstream.example.com/ingest
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("flow-name")));
    }
}
