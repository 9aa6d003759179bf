//! Target data model and the concurrent-safe target store (§3, §4.11).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::credentials::CredentialKind;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
    Kafka,
}

/// Key strategy for broker egress (§4.10.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "lowercase")]
pub enum KeyStrategy {
    None,
    Uuid,
    Header(String),
    Payload(String),
    Static(String),
    Random,
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rate: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub topic: String,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub static_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptorPhase {
    Outbound,
    Inbound,
}

impl Default for InterceptorPhase {
    fn default() -> Self {
        InterceptorPhase::Outbound
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    pub module: String,
    #[serde(default)]
    pub phase: InterceptorPhase,
    #[serde(default)]
    pub fail_open: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Per-target auth config (§3), resolved into a concrete
/// [`crate::credentials::CredentialProvider`] entry by the binary that
/// loads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum AuthConfig {
    File {
        kind: CredentialKind,
        path: String,
        #[serde(default)]
        header_name: Option<String>,
    },
    EnvVar {
        kind: CredentialKind,
        name: String,
        #[serde(default)]
        header_name: Option<String>,
    },
}

/// A named outbound endpoint. Immutable once loaded; target sets are
/// replaced atomically (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

// BreakerConfig and RetryConfig live in fiso-core too, but were not
// originally declared with serde derives (they're also constructed
// directly by in-process callers). Implement the config model's (de)serde
// bridge here rather than polluting the resilience primitives with a
// dependency on the config format.
impl Serialize for BreakerConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Shadow {
            failure_threshold: u32,
            success_threshold: u32,
            reset_timeout_ms: u64,
        }
        Shadow {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BreakerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(default)]
        struct Shadow {
            failure_threshold: u32,
            success_threshold: u32,
            reset_timeout_ms: u64,
        }
        impl Default for Shadow {
            fn default() -> Self {
                let d = BreakerConfig::default();
                Shadow {
                    failure_threshold: d.failure_threshold,
                    success_threshold: d.success_threshold,
                    reset_timeout_ms: d.reset_timeout.as_millis() as u64,
                }
            }
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(BreakerConfig {
            failure_threshold: shadow.failure_threshold,
            success_threshold: shadow.success_threshold,
            reset_timeout: std::time::Duration::from_millis(shadow.reset_timeout_ms),
        })
    }
}

impl Serialize for RetryConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Shadow {
            max_attempts: u32,
            initial_interval_ms: u64,
            max_interval_ms: u64,
            jitter_fraction: f64,
        }
        Shadow {
            max_attempts: self.max_attempts,
            initial_interval_ms: self.initial_interval.as_millis() as u64,
            max_interval_ms: self.max_interval.as_millis() as u64,
            jitter_fraction: self.jitter_fraction,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RetryConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(default)]
        struct Shadow {
            max_attempts: u32,
            initial_interval_ms: u64,
            max_interval_ms: u64,
            jitter_fraction: f64,
        }
        impl Default for Shadow {
            fn default() -> Self {
                let d = RetryConfig::default();
                Shadow {
                    max_attempts: d.max_attempts,
                    initial_interval_ms: d.initial_interval.as_millis() as u64,
                    max_interval_ms: d.max_interval.as_millis() as u64,
                    jitter_fraction: d.jitter_fraction,
                }
            }
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(RetryConfig {
            max_attempts: shadow.max_attempts,
            initial_interval: std::time::Duration::from_millis(shadow.initial_interval_ms),
            max_interval: std::time::Duration::from_millis(shadow.max_interval_ms),
            jitter_fraction: shadow.jitter_fraction,
        })
    }
}

/// Concurrent-safe mapping from target name to [`Target`]. Readers may
/// hold an `Arc` across updates; `replace` atomically swaps the whole map
/// so no reader ever observes a partial update.
#[derive(Clone)]
pub struct TargetStore {
    inner: Arc<RwLock<Arc<HashMap<String, Target>>>>,
}

impl TargetStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Target> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Target>> {
        self.inner.read().unwrap().clone()
    }

    /// Atomically replaces the whole target set.
    pub fn replace(&self, targets: Vec<Target>) {
        let map = targets.into_iter().map(|t| (t.name.clone(), t)).collect();
        *self.inner.write().unwrap() = Arc::new(map);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TargetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            protocol: Protocol::Https,
            host: "example.com".to_string(),
            allowed_paths: vec![],
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: None,
            broker: None,
            interceptors: vec![],
            auth: None,
        }
    }

    #[test]
    fn replace_is_atomic_and_visible_immediately() {
        let store = TargetStore::new();
        store.replace(vec![target("a")]);
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());

        store.replace(vec![target("b")]);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_replace() {
        let store = TargetStore::new();
        store.replace(vec![target("a")]);
        let snapshot = store.snapshot();
        store.replace(vec![target("b")]);
        assert!(snapshot.contains_key("a"));
        assert!(!snapshot.contains_key("b"));
    }
}
