//! Credential provider (§4.5): file/env/vault-backed token issuance with
//! proactively refreshed cached leases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::{system_clock, SharedClock};
use crate::error::FisoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    Bearer,
    ApiKey,
    Basic,
}

/// Ephemeral credential material plus the headers to inject into the
/// outbound request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub kind: CredentialKind,
    pub token: String,
    pub injected_headers: HashMap<String, String>,
}

impl Credentials {
    pub fn new(kind: CredentialKind, token: String, header_name: Option<&str>) -> Self {
        let mut injected_headers = HashMap::new();
        let (name, value) = match kind {
            CredentialKind::Bearer => (
                "Authorization".to_string(),
                format!("Bearer {token}"),
            ),
            CredentialKind::ApiKey => (
                header_name.unwrap_or("Authorization").to_string(),
                token.clone(),
            ),
            CredentialKind::Basic => (
                "Authorization".to_string(),
                format!("Basic {token}"),
            ),
        };
        injected_headers.insert(name, value);
        Self {
            kind,
            token,
            injected_headers,
        }
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self, target_name: &str) -> Result<Option<Credentials>, FisoError>;
}

/// Always returns no credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCredentialProvider;

#[async_trait]
impl CredentialProvider for NoopCredentialProvider {
    async fn get_credentials(&self, _target_name: &str) -> Result<Option<Credentials>, FisoError> {
        Ok(None)
    }
}

/// Where a local secret's token comes from.
#[derive(Debug, Clone)]
pub enum SecretSource {
    File(std::path::PathBuf),
    EnvVar(String),
}

#[derive(Debug, Clone)]
pub struct LocalSecretSpec {
    pub kind: CredentialKind,
    pub source: SecretSource,
    pub header_name: Option<String>,
}

/// Reads a token from a file or environment variable per target.
#[derive(Default)]
pub struct LocalSecretsProvider {
    specs: HashMap<String, LocalSecretSpec>,
}

impl LocalSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, target_name: impl Into<String>, spec: LocalSecretSpec) {
        self.specs.insert(target_name.into(), spec);
    }
}

#[async_trait]
impl CredentialProvider for LocalSecretsProvider {
    async fn get_credentials(&self, target_name: &str) -> Result<Option<Credentials>, FisoError> {
        let Some(spec) = self.specs.get(target_name) else {
            return Ok(None);
        };

        let token = match &spec.source {
            SecretSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| FisoError::Fatal(format!("read secret file {path:?}: {e}")))?
                .trim()
                .to_string(),
            SecretSource::EnvVar(name) => {
                let value = std::env::var(name)
                    .map_err(|_| FisoError::Fatal(format!("env var {name} not set")))?;
                if value.is_empty() {
                    return Err(FisoError::Fatal(format!("env var {name} is empty")));
                }
                value
            }
        };

        Ok(Some(Credentials::new(
            spec.kind,
            token,
            spec.header_name.as_deref(),
        )))
    }
}

/// A secret fetched from an external vault-like system, with its
/// declared lease lifetime.
#[derive(Debug, Clone)]
pub struct LeasedSecret {
    pub data: HashMap<String, serde_json::Value>,
    pub lease_ttl: Duration,
}

/// Reads `{data, lease-ttl}` via an injected client.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn fetch(&self, target_name: &str) -> Result<LeasedSecret, FisoError>;
}

struct CachedLease {
    credentials: Credentials,
    acquired_at: Instant,
    ttl: Duration,
}

/// Caches per target, refreshing once 80% of the lease TTL has elapsed.
/// Falls back to a 5 minute default TTL if the client reports zero.
pub struct LeaseCachedProvider {
    client: Arc<dyn LeaseClient>,
    kind: CredentialKind,
    token_field: String,
    header_name: Option<String>,
    clock: SharedClock,
    cache: Mutex<HashMap<String, CachedLease>>,
}

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

impl LeaseCachedProvider {
    pub fn new(
        client: Arc<dyn LeaseClient>,
        kind: CredentialKind,
        token_field: impl Into<String>,
        header_name: Option<String>,
    ) -> Self {
        Self {
            client,
            kind,
            token_field: token_field.into(),
            header_name,
            clock: system_clock(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn fresh(&self, target_name: &str) -> Option<Credentials> {
        let guard = self.cache.lock().unwrap();
        guard.get(target_name).and_then(|lease| {
            let age = self.clock.now().saturating_duration_since(lease.acquired_at);
            if age.as_secs_f64() < 0.8 * lease.ttl.as_secs_f64() {
                Some(lease.credentials.clone())
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl CredentialProvider for LeaseCachedProvider {
    async fn get_credentials(&self, target_name: &str) -> Result<Option<Credentials>, FisoError> {
        if let Some(creds) = self.fresh(target_name) {
            return Ok(Some(creds));
        }

        let leased = self.client.fetch(target_name).await?;
        let token = leased
            .data
            .get(&self.token_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                FisoError::Fatal(format!(
                    "lease for {target_name} missing string field {}",
                    self.token_field
                ))
            })?
            .to_string();

        let ttl = if leased.lease_ttl.is_zero() {
            DEFAULT_LEASE_TTL
        } else {
            leased.lease_ttl
        };

        let credentials = Credentials::new(self.kind, token, self.header_name.as_deref());

        self.cache.lock().unwrap().insert(
            target_name.to_string(),
            CachedLease {
                credentials: credentials.clone(),
                acquired_at: self.clock.now(),
                ttl,
            },
        );

        Ok(Some(credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn noop_returns_none() {
        let provider = NoopCredentialProvider;
        assert!(provider.get_credentials("svc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_secrets_reads_env_var() {
        std::env::set_var("FISO_TEST_TOKEN", "abc123");
        let mut provider = LocalSecretsProvider::new();
        provider.configure(
            "svc",
            LocalSecretSpec {
                kind: CredentialKind::Bearer,
                source: SecretSource::EnvVar("FISO_TEST_TOKEN".to_string()),
                header_name: None,
            },
        );
        let creds = provider.get_credentials("svc").await.unwrap().unwrap();
        assert_eq!(
            creds.injected_headers.get("Authorization").unwrap(),
            "Bearer abc123"
        );
        std::env::remove_var("FISO_TEST_TOKEN");
    }

    #[tokio::test]
    async fn local_secrets_rejects_empty_env_var() {
        std::env::set_var("FISO_TEST_EMPTY", "");
        let mut provider = LocalSecretsProvider::new();
        provider.configure(
            "svc",
            LocalSecretSpec {
                kind: CredentialKind::Bearer,
                source: SecretSource::EnvVar("FISO_TEST_EMPTY".to_string()),
                header_name: None,
            },
        );
        assert!(provider.get_credentials("svc").await.is_err());
        std::env::remove_var("FISO_TEST_EMPTY");
    }

    #[tokio::test]
    async fn api_key_uses_custom_header_name() {
        let mut provider = LocalSecretsProvider::new();
        std::env::set_var("FISO_TEST_APIKEY", "xyz");
        provider.configure(
            "svc",
            LocalSecretSpec {
                kind: CredentialKind::ApiKey,
                source: SecretSource::EnvVar("FISO_TEST_APIKEY".to_string()),
                header_name: Some("X-Api-Key".to_string()),
            },
        );
        let creds = provider.get_credentials("svc").await.unwrap().unwrap();
        assert_eq!(creds.injected_headers.get("X-Api-Key").unwrap(), "xyz");
        std::env::remove_var("FISO_TEST_APIKEY");
    }

    struct FakeLeaseClient {
        ttl: Duration,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LeaseClient for FakeLeaseClient {
        async fn fetch(&self, _target_name: &str) -> Result<LeasedSecret, FisoError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut data = HashMap::new();
            data.insert("token".to_string(), serde_json::json!(format!("t{}", call + 1)));
            Ok(LeasedSecret {
                data,
                lease_ttl: self.ttl,
            })
        }
    }

    #[tokio::test]
    async fn lease_cached_provider_refreshes_after_80_percent_ttl() {
        let clock = ManualClock::new();
        let provider = LeaseCachedProvider::new(
            Arc::new(FakeLeaseClient {
                ttl: Duration::from_secs(10),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            CredentialKind::Bearer,
            "token",
            None,
        )
        .with_clock(Arc::new(clock.clone()));

        let first = provider.get_credentials("svc").await.unwrap().unwrap();
        assert_eq!(first.token, "t1");

        clock.advance(Duration::from_secs(7));
        let still_cached = provider.get_credentials("svc").await.unwrap().unwrap();
        assert_eq!(still_cached.token, "t1");

        clock.advance(Duration::from_secs(2));
        let refreshed = provider.get_credentials("svc").await.unwrap().unwrap();
        assert_eq!(refreshed.token, "t2");
    }

    #[tokio::test]
    async fn missing_token_field_is_an_error() {
        struct EmptyClient;
        #[async_trait]
        impl LeaseClient for EmptyClient {
            async fn fetch(&self, _target_name: &str) -> Result<LeasedSecret, FisoError> {
                Ok(LeasedSecret {
                    data: HashMap::new(),
                    lease_ttl: Duration::from_secs(10),
                })
            }
        }
        let provider = LeaseCachedProvider::new(
            Arc::new(EmptyClient),
            CredentialKind::Bearer,
            "token",
            None,
        );
        assert!(provider.get_credentials("svc").await.is_err());
    }
}
