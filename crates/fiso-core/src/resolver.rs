//! Resolver abstraction (§4.4): a TTL-cached DNS resolver plus a sibling
//! "static" resolver for hosts that are already addresses or opaque
//! broker identifiers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::clock::{system_clock, SharedClock};
use crate::error::FisoError;

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<String, FisoError>;
}

/// Returns the host unchanged. Used when the host is already an IP or an
/// opaque broker identifier that needs no resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResolver;

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<String, FisoError> {
        Ok(host.to_string())
    }
}

struct CacheEntry {
    address: String,
    expires_at: Instant,
}

/// Looks up `host` via the OS resolver, caching the first returned address
/// for `ttl` (default 30s).
pub struct CachingResolver {
    ttl: Duration,
    clock: SharedClock,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CachingResolver {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(30))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            clock: system_clock(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, host: &str) -> Option<String> {
        let guard = self.cache.lock().unwrap();
        guard.get(host).and_then(|entry| {
            if entry.expires_at > self.clock.now() {
                Some(entry.address.clone())
            } else {
                None
            }
        })
    }

    fn store(&self, host: &str, address: String) {
        let mut guard = self.cache.lock().unwrap();
        guard.insert(
            host.to_string(),
            CacheEntry {
                address,
                expires_at: self.clock.now() + self.ttl,
            },
        );
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn resolve(&self, host: &str) -> Result<String, FisoError> {
        if let Some(address) = self.cached(host) {
            return Ok(address);
        }

        let lookup_target = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:0")
        };

        let mut addrs = tokio::net::lookup_host(&lookup_target)
            .await
            .map_err(|e| FisoError::UpstreamTransient(format!("resolve {host}: {e}")))?;

        let first = addrs
            .next()
            .ok_or_else(|| FisoError::Fatal(format!("resolve {host}: no addresses returned")))?;

        let address = first.ip().to_string();
        self.store(host, address.clone());
        Ok(address)
    }
}

pub type SharedResolver = Arc<dyn Resolver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_returns_host_unchanged() {
        let resolver = StaticResolver;
        assert_eq!(resolver.resolve("broker-1").await.unwrap(), "broker-1");
    }

    #[tokio::test]
    async fn caching_resolver_caches_localhost() {
        let resolver = CachingResolver::new();
        let a = resolver.resolve("localhost").await.unwrap();
        let b = resolver.resolve("localhost").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        use crate::clock::ManualClock;
        let clock = ManualClock::new();
        let resolver = CachingResolver::with_clock(Duration::from_secs(30), Arc::new(clock.clone()));
        resolver.resolve("localhost").await.unwrap();
        assert!(resolver.cached("localhost").is_some());
        clock.advance(Duration::from_secs(31));
        assert!(resolver.cached("localhost").is_none());
    }
}
