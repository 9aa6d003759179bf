//! Broker egress handler (§4.10.1): publishes an HTTP request body to a
//! Kafka topic on behalf of a `kafka`-protocol target.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use fiso_core::error::{Classified, FisoError};
use fiso_core::retry;
use fiso_core::target::{KeyStrategy, Target};

use crate::AppState;

/// HTTP header names canonicalized back to their conventional casing before
/// being handed to the broker client, since `HeaderMap` lower-cases names.
const WELL_KNOWN_HEADERS: &[&str] = &[
    "X-Request-ID",
    "X-Correlation-ID",
    "Content-Type",
    "X-Forwarded-For",
];

fn canonicalize(name: &str) -> String {
    WELL_KNOWN_HEADERS
        .iter()
        .find(|well_known| well_known.eq_ignore_ascii_case(name))
        .map(|well_known| well_known.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn random_key() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("rnd-{nanos:x}")
}

fn derive_key(
    strategy: &KeyStrategy,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<Vec<u8>>, FisoError> {
    match strategy {
        KeyStrategy::None => Ok(None),
        KeyStrategy::Uuid => Ok(Some(uuid::Uuid::new_v4().to_string().into_bytes())),
        KeyStrategy::Static(v) => Ok(Some(v.clone().into_bytes())),
        KeyStrategy::Random => Ok(Some(random_key().into_bytes())),
        KeyStrategy::Header(name) => headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(|| FisoError::UpstreamPermanent {
                status: 400,
                message: format!("missing required header: {name}"),
            })
            .map(Some),
        KeyStrategy::Payload(field) => {
            let parsed: serde_json::Value = serde_json::from_slice(body).map_err(|_| {
                FisoError::UpstreamPermanent {
                    status: 400,
                    message: "body is not valid JSON".to_string(),
                }
            })?;
            parsed
                .get(field)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .map(|s| Some(s.into_bytes()))
                .ok_or_else(|| FisoError::UpstreamPermanent {
                    status: 400,
                    message: format!("payload missing key field: {field}"),
                })
        }
    }
}

pub async fn handle(
    state: &AppState,
    target: &Target,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, FisoError> {
    if method != Method::POST {
        return Ok((StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response());
    }
    if target.name.is_empty() {
        return Err(FisoError::UnknownTarget(String::new()));
    }

    let breaker = state.breakers.get_or_insert(&target.name, target.breaker);
    breaker.try_acquire().map_err(|_| FisoError::CircuitOpen)?;

    if let Some(rl) = &target.rate_limit {
        state.limiters.set(&target.name, rl.rate, rl.burst);
    }
    if !state.limiters.allow(&target.name) {
        return Err(FisoError::RateLimited);
    }

    let broker_config = target
        .broker
        .as_ref()
        .ok_or_else(|| FisoError::Config(format!("target {} has no broker config", target.name)))?;

    let mut message_headers: HashMap<String, String> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            message_headers.insert(canonicalize(name.as_str()), v.to_string());
        }
    }
    for (k, v) in &broker_config.static_headers {
        message_headers.insert(k.clone(), v.clone());
    }

    let key = match derive_key(&broker_config.key_strategy, &headers, &body) {
        Ok(key) => key,
        Err(err) => {
            breaker.record_failure();
            return Err(err);
        }
    };

    let publisher = state.publisher.clone();
    let topic = broker_config.topic.clone();
    let max_attempts = target.retry.max_attempts.max(1);

    let result = retry::execute_uncancellable(
        &fiso_core::RetryConfig {
            max_attempts,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(100 * max_attempts as u64),
            jitter_fraction: 0.0,
        },
        || {
            let publisher = publisher.clone();
            let topic = topic.clone();
            let key = key.clone();
            let value = body.to_vec();
            let headers = message_headers.clone();
            async move {
                let publish = publisher.publish(&topic, key.as_deref(), &value, &headers);
                match tokio::time::timeout(Duration::from_secs(30), publish).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(Classified::Transient(e)),
                    Err(_) => Err(Classified::Transient(FisoError::UpstreamTransient(
                        "publish timed out".to_string(),
                    ))),
                }
            }
        },
    )
    .await;

    match result {
        Ok(()) => {
            breaker.record_success();
            Ok((
                StatusCode::OK,
                axum::Json(serde_json::json!({"status": "published", "topic": topic})),
            )
                .into_response())
        }
        Err(_) => {
            breaker.record_failure();
            Err(FisoError::UpstreamTransient(format!(
                "publish to {topic} exhausted retries"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_known_header_names() {
        assert_eq!(canonicalize("x-request-id"), "X-Request-ID");
        assert_eq!(canonicalize("X-REQUEST-ID"), "X-Request-ID");
        assert_eq!(canonicalize("x-custom-thing"), "x-custom-thing");
    }

    #[test]
    fn static_key_strategy_returns_literal() {
        let headers = HeaderMap::new();
        let key = derive_key(&KeyStrategy::Static("abc".to_string()), &headers, b"{}").unwrap();
        assert_eq!(key, Some(b"abc".to_vec()));
    }

    #[test]
    fn header_key_strategy_rejects_missing_header() {
        let headers = HeaderMap::new();
        let err = derive_key(&KeyStrategy::Header("X-Key".to_string()), &headers, b"{}").unwrap_err();
        assert!(matches!(err, FisoError::UpstreamPermanent { status: 400, .. }));
    }

    #[test]
    fn payload_key_strategy_extracts_field() {
        let headers = HeaderMap::new();
        let body = br#"{"order_id":"o-1"}"#;
        let key = derive_key(&KeyStrategy::Payload("order_id".to_string()), &headers, body).unwrap();
        assert_eq!(key, Some(b"o-1".to_vec()));
    }

    #[test]
    fn payload_key_strategy_rejects_missing_field() {
        let headers = HeaderMap::new();
        let err = derive_key(&KeyStrategy::Payload("missing".to_string()), &headers, b"{}").unwrap_err();
        assert!(matches!(err, FisoError::UpstreamPermanent { status: 400, .. }));
    }

    #[test]
    fn none_strategy_produces_no_key() {
        let headers = HeaderMap::new();
        let key = derive_key(&KeyStrategy::None, &headers, b"{}").unwrap();
        assert_eq!(key, None);
    }
}
