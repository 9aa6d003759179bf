//! Egress proxy handler (§4.10): per-target HTTP/HTTPS/gRPC forwarding with
//! allow-list, breaker, limiter, and retry composition.
//!
//! Route matching and header forwarding follow the same shape as a typical
//! reverse-proxy handler: look up the target, check admission in order,
//! resolve + authenticate, then a single retried upstream call.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use fiso_core::contracts::{Direction, InterceptorRequest};
use fiso_core::credentials::CredentialProvider;
use fiso_core::error::{classify_status, Classified, FisoError};
use fiso_core::resolver::Resolver;
use fiso_core::retry;
use fiso_core::target::Protocol;

use crate::broker;
use crate::AppState;

fn reqwest_headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string())))
        .collect()
}

fn map_to_reqwest_headers(map: &HashMap<String, String>) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in map {
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::try_from(name.as_str()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            headers.insert(n, v);
        }
    }
    headers
}

/// Headers stripped before copying into the upstream request, mirroring the
/// well-known hop-by-hop set a reverse proxy must not forward verbatim.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["host", "connection", "content-length"];

fn matches_allow_pattern(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("**") {
        return path.starts_with(prefix) || path == prefix.trim_end_matches('/');
    }
    glob_match(pattern, path)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                (0..=t.len()).any(|i| inner(&p[1..], &t[i..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

fn allow_list_permits(patterns: &[String], path: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| matches_allow_pattern(p, path))
}

fn scheme_for(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Http => "http",
        Protocol::Https => "https",
        Protocol::Grpc => "https",
        Protocol::Kafka => "https",
    }
}

fn upstream_error_status(err: &FisoError) -> (StatusCode, Option<(&'static str, String)>) {
    match err {
        FisoError::UnknownTarget(_) => (StatusCode::NOT_FOUND, None),
        FisoError::PathDenied => (StatusCode::FORBIDDEN, None),
        FisoError::CircuitOpen => (
            StatusCode::SERVICE_UNAVAILABLE,
            Some(("retry-after", "30".to_string())),
        ),
        FisoError::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(("retry-after", "1".to_string())),
        ),
        FisoError::UpstreamTransient(_) => (StatusCode::BAD_GATEWAY, None),
        FisoError::Fatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        FisoError::UpstreamPermanent { status, .. } => {
            (StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY), None)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    }
}

fn error_response(err: FisoError) -> Response {
    let (status, retry_after) = upstream_error_status(&err);
    let mut response = (status, err.to_string()).into_response();
    if let Some((name, value)) = retry_after {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path((target_name, rest)): Path<(String, String)>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_inner(&state, &target_name, &rest, method, &uri, headers, body).await {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

async fn handle_inner(
    state: &AppState,
    target_name: &str,
    rest: &str,
    method: Method,
    uri: &axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, FisoError> {
    // Step 1: target lookup.
    let target = state
        .targets
        .get(target_name)
        .ok_or_else(|| FisoError::UnknownTarget(target_name.to_string()))?;

    // Step 2: broker targets dispatch entirely to the broker handler.
    if target.protocol == Protocol::Kafka {
        return broker::handle(state, &target, method, headers, body).await;
    }

    let relative_path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{rest}")
    };

    // Step 3: allow-list.
    if !allow_list_permits(&target.allowed_paths, &relative_path) {
        return Err(FisoError::PathDenied);
    }

    let breaker = state
        .breakers
        .get_or_insert(&target.name, target.breaker);

    // Step 4: breaker admission.
    breaker.try_acquire().map_err(|_| FisoError::CircuitOpen)?;

    // Step 5: rate-limiter admission.
    if let Some(rl) = &target.rate_limit {
        state.limiters.set(&target.name, rl.rate, rl.burst);
    }
    if !state.limiters.allow(&target.name) {
        return Err(FisoError::RateLimited);
    }

    // Step 6: resolve host.
    let resolved = state
        .resolver
        .resolve(&target.host)
        .await
        .map_err(|e| FisoError::UpstreamTransient(e.to_string()))?;

    // Step 7: fetch credentials.
    let credentials = state
        .credentials
        .get_credentials(&target.name)
        .await
        .map_err(|e| FisoError::Fatal(e.to_string()))?;

    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let url = format!(
        "{}://{}{}{}",
        scheme_for(target.protocol),
        resolved,
        relative_path,
        query
    );

    let mut forward_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::try_from(name.as_str()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forward_headers.insert(n, v);
        }
    }
    if let Some(creds) = &credentials {
        for (name, value) in &creds.injected_headers {
            if let (Ok(n), Ok(v)) = (
                reqwest::header::HeaderName::try_from(name.as_str()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                forward_headers.insert(n, v);
            }
        }
    }

    // Step 7.5: outbound interceptors, run on the fully-assembled request.
    let outbound_request = InterceptorRequest {
        payload: body.to_vec(),
        headers: reqwest_headers_to_map(&forward_headers),
        direction: Direction::Outbound,
    };
    let outbound_result = state.interceptors.process_outbound(&target.name, outbound_request).await?;
    let body = Bytes::from(outbound_result.payload);
    let forward_headers = map_to_reqwest_headers(&outbound_result.headers);

    // Step 8: single retried upstream call, classified per status.
    let outcome: std::sync::Mutex<Option<reqwest::Response>> = std::sync::Mutex::new(None);
    let result = retry::execute_uncancellable(&target.retry, || {
        let client = state.http_client.clone();
        let method = method.clone();
        let url = url.clone();
        let headers = forward_headers.clone();
        let body = body.clone();
        let outcome = &outcome;
        async move {
            let reqwest_method =
                reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
            let send_result = client
                .request(reqwest_method, &url)
                .headers(headers)
                .body(body.to_vec())
                .send()
                .await;

            match send_result {
                Err(e) => Err(Classified::Transient(FisoError::UpstreamTransient(e.to_string()))),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    match classify_status(status) {
                        Classified::Transient(_) => {
                            Err(Classified::Transient(FisoError::UpstreamTransient(format!(
                                "status {status}"
                            ))))
                        }
                        Classified::Permanent(_) => {
                            *outcome.lock().unwrap() = Some(resp);
                            Ok(())
                        }
                    }
                }
            }
        }
    })
    .await;

    // Step 9: record breaker outcome.
    match &result {
        Ok(()) => breaker.record_success(),
        Err(_) => breaker.record_failure(),
    }

    let upstream = result
        .ok()
        .and_then(|_| outcome.into_inner().unwrap())
        .ok_or_else(|| FisoError::UpstreamTransient(format!("upstream call to {target_name} exhausted retries")))?;

    to_axum_response(state, &target.name, upstream).await
}

async fn to_axum_response(state: &AppState, target_name: &str, upstream: reqwest::Response) -> Result<Response, FisoError> {
    let status = upstream.status().as_u16();
    let response_headers = reqwest_headers_to_map(upstream.headers());
    let body = upstream
        .bytes()
        .await
        .map_err(|e| FisoError::UpstreamTransient(e.to_string()))?;

    // Inbound interceptors, run on the upstream response before it reaches the client.
    let inbound_request = InterceptorRequest {
        payload: body.to_vec(),
        headers: response_headers,
        direction: Direction::Inbound,
    };
    let inbound_result = state.interceptors.process_inbound(target_name, inbound_request).await?;

    let mut response = (
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        inbound_result.payload,
    )
        .into_response();
    *response.headers_mut() = string_map_to_header_map(&inbound_result.headers);
    Ok(response)
}

fn string_map_to_header_map(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        if let (Ok(n), Ok(v)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            headers.insert(n, v);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything() {
        assert!(allow_list_permits(&[], "/anything"));
    }

    #[test]
    fn glob_star_matches_within_segment() {
        assert!(allow_list_permits(&["/orders/*".to_string()], "/orders/123"));
        assert!(!allow_list_permits(&["/orders/*".to_string()], "/widgets/123"));
    }

    #[test]
    fn double_star_suffix_matches_prefix_or_equal() {
        let patterns = vec!["/orders/**".to_string()];
        assert!(allow_list_permits(&patterns, "/orders"));
        assert!(allow_list_permits(&patterns, "/orders/123/items"));
        assert!(!allow_list_permits(&patterns, "/widgets"));
    }

    #[test]
    fn scheme_follows_protocol() {
        assert_eq!(scheme_for(Protocol::Http), "http");
        assert_eq!(scheme_for(Protocol::Https), "https");
    }

    #[test]
    fn header_maps_round_trip_through_interceptor_representation() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-request-id", reqwest::header::HeaderValue::from_static("abc"));
        let map = reqwest_headers_to_map(&headers);
        assert_eq!(map.get("x-request-id").unwrap(), "abc");

        let back = map_to_reqwest_headers(&map);
        assert_eq!(back.get("x-request-id").unwrap(), "abc");
    }
}
