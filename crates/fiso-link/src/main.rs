//! fiso-link: per-target egress proxy (§4.10). Routes
//! `/<prefix>/<target-name>/<relative-path>` to the configured upstream,
//! composing allow-list, breaker, limiter, resolver, credential, and retry
//! admission in order.

mod broker;
mod config;
#[cfg(feature = "kafka")]
mod kafka;
mod proxy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use fiso_core::contracts::{Interceptor, NoopPublisher, Publisher};
use fiso_core::credentials::{
    CredentialProvider, LocalSecretSpec, LocalSecretsProvider, NoopCredentialProvider, SecretSource,
};
use fiso_core::resolver::{CachingResolver, Resolver};
use fiso_core::target::{AuthConfig, InterceptorPhase, Target, TargetStore};
use fiso_core::{BreakerRegistry, RateLimiter};
use fiso_interceptor::{Chain, InterceptorRegistry, NativeSandbox, Sandbox, SandboxedInterceptor, WrappedInterceptor};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "fiso-link", about = "Per-target event-integration egress proxy")]
struct Cli {
    #[arg(long, env = "FISO_LINK_CONFIG", default_value = "fiso-link.yaml")]
    config: std::path::PathBuf,

    #[arg(long, env = "FISO_LINK_PORT")]
    port: Option<u16>,

    #[arg(long, env = "FISO_LINK_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[arg(long, env = "FISO_LINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "FISO_LINK_PREFIX")]
    prefix: Option<String>,
}

pub struct AppState {
    pub targets: TargetStore,
    pub breakers: BreakerRegistry,
    pub limiters: RateLimiter,
    pub resolver: Arc<dyn Resolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub interceptors: InterceptorRegistry,
    pub publisher: Arc<dyn Publisher>,
    pub http_client: reqwest::Client,
    pub prefix: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .json()
        .init();

    let yaml = std::fs::read_to_string(&cli.config).unwrap_or_else(|e| {
        tracing::error!(path = %cli.config.display(), error = %e, "failed to read config file");
        std::process::exit(1);
    });
    let loaded = config::load(&yaml).unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });

    let targets = TargetStore::new();
    targets.replace(loaded.targets.clone());

    let listen_addr = cli
        .port
        .map(|p| format!("0.0.0.0:{p}"))
        .unwrap_or(loaded.listen_addr.clone());
    let metrics_addr = cli
        .metrics_port
        .map(|p| format!("0.0.0.0:{p}"))
        .unwrap_or(loaded.metrics_addr.clone());
    let prefix = cli.prefix.unwrap_or(loaded.prefix.clone());

    let publisher: Arc<dyn Publisher> = build_publisher(&loaded.targets);
    let credentials = build_credentials(&loaded.targets);
    let interceptors = build_interceptors(&loaded.targets);

    let state = Arc::new(AppState {
        targets,
        breakers: BreakerRegistry::new(),
        limiters: RateLimiter::new(),
        resolver: Arc::new(CachingResolver::new()),
        credentials,
        interceptors,
        publisher,
        http_client: reqwest::Client::new(),
        prefix,
    });

    let data_listen_addr: SocketAddr = listen_addr.parse().unwrap_or_else(|e| {
        tracing::error!(addr = %listen_addr, error = %e, "invalid listen address");
        std::process::exit(1);
    });
    let metrics_listen_addr: SocketAddr = metrics_addr.parse().unwrap_or_else(|e| {
        tracing::error!(addr = %metrics_addr, error = %e, "invalid metrics address");
        std::process::exit(1);
    });

    let data_router = Router::new()
        .route(&format!("/{}/:target/*rest", state.prefix), any(proxy::handle))
        .route(&format!("/{}/:target", state.prefix), any(proxy_root))
        .with_state(state.clone());

    let metrics_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .with_state(state.clone());

    let data_listener = tokio::net::TcpListener::bind(data_listen_addr)
        .await
        .expect("bind data port");
    let metrics_listener = tokio::net::TcpListener::bind(metrics_listen_addr)
        .await
        .expect("bind metrics port");

    tracing::info!(addr = %data_listen_addr, "fiso-link data plane listening");
    tracing::info!(addr = %metrics_listen_addr, "fiso-link metrics listening");

    let data_server = axum::serve(data_listener, data_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let metrics_server = axum::serve(metrics_listener, metrics_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    let (data_result, metrics_result) = tokio::join!(data_server, metrics_server);
    if let Err(e) = data_result {
        tracing::error!(error = %e, "data plane server error");
    }
    if let Err(e) = metrics_result {
        tracing::error!(error = %e, "metrics server error");
    }

    // Close every resilience component within a bounded deadline, joining
    // errors rather than stopping at the first one (§5).
    let _ = tokio::time::timeout(Duration::from_secs(10), state.publisher.close()).await;
}

#[cfg(feature = "kafka")]
fn build_publisher(targets: &[Target]) -> Arc<dyn Publisher> {
    let bootstrap = targets
        .iter()
        .find_map(|t| t.broker.as_ref().map(|_| t.host.clone()));
    match bootstrap {
        Some(servers) => match kafka::KafkaPublisher::new(&servers) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(error = %e, "failed to initialize kafka publisher, falling back to no-op");
                Arc::new(NoopPublisher)
            }
        },
        None => Arc::new(NoopPublisher),
    }
}

#[cfg(not(feature = "kafka"))]
fn build_publisher(_targets: &[Target]) -> Arc<dyn Publisher> {
    Arc::new(NoopPublisher)
}

/// Builds a [`CredentialProvider`] from every target's `auth` config (§3,
/// §4.5). Falls back to the no-op provider when no target configures one.
fn build_credentials(targets: &[Target]) -> Arc<dyn CredentialProvider> {
    let mut provider = LocalSecretsProvider::new();
    let mut configured = false;

    for target in targets {
        let Some(auth) = &target.auth else { continue };
        configured = true;
        let spec = match auth {
            AuthConfig::File {
                kind,
                path,
                header_name,
            } => LocalSecretSpec {
                kind: *kind,
                source: SecretSource::File(std::path::PathBuf::from(path)),
                header_name: header_name.clone(),
            },
            AuthConfig::EnvVar {
                kind,
                name,
                header_name,
            } => LocalSecretSpec {
                kind: *kind,
                source: SecretSource::EnvVar(name.clone()),
                header_name: header_name.clone(),
            },
        };
        provider.configure(&target.name, spec);
    }

    if configured {
        Arc::new(provider)
    } else {
        Arc::new(NoopCredentialProvider)
    }
}

/// Native sandbox modules known to this binary. Unlike externally-loaded
/// artifacts, these ship with the binary; a target referencing an unknown
/// module is logged and skipped rather than failing startup, mirroring how
/// an unreachable secret source only breaks the targets that use it.
fn sandbox_for_module(module: &str) -> Option<Arc<dyn Sandbox>> {
    match module {
        "passthrough" => Some(Arc::new(NativeSandbox::new(|input: serde_json::Value| Ok(input)))),
        _ => None,
    }
}

/// Populates the per-target interceptor registry from `Target.interceptors`
/// (§4.6), mirroring how `BreakerRegistry`/`RateLimiter` are seeded from
/// target config.
fn build_interceptors(targets: &[Target]) -> InterceptorRegistry {
    let registry = InterceptorRegistry::new();

    for target in targets {
        let mut outbound: Vec<Arc<dyn Interceptor>> = Vec::new();
        let mut inbound: Vec<Arc<dyn Interceptor>> = Vec::new();

        for cfg in &target.interceptors {
            let Some(sandbox) = sandbox_for_module(&cfg.module) else {
                tracing::error!(target = %target.name, module = %cfg.module, "unknown interceptor module, skipping");
                continue;
            };

            let phase_label = match cfg.phase {
                InterceptorPhase::Outbound => "outbound",
                InterceptorPhase::Inbound => "inbound",
            };
            let sandboxed: Arc<dyn Interceptor> = Arc::new(SandboxedInterceptor::new(cfg.module.clone(), sandbox));
            let wrapped: Arc<dyn Interceptor> = Arc::new(WrappedInterceptor::new(
                cfg.module.clone(),
                phase_label,
                cfg.fail_open,
                sandboxed,
            ));

            match cfg.phase {
                InterceptorPhase::Outbound => outbound.push(wrapped),
                InterceptorPhase::Inbound => inbound.push(wrapped),
            }
        }

        registry.register(&target.name, Chain::new(outbound), Chain::new(inbound));
    }

    registry
}

async fn proxy_root(
    state: State<Arc<AppState>>,
    axum::extract::Path(target): axum::extract::Path<String>,
    method: axum::http::Method,
    uri: axum::extract::OriginalUri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    proxy::handle(
        state,
        axum::extract::Path((target, String::new())),
        method,
        uri,
        headers,
        body,
    )
    .await
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"})))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = !state.targets.is_empty();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({"ready": ready, "targets": state.targets.len()})))
}

async fn metrics_text() -> impl IntoResponse {
    (StatusCode::OK, "")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
