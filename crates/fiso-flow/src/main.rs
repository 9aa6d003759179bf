//! fiso-flow: event pipeline executor (§4.9). Reads one event source,
//! runs each event through transform, interceptor chain, envelope build,
//! and sink delivery, routing failures to the dead-letter queue.

mod config;
mod executor;
mod http;
#[cfg(feature = "kafka")]
mod kafka;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::{RawConfig, SinkConfig, SourceConfig, TransformerConfig};
use executor::{Executor, FlowConfig};
use fiso_core::contracts::{Interceptor, NoopPublisher, Publisher, Sink, Source, Transformer};
use fiso_core::target::InterceptorConfig;
use fiso_envelope::envelope::EnvelopeBuilder;
use fiso_envelope::{DeadLetterRouter, TopicNaming};
use fiso_expr_jsonpath::JsonPathExpression;
use fiso_interceptor::{Chain, NativeSandbox, Sandbox, SandboxedInterceptor, WrappedInterceptor};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "fiso-flow", about = "Event pipeline executor")]
struct Cli {
    #[arg(long, env = "FISO_FLOW_CONFIG", default_value = "fiso-flow.yaml")]
    config: std::path::PathBuf,

    #[arg(long, env = "FISO_FLOW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

struct PassthroughTransformer;

#[async_trait::async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, fiso_core::error::FisoError> {
        Ok(bytes.to_vec())
    }
}

/// Native sandbox modules known to this binary, mirroring fiso-link's
/// registry. An unknown module is logged and skipped rather than failing
/// startup.
fn sandbox_for_module(module: &str) -> Option<Arc<dyn Sandbox>> {
    match module {
        "passthrough" => Some(Arc::new(NativeSandbox::new(|input: serde_json::Value| Ok(input)))),
        _ => None,
    }
}

/// Builds the pipeline's interceptor chain from `interceptors` (§4.9 step 3).
/// The executor only ever runs one chain, on the inbound event, so every
/// configured entry is included regardless of its declared `phase`.
fn build_chain(interceptors: &[InterceptorConfig]) -> Chain {
    let mut steps: Vec<Arc<dyn Interceptor>> = Vec::new();

    for cfg in interceptors {
        let Some(sandbox) = sandbox_for_module(&cfg.module) else {
            tracing::error!(module = %cfg.module, "unknown interceptor module, skipping");
            continue;
        };
        let sandboxed: Arc<dyn Interceptor> = Arc::new(SandboxedInterceptor::new(cfg.module.clone(), sandbox));
        let wrapped: Arc<dyn Interceptor> = Arc::new(WrappedInterceptor::new(
            cfg.module.clone(),
            "inbound",
            cfg.fail_open,
            sandboxed,
        ));
        steps.push(wrapped);
    }

    Chain::new(steps)
}

/// Derives the dead-letter publisher from whichever Kafka config the flow
/// is wired to (source or sink), so a failed event's DLQ entry reaches a
/// real topic instead of being silently dropped (§4.8).
#[cfg(feature = "kafka")]
fn build_dlq_publisher(raw: &RawConfig) -> Arc<dyn Publisher> {
    let bootstrap = match &raw.sink {
        SinkConfig::Kafka { bootstrap_servers, .. } => Some(bootstrap_servers.clone()),
        _ => None,
    }
    .or_else(|| match &raw.source {
        SourceConfig::Kafka { bootstrap_servers, .. } => Some(bootstrap_servers.clone()),
        _ => None,
    });

    match bootstrap {
        Some(servers) => match kafka::KafkaPublisher::new(&servers) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(error = %e, "failed to initialize kafka dlq publisher, falling back to no-op");
                Arc::new(NoopPublisher)
            }
        },
        None => Arc::new(NoopPublisher),
    }
}

#[cfg(not(feature = "kafka"))]
fn build_dlq_publisher(_raw: &RawConfig) -> Arc<dyn Publisher> {
    Arc::new(NoopPublisher)
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
    let raw = config::load(&yaml).unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });

    let (source, propagate_default): (Arc<dyn Source>, bool) = match &raw.source {
        SourceConfig::Http { listen_addr, topic } => {
            (Arc::new(http::HttpSource::new(listen_addr.clone(), topic.clone())), true)
        }
        #[cfg(feature = "kafka")]
        SourceConfig::Kafka {
            bootstrap_servers,
            topic,
            group_id,
        } => {
            let source = kafka::KafkaSource::new(bootstrap_servers, topic.clone(), group_id).unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to start kafka source");
                std::process::exit(1);
            });
            (Arc::new(source), false)
        }
    };

    let sink: Arc<dyn Sink> = match &raw.sink {
        SinkConfig::Http { url } => Arc::new(http::HttpSink::new(reqwest::Client::new(), url.clone())),
        #[cfg(feature = "kafka")]
        SinkConfig::Kafka { bootstrap_servers, topic } => {
            let sink = kafka::KafkaSink::new(bootstrap_servers, topic.clone()).unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to start kafka sink");
                std::process::exit(1);
            });
            Arc::new(sink)
        }
    };

    let transformer: Option<Arc<dyn Transformer>> = match raw.transformer {
        TransformerConfig::None => None,
        TransformerConfig::Passthrough => Some(Arc::new(PassthroughTransformer)),
    };

    let dlq = Arc::new(DeadLetterRouter::new(
        build_dlq_publisher(&raw),
        TopicNaming::Default {
            dlq_prefix: raw.dlq_prefix.clone(),
        },
        raw.dlq_header_prefix.clone(),
    ));

    let flow_config = FlowConfig {
        flow_name: raw.flow_name.clone(),
        default_event_type: raw.default_event_type.clone(),
        propagate_errors: raw.propagate_errors || propagate_default,
        envelope_overrides: raw.envelope_overrides.clone().into(),
    };

    let envelope = EnvelopeBuilder::new(JsonPathExpression, raw.flow_prefix.clone());

    let executor = Arc::new(Executor::new(
        flow_config,
        transformer,
        build_chain(&raw.interceptors),
        sink,
        dlq,
        envelope,
    ));

    tracing::info!(flow = %raw.flow_name, "fiso-flow starting");

    let run_source = Arc::clone(&source);
    let handler = executor.handler();
    let source_task = tokio::spawn(async move { run_source.start(handler).await });

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    if let Err(e) = source.close().await {
        tracing::warn!(error = %e, "error closing source");
    }
    let _ = tokio::time::timeout(Duration::from_secs(10), source_task).await;

    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), executor.close())
        .await
        .unwrap_or(Ok(()))
    {
        tracing::warn!(error = %e, "error during pipeline shutdown");
    }
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
}
