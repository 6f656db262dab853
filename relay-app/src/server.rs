//! HTTP relay server and one-shot commands.

use crate::config::RelayConfig;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::StreamExt;
use relay_llm::{CanonicalEvent, ChatMessage, ChatRequest, LlmClient, Provider};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct RelayState {
    pub config: RelayConfig,
    pub started_at: Instant,
    /// Parent of every run's cancellation token. Cancelled on shutdown so open
    /// streams end and graceful shutdown can complete.
    pub shutdown: CancellationToken,
    clients: HashMap<Provider, LlmClient>,
}

impl RelayState {
    pub fn new(config: RelayConfig, shutdown: CancellationToken) -> Self {
        let clients = Provider::ALL
            .into_iter()
            .map(|p| (p, LlmClient::new(config.client_config(p))))
            .collect();
        Self {
            config,
            started_at: Instant::now(),
            shutdown,
            clients,
        }
    }

    pub fn client(&self, provider: Provider) -> LlmClient {
        match self.clients.get(&provider) {
            Some(client) => client.clone(),
            None => LlmClient::new(self.config.client_config(provider)),
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        model = %cfg.general.model,
        provider = %cfg.default_provider(),
        configured_providers = ?cfg.configured_providers(),
        bind_addr = %addr,
        config_path = %path.display(),
        "config ok"
    );
    Ok(())
}

/// Streams one prompt and prints every canonical event as a JSON line.
pub async fn chat_one_shot(
    config_path: Option<PathBuf>,
    prompt: &str,
    model: Option<String>,
    provider: Option<Provider>,
    system: Option<String>,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let model = model.unwrap_or_else(|| cfg.general.model.clone());
    let provider = provider.unwrap_or_else(|| match cfg.general.provider {
        Some(p) if model == cfg.general.model => p,
        _ => Provider::detect(&model),
    });

    let mut request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);
    request.system = system;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received ctrl-c; cancelling run");
                cancel.cancel();
            }
        })
    };

    let client = LlmClient::new(cfg.client_config(provider));
    let mut events = client.chat_stream(request, cancel);
    let mut failure = None;
    while let Some(event) = events.next().await {
        let line = serde_json::to_string(&event)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        if let CanonicalEvent::RunError { error, .. } = event {
            failure = Some(error);
        }
    }
    ctrl_c.abort();

    match failure {
        Some(error) => Err(anyhow::anyhow!(
            "run failed ({}): {}",
            error.code.as_deref().unwrap_or("unknown_error"),
            error.message
        )),
        None => Ok(()),
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;

    tracing::info!(
        config_path = %cfg_path.display(),
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        runtime_upstream_timeout_seconds = cfg.runtime.upstream_timeout_seconds,
        bind_addr = %addr,
        model = %cfg.general.model,
        provider = %cfg.default_provider(),
        configured_providers = ?cfg.configured_providers(),
        "server configuration loaded"
    );

    let listener = preflight_bind_listener(addr).await?;

    let http_timeout = Duration::from_secs(cfg.runtime.http_timeout_seconds);
    let max_in_flight = cfg.runtime.http_max_in_flight;
    let shutdown = CancellationToken::new();
    let state = Arc::new(RelayState::new(cfg, shutdown.clone()));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "llm-relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
