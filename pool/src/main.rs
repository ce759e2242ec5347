// Ethash pool stratum front end
//
// Core: Stratum listener, block templates, share validation, Redis ledger

use anyhow::{Context, Result};
use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ethash_pool::blockchain::{BlockTemplateManager, DaemonClient, TemplateSource};
use ethash_pool::config::{Config, POW_KECCAK_SEAL};
use ethash_pool::metrics::prometheus as metrics;
use ethash_pool::policy::LocalPolicy;
use ethash_pool::shares::{
    EthashVerifier, KeccakSealVerifier, PowVerifier, RedisBackend, ShareValidator,
};
use ethash_pool::shares::pow::target_hex;
use ethash_pool::stratum::{SessionRegistry, StratumServer};

const POLICY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct ApiState {
    backend: Arc<RedisBackend>,
    registry: Arc<SessionRegistry>,
    templates: Arc<BlockTemplateManager>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = state.backend.ping().await.is_ok();
    let height = state.templates.current().await.map(|t| t.height);
    Json(json!({
        "status": "ok",
        "redis": redis_ok,
        "height": height,
        "sessions": state.registry.len().await,
    }))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM - shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT - shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("SIGINT - shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C - shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Config::load()?;
    tracing::info!("Starting pool '{}' ({})", cfg.name, cfg.coin);

    let daemon = Arc::new(DaemonClient::new(cfg.daemon_url.clone(), cfg.daemon_timeout()));
    let registry = Arc::new(SessionRegistry::new(cfg.push_timeout()));
    let share_target = target_hex(cfg.difficulty);

    let ethash = (cfg.pow != POW_KECCAK_SEAL).then(|| Arc::new(EthashVerifier::new()));
    let verifier: Arc<dyn PowVerifier> = match &ethash {
        Some(v) => v.clone(),
        None => {
            tracing::warn!("Using the keccak seal verifier, only valid on development networks");
            Arc::new(KeccakSealVerifier)
        }
    };

    let mut manager = BlockTemplateManager::new(daemon.clone(), cfg.block_refresh_interval());
    {
        let registry = registry.clone();
        manager.on_template_change(move |template| {
            if let Some(ethash) = ethash.clone() {
                let height = template.height;
                tokio::task::spawn_blocking(move || ethash.prepare(height));
            }
            let registry = registry.clone();
            let share_target = share_target.clone();
            tokio::spawn(async move {
                let report = registry.broadcast(&template, &share_target).await;
                tracing::info!(
                    "Broadcast height {}: sent={} skipped={} failed={}",
                    template.height,
                    report.sent,
                    report.skipped,
                    report.failed
                );
            });
        });
    }
    let templates = Arc::new(manager);
    if let Err(e) = templates.update().await {
        tracing::warn!("Initial block template fetch failed: {:#}", e);
    }
    templates.start();

    let backend = Arc::new(
        RedisBackend::new(&cfg.redis_url, &cfg.coin).context("creating Redis backend")?,
    );
    if let Err(e) = backend.ping().await {
        tracing::warn!("Redis not reachable yet: {:#}", e);
    }

    let policy = Arc::new(LocalPolicy::new(&cfg.policy).context("building policy")?);
    {
        let policy = policy.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLICY_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                policy.cleanup();
                let (banned, tracked) = policy.stats();
                tracing::debug!("Policy: {} banned, {} tracked IPs", banned, tracked);
            }
        });
    }

    let validator = Arc::new(ShareValidator::new(
        templates.clone(),
        verifier,
        daemon,
        backend.clone(),
        cfg.difficulty,
        cfg.hashrate_expiration(),
    ));

    let server = Arc::new(StratumServer::new(
        &cfg,
        registry.clone(),
        policy,
        templates.clone(),
        validator,
    ));
    let listener = server.bind()?;
    let stratum = tokio::spawn(server.run(listener));

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(ApiState { backend, registry, templates });
    let api_listener = tokio::net::TcpListener::bind(&cfg.metrics_listen)
        .await
        .with_context(|| format!("binding metrics listener {}", cfg.metrics_listen))?;
    tracing::info!("Metrics listening on {}", cfg.metrics_listen);

    let api_server = axum::serve(api_listener, api)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        res = api_server => {
            res.context("metrics server")?;
        }
        res = stratum => {
            res.context("stratum task panicked")??;
        }
    }

    tracing::info!("Pool shut down cleanly");
    Ok(())
}
