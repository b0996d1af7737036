//! The Outpost control-plane server.
//!
//! Wires the store, warm pool, runner, reconciler, artifact store, and
//! fleet health together, spawns the background loops (pool reaper, event
//! consumer, retention sweep), and serves the HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use outpost_core::artifacts::ArtifactStore;
use outpost_core::config::OutpostConfig;
use outpost_core::health::FleetHealth;
use outpost_core::orchestrator::DispatchOrchestrator;
use outpost_core::platform::EcsTaskPlatform;
use outpost_core::pool::WarmPool;
use outpost_core::reconciler::consumer::{SqsEventSource, run_event_consumer};
use outpost_core::reconciler::Reconciler;
use outpost_core::runner::TaskRunner;
use outpost_core::secrets::SecretsManagerStore;
use outpost_core::status::StatusTracker;
use outpost_core::store::DispatchStore;
use outpost_db::bootstrap::{self, DbOptions};

use outpost_server::api::{self, AppState};
use outpost_server::config;

/// Retention sweeps run daily.
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser)]
#[command(name = "outpost", about = "Fleet control plane for LLM coding-agent dispatches")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database URL (overrides OUTPOST_DATABASE_URL env var).
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = config::resolve(cli.config.as_deref(), cli.database_url.as_deref())?;
    let outpost_config = Arc::new(resolved.outpost);

    // Database: create on first boot, connect, migrate.
    let db_pool = bootstrap::connect(&DbOptions {
        create_if_missing: true,
        ..DbOptions::new(resolved.database_url)
    })
    .await?;

    // AWS clients share one SDK config.
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &outpost_config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let sdk_config = loader.load().await;

    let platform = Arc::new(EcsTaskPlatform::new(
        aws_sdk_ecs::Client::new(&sdk_config),
        &outpost_config,
    ));
    let secrets = Arc::new(SecretsManagerStore::new(aws_sdk_secretsmanager::Client::new(
        &sdk_config,
    )));
    let artifacts = Arc::new(ArtifactStore::new(
        aws_sdk_s3::Client::new(&sdk_config),
        outpost_config.artifacts_bucket.clone(),
        &outpost_config.artifacts,
        &outpost_config.retention,
    ));

    // Core components.
    let store = DispatchStore::new(db_pool.clone(), &outpost_config.retention);
    let warm_pool = Arc::new(WarmPool::new(&outpost_config.warm_pool));
    warm_pool.prewarm().await;

    let runner = TaskRunner::new(platform.clone(), secrets);
    let orchestrator = Arc::new(DispatchOrchestrator::new(
        store.clone(),
        warm_pool.clone(),
        runner,
        platform.clone(),
        outpost_config.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(store.clone(), warm_pool.clone()));
    let health = Arc::new(FleetHealth::new(
        store.clone(),
        warm_pool.clone(),
        outpost_config.health_cache_secs,
    ));
    let tracker = StatusTracker::new(store.clone());

    // Background loops.
    let cancel = CancellationToken::new();
    let reaper_handle = warm_pool.clone().spawn_reaper(
        Duration::from_secs(outpost_config.warm_pool.reap_interval_secs),
        cancel.clone(),
    );

    let consumer_handle = match &outpost_config.events_queue_url {
        Some(queue_url) => {
            let source = Arc::new(SqsEventSource::new(
                aws_sdk_sqs::Client::new(&sdk_config),
                queue_url.clone(),
            ));
            Some(tokio::spawn(run_event_consumer(
                source,
                reconciler,
                cancel.clone(),
            )))
        }
        None => {
            warn!("no events queue configured; dispatches will not reconcile");
            None
        }
    };

    let sweep_handle = tokio::spawn(run_retention_sweeps(
        store.clone(),
        artifacts.clone(),
        cancel.clone(),
    ));

    // HTTP API.
    let state = AppState {
        store,
        orchestrator,
        tracker,
        artifacts,
        health,
    };
    let app = api::build_router(state);
    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .context("invalid bind address")?;
    info!("outpost listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background loops and drain.
    cancel.cancel();
    let _ = reaper_handle.await;
    if let Some(handle) = consumer_handle {
        let _ = handle.await;
    }
    let _ = sweep_handle.await;
    db_pool.close().await;
    info!("outpost shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

/// Daily retention sweeps: dispatch records, idempotency mappings, and
/// stored artifacts.
async fn run_retention_sweeps(
    store: DispatchStore,
    artifacts: Arc<ArtifactStore>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        match store.purge_expired(chrono::Utc::now()).await {
            Ok(purged) => info!(purged, "dispatch retention sweep finished"),
            Err(err) => warn!(error = %err, "dispatch retention sweep failed"),
        }
        match store.purge_expired_idempotency().await {
            Ok(purged) => info!(purged, "idempotency sweep finished"),
            Err(err) => warn!(error = %err, "idempotency sweep failed"),
        }
        if let Err(err) = artifacts.sweep_expired().await {
            warn!(error = %err, "artifact retention sweep failed");
        }
    }
}
