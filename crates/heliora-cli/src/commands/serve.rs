//! `heliora serve` - run the oracle.
//!
//! Wires the sled store, the in-process bus, the turn and reward
//! services, the baseline scheduler and the HTTP surface, then waits
//! for ctrl-c. The HTTP surface carries the metrics and health routes
//! plus the ingest bridge full nodes push their topic payloads through;
//! the bridge preserves the single-partition FIFO contract because each
//! topic has exactly one in-process queue.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::info;

use heliora_adapters::bus::{MessageBus, Publisher};
use heliora_adapters::kma::KmaClient;
use heliora_adapters::storage::SledStore;
use heliora_core::baseline::SharedBaseline;
use heliora_core::config::parse_utc_offset;
use heliora_core::metrics::OracleMetrics;
use heliora_core::OracleConfig;
use heliora_services::{metrics_service, BaselineService, RewardService, TurnService};

pub fn run(
    config_path: Option<PathBuf>,
    metrics_addr: Option<String>,
    storage_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            OracleConfig::from_json(&raw)?
        }
        None => OracleConfig::default(),
    };
    config.apply_env()?;
    if let Some(addr) = metrics_addr {
        config.metrics.listen_addr = addr;
    }
    if let Some(path) = storage_path {
        config.storage.path = path.display().to_string();
    }
    config.validate()?;
    crate::init_tracing(verbose, &config.logging.filter);
    let config = Arc::new(config);

    let store = Arc::new(
        SledStore::open(&config.storage.path)
            .with_context(|| format!("opening store at {}", config.storage.path))?,
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config, store))
}

async fn serve(config: Arc<OracleConfig>, store: Arc<SledStore>) -> Result<()> {
    let bus = MessageBus::new();
    let metrics = Arc::new(OracleMetrics::new());
    let baseline = Arc::new(SharedBaseline::new());
    let population = Arc::new(AtomicU64::new(config.reward.population));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    let turn_service = TurnService::new(
        config.clone(),
        store.clone(),
        metrics.clone(),
        bus.subscribe(&config.topics.contributors)?,
        bus.publisher(&config.topics.block_creator),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(turn_service.run()));

    let reward_service = RewardService::new(
        config.clone(),
        store.clone(),
        baseline.clone(),
        population,
        metrics.clone(),
        bus.subscribe(&config.topics.reward_request)?,
        bus.publisher(&config.topics.reward_result),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(reward_service.run()));

    if config.baseline.scheduler_enabled {
        let utc_offset_secs = parse_utc_offset(&config.baseline.utc_offset)?;
        let client = Arc::new(KmaClient::new(config.kma.clone(), utc_offset_secs)?);
        let baseline_service = BaselineService::new(
            config.baseline.clone(),
            client,
            baseline.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        )?;
        tasks.push(tokio::spawn(baseline_service.run()));
    }

    let app = ingest_router(IngestState {
        contributors: bus.publisher(&config.topics.contributors),
        reward_requests: bus.publisher(&config.topics.reward_request),
    })
    .merge(metrics_service::router(metrics.clone()));
    metrics_service::serve_http(&config.metrics.listen_addr, app, shutdown_rx.clone()).await?;

    info!("oracle running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutting down");
    shutdown_tx.send(true).ok();
    for task in tasks {
        task.await.ok();
    }
    store.flush()?;
    Ok(())
}

#[derive(Clone)]
struct IngestState {
    contributors: Publisher,
    reward_requests: Publisher,
}

fn ingest_router(state: IngestState) -> Router {
    Router::new()
        .route("/ingest/contributors", post(ingest_contributors))
        .route("/ingest/reward-request", post(ingest_reward_request))
        .with_state(state)
}

async fn ingest_contributors(
    State(state): State<IngestState>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    publish(&state.contributors, body)
}

async fn ingest_reward_request(
    State(state): State<IngestState>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    publish(&state.reward_requests, body)
}

fn publish(
    publisher: &Publisher,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    match publisher.send(body.to_vec()) {
        Ok(offset) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"topic": publisher.topic(), "offset": offset})),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
