//! The reward stream.
//!
//! Each inbound request names the validators that signed one round.
//! Every unique validator accrues the same baseline amount, derived
//! from the current irradiance snapshot and overall participation. The
//! per-address map is announced on the result topic when configured;
//! otherwise credit accumulates silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use heliora_adapters::bus::{Publisher, Subscription};
use heliora_core::baseline::SharedBaseline;
use heliora_core::metrics::OracleMetrics;
use heliora_core::reward::RewardEngine;
use heliora_core::{CreditStore, OracleConfig, RewardBatch, RewardRequest};

use crate::{blocking_with_timeout, now_ms, REWARD_TIMEOUT};

/// Consumes reward requests and accrues participation credit.
pub struct RewardService<S> {
    config: Arc<OracleConfig>,
    store: Arc<S>,
    engine: Arc<RewardEngine>,
    baseline: Arc<SharedBaseline>,
    /// Registered light-node population, maintained externally and
    /// seeded from config.
    population: Arc<AtomicU64>,
    metrics: Arc<OracleMetrics>,
    requests: Subscription,
    results: Publisher,
    shutdown: watch::Receiver<bool>,
}

impl<S> RewardService<S>
where
    S: CreditStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OracleConfig>,
        store: Arc<S>,
        baseline: Arc<SharedBaseline>,
        population: Arc<AtomicU64>,
        metrics: Arc<OracleMetrics>,
        requests: Subscription,
        results: Publisher,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let engine = Arc::new(RewardEngine::new(config.reward.clone()));
        Self {
            config,
            store,
            engine,
            baseline,
            population,
            metrics,
            requests,
            results,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("reward service started");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("reward service stopping");
                        return;
                    }
                }
                record = self.requests.recv() => {
                    let Some(record) = record else {
                        info!("reward stream ended");
                        return;
                    };
                    self.handle_request(record.offset, &record.payload).await;
                }
            }
        }
    }

    async fn handle_request(&self, offset: i64, payload: &[u8]) {
        self.metrics.reward_requests_total.inc();

        let request: RewardRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.reward_failures.inc();
                warn!(
                    offset,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "reward request parse failed, dropped"
                );
                return;
            }
        };

        let r0 = self.baseline.snapshot().r0;
        let population = self.population.load(Ordering::Relaxed);

        let rewards = {
            let store = self.store.clone();
            let engine = self.engine.clone();
            let validators = request.validators.clone();
            blocking_with_timeout(REWARD_TIMEOUT, move || {
                engine.reward_round(store.as_ref(), &validators, population, r0, now_ms())
            })
            .await
        };

        let rewards = match rewards {
            Ok(rewards) => rewards,
            Err(e) => {
                self.metrics.reward_failures.inc();
                warn!(offset, fullnode_id = %request.fullnode_id, error = %e, "reward round failed");
                return;
            }
        };

        info!(
            offset,
            fullnode_id = %request.fullnode_id,
            validators = rewards.len(),
            r0,
            population,
            "reward round accrued"
        );

        if self.config.reward.announce {
            let batch = RewardBatch {
                sender_id: request.fullnode_id.clone(),
                rewards,
            };
            if let Err(e) = self.results.send_json(&batch) {
                self.metrics.reward_failures.inc();
                warn!(offset, error = %e, "reward result publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heliora_adapters::bus::MessageBus;
    use heliora_adapters::storage::InMemoryStore;
    use heliora_core::baseline::BaselineSnapshot;

    fn snapshot(r0: f64) -> BaselineSnapshot {
        BaselineSnapshot {
            r0,
            q_star: 0.5,
            q10: 0.0,
            q90: 1.0,
            regions_used: 1,
            refreshed_at_ms: 0,
        }
    }

    async fn run_one_request(
        config: OracleConfig,
        store: Arc<InMemoryStore>,
        r0: f64,
        population: u64,
        request: &RewardRequest,
    ) -> Option<RewardBatch> {
        let bus = MessageBus::new();
        let requests = bus.publisher("request-vote-member");
        let mut results = bus.subscribe("result-vote-member").expect("result sub");
        let subscription = bus.subscribe("request-vote-member").expect("request sub");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let baseline = Arc::new(SharedBaseline::new());
        baseline.publish(snapshot(r0));
        let announce = config.reward.announce;

        let service = RewardService::new(
            Arc::new(config),
            store,
            baseline,
            Arc::new(AtomicU64::new(population)),
            Arc::new(OracleMetrics::new()),
            subscription,
            bus.publisher("result-vote-member"),
            shutdown_rx,
        );
        let handle = tokio::spawn(service.run());

        requests.send_json(request).expect("send");
        let batch = if announce {
            let record =
                tokio::time::timeout(std::time::Duration::from_secs(5), results.recv())
                    .await
                    .expect("result within deadline")?;
            serde_json::from_slice(&record.payload).ok()
        } else {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert!(results.try_recv().is_none(), "silent mode must not announce");
            None
        };

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
        batch
    }

    #[tokio::test]
    async fn below_threshold_round_pays_plain_baseline() {
        // n=4 of 100 with r_start 0.5: no bonus, every validator gets
        // exactly R0.
        let mut config = OracleConfig::default();
        config.reward.bonus_beta = 0.5;
        config.reward.r_start = 0.5;

        let store = Arc::new(InMemoryStore::new());
        let request = RewardRequest {
            fullnode_id: "fn1".into(),
            validators: (0..4).map(|i| format!("v{i}")).collect(),
            timestamp: String::new(),
        };

        let batch = run_one_request(config, store.clone(), 2.0, 100, &request)
            .await
            .expect("batch");

        assert_eq!(batch.sender_id, "fn1");
        assert_eq!(batch.rewards.len(), 4);
        for reward in batch.rewards.values() {
            assert_eq!(*reward, 2.0);
        }
        assert_eq!(store.credit("v0").expect("credit").expect("row").count, 2.0);
    }

    #[tokio::test]
    async fn silent_mode_accrues_without_announcing() {
        let mut config = OracleConfig::default();
        config.reward.announce = false;

        let store = Arc::new(InMemoryStore::new());
        let request = RewardRequest {
            fullnode_id: "fn1".into(),
            validators: vec!["v0".into()],
            timestamp: String::new(),
        };

        let batch = run_one_request(config, store.clone(), 2.0, 100, &request).await;
        assert!(batch.is_none());
        assert!(store.credit("v0").expect("credit").expect("row").count > 0.0);
    }

    #[tokio::test]
    async fn duplicate_validators_accrue_once() {
        let store = Arc::new(InMemoryStore::new());
        let request = RewardRequest {
            fullnode_id: "fn1".into(),
            validators: vec!["v0".into(), "v0".into()],
            timestamp: String::new(),
        };

        let batch = run_one_request(OracleConfig::default(), store.clone(), 2.0, 100, &request)
            .await
            .expect("batch");
        assert_eq!(batch.rewards.len(), 1);
        assert_eq!(store.credit("v0").expect("credit").expect("row").count, 2.0);
    }
}
