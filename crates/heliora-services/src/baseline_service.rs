//! Baseline refresh scheduler.
//!
//! Refreshes the irradiance baseline once at startup and then at every
//! wall-clock `HH:<offset>` in the configured timezone; upstream data
//! lands shortly after the top of the hour. A failed refresh keeps the
//! previous snapshot: `R0` degrades to stale, never to undefined.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, FixedOffset, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use heliora_adapters::kma::SampleSource;
use heliora_core::baseline::{self, SharedBaseline};
use heliora_core::config::{parse_utc_offset, BaselineConfig};
use heliora_core::metrics::OracleMetrics;
use heliora_core::Result;

use crate::{blocking_with_timeout, now_ms, BASELINE_TIMEOUT};

/// Periodically refreshes the shared baseline snapshot.
pub struct BaselineService<F> {
    config: BaselineConfig,
    source: Arc<F>,
    shared: Arc<SharedBaseline>,
    metrics: Arc<OracleMetrics>,
    utc_offset_secs: i32,
    shutdown: watch::Receiver<bool>,
}

impl<F> BaselineService<F>
where
    F: SampleSource + 'static,
{
    pub fn new(
        config: BaselineConfig,
        source: Arc<F>,
        shared: Arc<SharedBaseline>,
        metrics: Arc<OracleMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let utc_offset_secs = parse_utc_offset(&config.utc_offset)?;
        Ok(Self {
            config,
            source,
            shared,
            metrics,
            utc_offset_secs,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        if !self.config.scheduler_enabled {
            info!("baseline scheduler disabled");
            return;
        }
        info!(
            offset_minutes = self.config.offset_minutes,
            utc_offset = %self.config.utc_offset,
            "baseline scheduler started"
        );

        self.refresh_once().await;

        loop {
            let wait = until_next_refresh(self.local_now(), self.config.offset_minutes);
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("baseline scheduler stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.refresh_once().await;
                }
            }
        }
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(self.utc_offset_secs).expect("validated offset");
        Utc::now().with_timezone(&offset)
    }

    /// One refresh attempt: fetch, derive, publish. Failures keep the
    /// previous snapshot.
    pub async fn refresh_once(&self) {
        self.metrics.baseline_refresh_total.inc();

        let samples = {
            let source = self.source.clone();
            blocking_with_timeout(BASELINE_TIMEOUT, move || source.fetch_samples()).await
        };

        let snapshot = samples.and_then(|samples| baseline::derive(&samples, &self.config, now_ms()));
        match snapshot {
            Ok(snapshot) => {
                info!(
                    r0 = snapshot.r0,
                    q_star = snapshot.q_star,
                    regions_used = snapshot.regions_used,
                    "baseline refreshed"
                );
                self.metrics.baseline_r0.set(snapshot.r0);
                self.shared.publish(snapshot);
            }
            Err(e) => {
                self.metrics.baseline_refresh_failures.inc();
                warn!(error = %e, "baseline refresh failed, keeping previous value");
            }
        }
    }
}

/// Time until the next `HH:<offset>` refresh slot. If this hour's slot
/// is still ahead it is used; otherwise the next hour's.
pub fn until_next_refresh(now: DateTime<FixedOffset>, offset_minutes: u32) -> Duration {
    let hour = now
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or(now);
    let mut slot = hour + chrono::Duration::minutes(i64::from(offset_minutes));
    if slot <= now {
        slot += chrono::Duration::hours(1);
    }
    (slot - now).to_std().unwrap_or(Duration::from_secs(1))
}
