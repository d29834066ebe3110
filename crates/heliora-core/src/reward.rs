//! Vote-participation rewards.
//!
//! Each signing round pays every unique validator the same baseline
//! amount: the current irradiance baseline `R0` raised by a bonus that
//! scales with network participation. The amount is accrued into the
//! validator's credit counter; winning a turn is what draws the credit
//! back down (see the finalize reset modes).

use std::collections::HashMap;

use tracing::debug;

use crate::config::RewardConfig;
use crate::{Address, CreditStore, Result};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Participation ratio `n / total`, clamped to [0, 1]. Zero when the
/// population is unknown or nobody signed.
pub fn participation_ratio(n: usize, total: u64) -> f64 {
    if total == 0 || n == 0 {
        return 0.0;
    }
    (n as f64 / total as f64).clamp(0.0, 1.0)
}

/// Map the raw ratio onto the bonus curve's effective ratio.
///
/// Below `r_start` there is no bonus; above it the bonus ramps linearly
/// to its maximum at full participation. The degenerate thresholds
/// behave per contract: `r_start <= 0` passes the ratio through and
/// `r_start >= 1` only rewards complete participation.
pub fn effective_ratio(r: f64, r_start: f64) -> f64 {
    if r_start <= 0.0 {
        return r.clamp(0.0, 1.0);
    }
    if r_start >= 1.0 {
        return if r >= 1.0 { 1.0 } else { 0.0 };
    }
    ((r - r_start) / (1.0 - r_start)).clamp(0.0, 1.0)
}

/// Baseline reward for one round: `R0 * (1 + bonus_beta * r_eff)`.
/// Zero when the baseline or the participation collapses to zero.
pub fn base_reward(r0: f64, n: usize, total: u64, config: &RewardConfig) -> f64 {
    if r0 <= 0.0 || n == 0 || total == 0 {
        return 0.0;
    }
    let r = participation_ratio(n, total);
    let bonus = config.bonus_beta * effective_ratio(r, config.r_start);
    r0 * (1.0 + bonus)
}

/// Drops empties and duplicates, first occurrence wins.
pub fn unique_validators(validators: &[Address]) -> Vec<Address> {
    let mut seen = std::collections::BTreeSet::new();
    validators
        .iter()
        .filter(|v| !v.is_empty() && seen.insert(v.as_str()))
        .cloned()
        .collect()
}

/// Computes one round of rewards and accrues them into the store.
pub struct RewardEngine {
    config: RewardConfig,
}

impl RewardEngine {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    /// Reward every unique validator of one signing round.
    ///
    /// Each address runs one independent atomic accrual (insert if
    /// absent, inactivity reset, `count += base`), so a storage error
    /// aborts the request after a partial prefix; replays re-accrue,
    /// which matches the at-least-once contract of the inbound stream.
    pub fn reward_round(
        &self,
        store: &dyn CreditStore,
        validators: &[Address],
        population: u64,
        r0: f64,
        now_ms: i64,
    ) -> Result<HashMap<Address, f64>> {
        let unique = unique_validators(validators);
        let base = base_reward(r0, unique.len(), population, &self.config);
        debug!(
            validators = unique.len(),
            population,
            r0,
            base,
            "computed round reward"
        );

        let inactivity_ms = i64::from(self.config.inactivity_days) * DAY_MS;
        let mut rewards = HashMap::with_capacity(unique.len());
        for address in unique {
            if base != 0.0 {
                store.accrue(&address, base, now_ms, inactivity_ms)?;
            }
            rewards.insert(address, base);
        }
        Ok(rewards)
    }
}
