//! National irradiance baseline.
//!
//! The reward unit `R0` is derived from the latest regional snapshot of
//! solar irradiance observations: samples are z-normalized between the
//! low and high quantiles, summarized per region by the median, and the
//! requested regions' medians average into `q*`. Optionally `q*` is
//! mapped back through the inverse ECDF of the raw samples so the
//! baseline keeps physical units.
//!
//! The current snapshot is published by pointer swap; readers always
//! observe a consistent tuple and a failed refresh never clears the
//! previous value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::BaselineConfig;
use crate::{OracleError, Result};

/// One joined observation: the station's region and its irradiance
/// value, `None` when the station reported a missing measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionSample {
    pub region: String,
    pub value: Option<f64>,
}

/// Immutable result of one baseline derivation.
#[derive(Clone, Debug, PartialEq)]
pub struct BaselineSnapshot {
    pub r0: f64,
    pub q_star: f64,
    pub q10: f64,
    pub q90: f64,
    pub regions_used: usize,
    pub refreshed_at_ms: i64,
}

impl BaselineSnapshot {
    /// The startup placeholder before the first successful refresh.
    pub fn empty() -> Self {
        Self {
            r0: 0.0,
            q_star: 0.0,
            q10: 0.0,
            q90: 0.0,
            regions_used: 0,
            refreshed_at_ms: 0,
        }
    }
}

/// Single-writer, read-mostly holder of the current snapshot.
pub struct SharedBaseline {
    current: RwLock<Arc<BaselineSnapshot>>,
}

impl SharedBaseline {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(BaselineSnapshot::empty())),
        }
    }

    pub fn snapshot(&self) -> Arc<BaselineSnapshot> {
        self.current.read().expect("baseline lock").clone()
    }

    pub fn publish(&self, snapshot: BaselineSnapshot) {
        *self.current.write().expect("baseline lock") = Arc::new(snapshot);
    }
}

impl Default for SharedBaseline {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a fresh snapshot from the latest regional aggregates.
///
/// Fails when no valid samples or no requested regions are present;
/// the caller keeps the previous snapshot in that case.
pub fn derive(
    samples: &[RegionSample],
    config: &BaselineConfig,
    now_ms: i64,
) -> Result<BaselineSnapshot> {
    let mut all: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.value)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .collect();
    if all.is_empty() {
        return Err(OracleError::Baseline("no valid irradiance samples".into()));
    }
    all.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    let mut q10 = quantile_sorted(&all, config.quantile_low);
    let mut q90 = quantile_sorted(&all, config.quantile_high);
    if q90 == q10 {
        let (min, max) = (all[0], all[all.len() - 1]);
        if max == min {
            q10 = min;
            q90 = min + 1e-9;
        } else {
            q10 = min;
            q90 = max;
        }
    }

    let mut per_region: HashMap<&str, Vec<f64>> = HashMap::new();
    for sample in samples {
        let Some(value) = sample.value else { continue };
        if !value.is_finite() || value < 0.0 {
            continue;
        }
        let region = sample.region.trim();
        if region.is_empty() {
            continue;
        }
        per_region.entry(region).or_default().push(z_clamp(value, q10, q90));
    }

    let mut medians: Vec<f64> = per_region
        .into_iter()
        .filter(|(region, _)| config.requested_regions.contains(*region))
        .map(|(_, zs)| median(&zs))
        .collect();
    if medians.is_empty() {
        return Err(OracleError::Baseline(
            "no requested regions present in snapshot".into(),
        ));
    }
    medians.sort_by(|a, b| a.partial_cmp(b).expect("finite medians"));
    let regions_used = medians.len();
    let q_star = medians.iter().sum::<f64>() / regions_used as f64;

    let raw = if config.enable_inverse {
        let p = (config.quantile_low + q_star * (config.quantile_high - config.quantile_low))
            .clamp(0.0, 1.0);
        inverse_ecdf(&all, p)
    } else {
        q_star
    };

    Ok(BaselineSnapshot {
        r0: config.scale * raw,
        q_star,
        q10,
        q90,
        regions_used,
        refreshed_at_ms: now_ms,
    })
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }
    let pos = (n - 1) as f64 * p;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = pos - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

/// Inverse empirical CDF with linear interpolation between order
/// statistics.
pub fn inverse_ecdf(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if q <= 0.0 {
        return sorted[0];
    }
    if q >= 1.0 {
        return sorted[n - 1];
    }
    let pos = q * (n - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let t = pos - lower as f64;
    sorted[lower] + t * (sorted[upper] - sorted[lower])
}

/// Median of an unsorted slice. Zero for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mut copy = values.to_vec();
    copy.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    if n % 2 == 1 {
        copy[n / 2]
    } else {
        0.5 * (copy[n / 2 - 1] + copy[n / 2])
    }
}

/// Clamp-normalize a value between the quantile cutoffs into [0, 1].
pub fn z_clamp(x: f64, q10: f64, q90: f64) -> f64 {
    if q90 == q10 {
        return 0.0;
    }
    ((x - q10) / (q90 - q10)).clamp(0.0, 1.0)
}
