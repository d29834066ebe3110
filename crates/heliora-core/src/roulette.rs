//! Roulette-wheel producer selection.
//!
//! A wheel partitions `[0, 1]` by cumulative probability and a single
//! seeded uniform draw picks one candidate. Everything here is
//! deterministic: identical inputs produce the identical winner on
//! every call.
//!
//! Candidates are sorted by address before the CDF is computed. Any
//! unordered iteration would shift the `f_i` boundaries between runs
//! and break replayability.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::{Address, OracleError, Result, MAX_CANDIDATES};

/// Default weight floor: keeps every candidate selectable without
/// disturbing the distribution.
pub const WEIGHT_FLOOR: f64 = 1e-12;

/// One wheel segment after normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    pub address: Address,
    pub weight: f64,
    pub probability: f64,
    pub cumulative: f64,
}

/// Outcome of a single draw.
#[derive(Clone, Debug, PartialEq)]
pub struct Drawn {
    pub winner: Address,
    pub weight: f64,
    pub probability: f64,
    /// The uniform variate that selected the winner.
    pub draw: f64,
}

/// Normalized wheel over a fixed candidate set.
#[derive(Clone, Debug)]
pub struct Wheel {
    slots: Vec<Slot>,
}

impl Wheel {
    /// Build a wheel from `(address, weight)` pairs.
    ///
    /// Weights are clamped to `[0, +inf)` with NaN/Inf treated as zero.
    /// If the total mass ends up non-positive the wheel falls back to
    /// uniform weights so a legal winner still exists.
    pub fn build(pairs: Vec<(Address, f64)>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(OracleError::SelectionFailed("no candidates provided".into()));
        }
        if pairs.len() > MAX_CANDIDATES {
            return Err(OracleError::InvalidInput(format!(
                "candidate set of {} exceeds the {} bound",
                pairs.len(),
                MAX_CANDIDATES
            )));
        }

        let mut slots: Vec<Slot> = pairs
            .into_iter()
            .map(|(address, w)| Slot {
                address,
                weight: sanitize_weight(w),
                probability: 0.0,
                cumulative: 0.0,
            })
            .collect();

        slots.sort_by(|a, b| a.address.cmp(&b.address));

        let total: f64 = slots.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            for slot in &mut slots {
                slot.weight = 1.0;
            }
        }

        let mut wheel = Self { slots };
        wheel.rebuild_cdf();
        Ok(wheel)
    }

    /// Recompute probabilities and cumulative boundaries from the
    /// current weights. The last boundary is clamped to exactly 1.0 to
    /// absorb floating-point drift.
    pub fn rebuild_cdf(&mut self) {
        let total: f64 = self.slots.iter().map(|s| s.weight).sum();
        let mut acc = 0.0;
        for slot in &mut self.slots {
            slot.probability = if total > 0.0 { slot.weight / total } else { 0.0 };
            acc += slot.probability;
            slot.cumulative = acc;
        }
        if let Some(last) = self.slots.last_mut() {
            last.cumulative = 1.0;
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    /// Deterministic draw: the winner is the first slot whose
    /// cumulative boundary reaches the seeded uniform variate.
    pub fn draw(&self, seed_material: &str) -> Drawn {
        let seed = seed_from_material(seed_material);
        let u: f64 = StdRng::seed_from_u64(seed as u64).gen();

        let last = self.slots.last().expect("wheel is never empty");
        let chosen = self
            .slots
            .iter()
            .find(|slot| slot.cumulative >= u)
            .unwrap_or(last);

        Drawn {
            winner: chosen.address.clone(),
            weight: chosen.weight,
            probability: chosen.probability,
            draw: u,
        }
    }
}

/// Single-call selection: clamp, floor, normalize in address order and
/// draw. This is the whole selection contract in one function; the turn
/// pipeline uses the staged `Wheel` API instead so fairness and the
/// probability cap can run between normalization and the draw.
pub fn select(pairs: Vec<(Address, f64)>, seed_material: &str) -> Result<(Address, f64)> {
    let floored = pairs
        .into_iter()
        .map(|(address, w)| (address, sanitize_weight(w) + WEIGHT_FLOOR))
        .collect();
    let wheel = Wheel::build(floored)?;
    let drawn = wheel.draw(seed_material);
    Ok((drawn.winner, drawn.weight))
}

/// Replace NaN/Inf with zero and clamp negatives to zero.
pub fn sanitize_weight(w: f64) -> f64 {
    if !w.is_finite() || w < 0.0 {
        0.0
    } else {
        w
    }
}

/// Seed recipe shared with every replica: the first 8 bytes of
/// SHA-256 over the seed material, read little-endian as a signed
/// 64-bit integer.
pub fn seed_from_material(material: &str) -> i64 {
    let digest = Sha256::digest(material.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(bytes)
}
