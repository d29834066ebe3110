//! Win-concentration fairness policy.
//!
//! Candidates that won more than `max_wins` times inside the sliding
//! window are down-weighted multiplicatively for up to `soft_turns`
//! turns after the breaching win. The policy only shapes weights; the
//! draw itself stays in [`crate::roulette`].
//!
//! The probability cap is the second half of the policy: applied after
//! normalization, it pins any over-heavy candidate to `limit` and
//! redistributes the excess proportionally over the rest.

use std::collections::HashMap;

use crate::config::{FairnessConfig, PenaltyMode};
use crate::roulette::Wheel;
use crate::{Address, WinRow};

/// Multipliers derived from recent win history. Addresses without an
/// entry are unpenalized (multiplier 1).
#[derive(Clone, Debug, Default)]
pub struct PenaltyAssessment {
    pub multipliers: HashMap<Address, f64>,
    /// Number of penalized candidates this turn.
    pub penalized: usize,
    /// Strongest penalty applied this turn; 1.0 when none.
    pub min_multiplier: f64,
}

impl PenaltyAssessment {
    pub fn none() -> Self {
        Self {
            multipliers: HashMap::new(),
            penalized: 0,
            min_multiplier: 1.0,
        }
    }

    pub fn multiplier_for(&self, address: &str) -> f64 {
        self.multipliers.get(address).copied().unwrap_or(1.0)
    }
}

/// Assess penalties for the current turn.
///
/// `wins` holds the window query result: rows with
/// `turn_id > current_turn - window_turns` for creators in the
/// candidate set, at most `max_wins + 1` most recent per creator
/// (extra rows are tolerated and re-ranked here).
///
/// A creator breaches once it holds more than `max_wins` wins in the
/// window; the breach is marked by its most recent win, and the
/// penalty runs out `soft_turns` turns after that marker:
/// `R = soft_turns - (current_turn - marker)`. While `R > 0` the
/// multiplier is `gamma` (fixed) or `gamma^R` (ramp).
pub fn assess(wins: &[WinRow], current_turn: i64, config: &FairnessConfig) -> PenaltyAssessment {
    if !config.enabled {
        return PenaltyAssessment::none();
    }

    let window_start = current_turn - i64::from(config.window_turns);
    let cap = config.max_wins as usize;

    let mut per_creator: HashMap<&str, Vec<i64>> = HashMap::new();
    for row in wins {
        if row.turn_id > window_start {
            per_creator.entry(row.creator.as_str()).or_default().push(row.turn_id);
        }
    }

    let mut assessment = PenaltyAssessment::none();
    for (creator, mut turns) in per_creator {
        turns.sort_unstable_by(|a, b| b.cmp(a));
        turns.truncate(cap + 1);
        if turns.len() <= cap {
            continue;
        }

        let marker = turns[0];
        let remaining = i64::from(config.soft_turns) - (current_turn - marker);
        if remaining <= 0 {
            continue;
        }

        let multiplier = match config.mode {
            PenaltyMode::Fixed => config.gamma,
            PenaltyMode::Ramp => config.gamma.powi(remaining as i32),
        };
        assessment.multipliers.insert(creator.to_string(), multiplier);
        assessment.penalized += 1;
        if multiplier < assessment.min_multiplier {
            assessment.min_multiplier = multiplier;
        }
    }
    assessment
}

/// Pin probabilities above `limit` and hand the excess to the rest,
/// proportionally. Repeats until no slot exceeds the limit, since the
/// redistribution itself can push a previously-legal slot over.
///
/// Returns whether any cap was applied. When `limit * n < 1` no
/// assignment can satisfy the cap; the mass is split evenly instead.
pub fn apply_probability_cap(wheel: &mut Wheel, limit: f64) -> bool {
    let n = wheel.slots().len();
    if n == 0 || limit <= 0.0 {
        return false;
    }

    if limit * n as f64 <= 1.0 {
        let over = wheel.slots().iter().any(|s| s.probability > limit + f64::EPSILON);
        if !over {
            return false;
        }
        let even = 1.0 / n as f64;
        for slot in wheel.slots_mut() {
            slot.probability = even;
        }
        restack(wheel);
        return true;
    }

    let mut capped = vec![false; n];
    let mut applied = false;
    loop {
        let mut excess = 0.0;
        let mut free_mass = 0.0;
        for (i, slot) in wheel.slots().iter().enumerate() {
            if capped[i] {
                continue;
            }
            if slot.probability > limit {
                excess += slot.probability - limit;
                capped[i] = true;
            } else {
                free_mass += slot.probability;
            }
        }
        if excess == 0.0 {
            break;
        }
        applied = true;

        let scale = if free_mass > 0.0 {
            (free_mass + excess) / free_mass
        } else {
            0.0
        };
        for (i, slot) in wheel.slots_mut().iter_mut().enumerate() {
            if capped[i] {
                slot.probability = limit;
            } else if scale > 0.0 {
                slot.probability *= scale;
            }
        }
        if free_mass <= 0.0 {
            break;
        }
    }

    if applied {
        restack(wheel);
    }
    applied
}

/// Rebuild cumulative boundaries from the probabilities in place,
/// keeping the exact-1.0 clamp on the last slot.
fn restack(wheel: &mut Wheel) {
    let mut acc = 0.0;
    for slot in wheel.slots_mut() {
        acc += slot.probability;
        slot.cumulative = acc;
    }
    if let Some(last) = wheel.slots_mut().last_mut() {
        last.cumulative = 1.0;
    }
}
