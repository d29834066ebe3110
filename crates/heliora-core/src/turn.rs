//! The per-turn evaluation pipeline.
//!
//! One inbound contributor message is one turn. The pipeline unions
//! this turn's energy contributors with every address holding unspent
//! vote credit, weighs the union by energy share and credit share,
//! applies the fairness policy, normalizes, optionally caps, and draws
//! a single producer.
//!
//! Everything here is pure: store reads happen before `evaluate` and
//! their results are passed in, so a recorded turn can be replayed
//! bit-for-bit from its inputs.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::config::{FairnessConfig, PcapConfig, SelectionConfig};
use crate::fairness;
use crate::roulette::{sanitize_weight, Wheel};
use crate::{Address, Contributor, OracleError, Result, WinRow, MAX_CANDIDATES};

/// Progress of a turn through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    Parsed,
    UnionBuilt,
    WeightsComputed,
    FairnessApplied,
    Capped,
    Drawn,
    Published,
    Finalized,
    /// Terminal: parse failure or empty candidate set.
    Dropped,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::Parsed => "parsed",
            TurnPhase::UnionBuilt => "union-built",
            TurnPhase::WeightsComputed => "weights-computed",
            TurnPhase::FairnessApplied => "fairness-applied",
            TurnPhase::Capped => "capped",
            TurnPhase::Drawn => "drawn",
            TurnPhase::Published => "published",
            TurnPhase::Finalized => "finalized",
            TurnPhase::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// Stream coordinates identifying one turn.
#[derive(Clone, Copy, Debug)]
pub struct TurnInputs<'a> {
    pub fullnode_id: &'a str,
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
}

impl TurnInputs<'_> {
    /// Seed material shared with every replica. The turn is
    /// reproducible from these coordinates plus the configured
    /// parameters.
    pub fn seed_material(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.fullnode_id, self.topic, self.partition, self.offset
        )
    }
}

/// One candidate's full evaluation row, kept for observability and the
/// dry-run table.
#[derive(Clone, Debug)]
pub struct CandidateRow {
    pub address: Address,
    pub energy: f64,
    pub energy_share: f64,
    pub credit_share: f64,
    pub weight: f64,
    pub probability: f64,
    pub cumulative: f64,
}

/// Result of evaluating one turn.
#[derive(Clone, Debug)]
pub struct TurnEvaluation {
    pub winner: Address,
    pub winner_weight: f64,
    pub candidates: Vec<CandidateRow>,
    pub penalized: usize,
    pub min_multiplier: f64,
    pub pcap_applied: bool,
    /// The uniform variate that picked the winner.
    pub draw: f64,
}

/// Defensive energy parse: unparseable or negative values count as
/// zero rather than disqualifying the contributor.
pub fn parse_energy(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

/// Union this turn's contributors with vote-only addresses.
///
/// Contributors keep their reported energy; credit holders absent from
/// the contributor list join with energy "0". Duplicates and empty
/// addresses are dropped, first occurrence wins.
pub fn union_candidates(
    contributors: &[Contributor],
    vote_only: &BTreeSet<Address>,
) -> Vec<Contributor> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut eligible = Vec::with_capacity(contributors.len() + vote_only.len());

    for contributor in contributors {
        if contributor.address.is_empty() || !seen.insert(contributor.address.as_str()) {
            continue;
        }
        eligible.push(contributor.clone());
    }
    for address in vote_only {
        if address.is_empty() || seen.contains(address.as_str()) {
            continue;
        }
        eligible.push(Contributor {
            address: address.clone(),
            energy_kwh: "0".into(),
        });
    }
    eligible
}

/// Evaluate one turn over an already-unioned candidate set.
///
/// `scores` is the credit snapshot for the candidate addresses (missing
/// entries are zero) and `wins` the fairness window query result.
pub fn evaluate(
    inputs: &TurnInputs<'_>,
    eligible: &[Contributor],
    scores: &HashMap<Address, f64>,
    wins: &[WinRow],
    selection: &SelectionConfig,
    fairness_config: &FairnessConfig,
    pcap: &PcapConfig,
) -> Result<TurnEvaluation> {
    if eligible.is_empty() {
        return Err(OracleError::SelectionFailed(
            "no candidates (contributors and vote-only union empty)".into(),
        ));
    }
    if eligible.len() > MAX_CANDIDATES {
        return Err(OracleError::InvalidInput(format!(
            "candidate set of {} exceeds the {} bound",
            eligible.len(),
            MAX_CANDIDATES
        )));
    }

    let mut energy: HashMap<&str, f64> = HashMap::with_capacity(eligible.len());
    let mut total_energy = 0.0;
    for contributor in eligible {
        let e = parse_energy(&contributor.energy_kwh);
        energy.insert(contributor.address.as_str(), e);
        total_energy += e;
    }
    let total_credit: f64 = eligible
        .iter()
        .filter_map(|c| scores.get(&c.address))
        .sum();

    let beta = selection.beta.clamp(0.0, 1.0);
    let epsilon = if selection.epsilon > 0.0 {
        selection.epsilon
    } else {
        crate::roulette::WEIGHT_FLOOR
    };

    let assessment = fairness::assess(wins, inputs.offset, fairness_config);

    let mut shares: HashMap<Address, (f64, f64, f64)> = HashMap::with_capacity(eligible.len());
    let mut pairs: Vec<(Address, f64)> = Vec::with_capacity(eligible.len());
    for contributor in eligible {
        let e = energy[contributor.address.as_str()];
        let x = if total_energy > 0.0 { e / total_energy } else { 0.0 };
        let r = if total_credit > 0.0 {
            scores.get(&contributor.address).copied().unwrap_or(0.0) / total_credit
        } else {
            0.0
        };
        let mut w = sanitize_weight(beta * x + (1.0 - beta) * r) + epsilon;
        w *= assessment.multiplier_for(&contributor.address);
        shares.insert(contributor.address.clone(), (e, x, r));
        pairs.push((contributor.address.clone(), w));
    }

    let mut wheel = Wheel::build(pairs)?;
    let pcap_applied = if pcap.enabled {
        fairness::apply_probability_cap(&mut wheel, pcap.limit)
    } else {
        false
    };

    let drawn = wheel.draw(&inputs.seed_material());

    let candidates = wheel
        .slots()
        .iter()
        .map(|slot| {
            let (e, x, r) = shares.get(&slot.address).copied().unwrap_or_default();
            CandidateRow {
                address: slot.address.clone(),
                energy: e,
                energy_share: x,
                credit_share: r,
                weight: slot.weight,
                probability: slot.probability,
                cumulative: slot.cumulative,
            }
        })
        .collect();

    Ok(TurnEvaluation {
        winner: drawn.winner,
        winner_weight: drawn.weight,
        candidates,
        penalized: assessment.penalized,
        min_multiplier: assessment.min_multiplier,
        pcap_applied,
        draw: drawn.draw,
    })
}

/// Render the candidate table the way operators expect to read it in a
/// dry run.
pub fn render_table(evaluation: &TurnEvaluation) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<44} | {:>10} {:>10} {:>10} {:>12} {:>12} {:>12}\n",
        "address", "e_i", "x_i", "r_i", "w_i", "P_i", "F_i"
    ));
    for row in &evaluation.candidates {
        out.push_str(&format!(
            "{:<44} | {:>10.4} {:>10.6} {:>10.6} {:>12.8} {:>12.8} {:>12.8}\n",
            row.address,
            row.energy,
            row.energy_share,
            row.credit_share,
            row.weight,
            row.probability,
            row.cumulative
        ));
    }
    out.push_str(&format!(
        "winner={} w={:.8} u={:.8}\n",
        evaluation.winner, evaluation.winner_weight, evaluation.draw
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PenaltyMode, SelectionConfig};

    fn contributor(address: &str, energy: &str) -> Contributor {
        Contributor {
            address: address.to_string(),
            energy_kwh: energy.to_string(),
        }
    }

    fn inputs(offset: i64) -> TurnInputs<'static> {
        TurnInputs {
            fullnode_id: "fn1",
            topic: "contributors",
            partition: 0,
            offset,
        }
    }

    fn selection(beta: f64) -> SelectionConfig {
        SelectionConfig {
            beta,
            epsilon: 1e-12,
        }
    }

    fn no_fairness() -> FairnessConfig {
        FairnessConfig {
            enabled: false,
            ..FairnessConfig::default()
        }
    }

    fn no_pcap() -> PcapConfig {
        PcapConfig {
            enabled: false,
            limit: 0.7,
        }
    }

    #[test]
    fn parse_energy_is_defensive() {
        assert_eq!(parse_energy("10.5"), 10.5);
        assert_eq!(parse_energy(""), 0.0);
        assert_eq!(parse_energy("abc"), 0.0);
        assert_eq!(parse_energy("-3"), 0.0);
        assert_eq!(parse_energy("NaN"), 0.0);
        assert_eq!(parse_energy("inf"), 0.0);
    }

    #[test]
    fn union_adds_vote_only_with_zero_energy() {
        let contributors = vec![contributor("a", "5")];
        let vote_only: BTreeSet<Address> = ["a".to_string(), "c".to_string()].into();
        let eligible = union_candidates(&contributors, &vote_only);
        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].address, "a");
        assert_eq!(eligible[0].energy_kwh, "5");
        assert_eq!(eligible[1].address, "c");
        assert_eq!(eligible[1].energy_kwh, "0");
    }

    #[test]
    fn union_drops_empties_and_duplicates() {
        let contributors = vec![
            contributor("", "5"),
            contributor("a", "5"),
            contributor("a", "9"),
        ];
        let eligible = union_candidates(&contributors, &BTreeSet::new());
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].energy_kwh, "5");
    }

    #[test]
    fn single_contributor_without_credit_takes_everything() {
        // One address, energy 10, no credit anywhere: p = 1 and the
        // weight is beta plus the floor.
        let eligible = vec![contributor("A", "10")];
        let evaluation = evaluate(
            &inputs(0),
            &eligible,
            &HashMap::new(),
            &[],
            &selection(0.7),
            &no_fairness(),
            &no_pcap(),
        )
        .expect("evaluate");

        assert_eq!(evaluation.winner, "A");
        assert!((evaluation.winner_weight - 0.7).abs() < 1e-9);
        assert_eq!(evaluation.candidates.len(), 1);
        assert!((evaluation.candidates[0].probability - 1.0).abs() < 1e-12);
    }

    #[test]
    fn credit_shifts_weight_between_equal_contributors() {
        // Equal energy, B holds all the credit, beta 0.5: weights are
        // 0.25 vs 0.75.
        let eligible = vec![contributor("A", "5"), contributor("B", "5")];
        let scores = HashMap::from([("B".to_string(), 10.0)]);
        let evaluation = evaluate(
            &inputs(0),
            &eligible,
            &scores,
            &[],
            &selection(0.5),
            &no_fairness(),
            &no_pcap(),
        )
        .expect("evaluate");

        let a = &evaluation.candidates[0];
        let b = &evaluation.candidates[1];
        assert_eq!(a.address, "A");
        assert!((a.energy_share - 0.5).abs() < 1e-12);
        assert!((a.credit_share - 0.0).abs() < 1e-12);
        assert!((a.weight - 0.25).abs() < 1e-9);
        assert!((b.weight - 0.75).abs() < 1e-9);
        assert!((a.probability - 0.25).abs() < 1e-9);
        assert!((b.probability - 0.75).abs() < 1e-9);
    }

    #[test]
    fn winner_distribution_tracks_probabilities() {
        let eligible = vec![contributor("A", "5"), contributor("B", "5")];
        let scores = HashMap::from([("B".to_string(), 10.0)]);
        let mut b_wins = 0usize;
        let rounds = 2000;
        for offset in 0..rounds {
            let evaluation = evaluate(
                &inputs(offset),
                &eligible,
                &scores,
                &[],
                &selection(0.5),
                &no_fairness(),
                &no_pcap(),
            )
            .expect("evaluate");
            if evaluation.winner == "B" {
                b_wins += 1;
            }
        }
        let share = b_wins as f64 / rounds as f64;
        assert!((share - 0.75).abs() < 0.05, "observed share {share}");
    }

    #[test]
    fn vote_only_candidate_wins_deterministically() {
        // No contributors at all; a single credit holder joins with
        // energy zero and must win on credit share alone.
        let vote_only: BTreeSet<Address> = ["C".to_string()].into();
        let eligible = union_candidates(&[], &vote_only);
        let scores = HashMap::from([("C".to_string(), 3.0)]);
        let evaluation = evaluate(
            &inputs(0),
            &eligible,
            &scores,
            &[],
            &selection(0.7),
            &no_fairness(),
            &no_pcap(),
        )
        .expect("evaluate");

        assert_eq!(evaluation.winner, "C");
        let row = &evaluation.candidates[0];
        assert_eq!(row.energy_share, 0.0);
        assert!((row.credit_share - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fairness_penalty_shapes_final_probabilities() {
        // Reference turn: A won 3 and 4, turn 5, gamma 0.5 ramp,
        // max_wins 1, soft 3. Symmetric energy and credit put both
        // weights at 0.5; the penalty takes A to 0.125 and p_A to 0.2.
        let eligible = vec![contributor("A", "5"), contributor("B", "5")];
        let scores = HashMap::from([("A".to_string(), 5.0), ("B".to_string(), 5.0)]);
        let wins = vec![
            WinRow {
                creator: "A".into(),
                turn_id: 3,
            },
            WinRow {
                creator: "A".into(),
                turn_id: 4,
            },
        ];
        let fairness_config = FairnessConfig {
            enabled: true,
            window_turns: 5,
            max_wins: 1,
            soft_turns: 3,
            gamma: 0.5,
            mode: PenaltyMode::Ramp,
        };
        let evaluation = evaluate(
            &inputs(5),
            &eligible,
            &scores,
            &wins,
            &selection(0.5),
            &fairness_config,
            &no_pcap(),
        )
        .expect("evaluate");

        assert_eq!(evaluation.penalized, 1);
        assert!((evaluation.min_multiplier - 0.25).abs() < 1e-12);
        let a = &evaluation.candidates[0];
        let b = &evaluation.candidates[1];
        assert!((a.weight - 0.125).abs() < 1e-9);
        assert!((b.weight - 0.5).abs() < 1e-9);
        assert!((a.probability - 0.2).abs() < 1e-9);
        assert!((b.probability - 0.8).abs() < 1e-9);
    }

    #[test]
    fn ramp_penalties_reduce_win_concentration() {
        // Statistical check of the fairness bound: a dominant
        // candidate wins markedly less often over 500 turns once the
        // ramp penalty feeds back through the win history.
        let eligible = vec![contributor("A", "90"), contributor("B", "10")];
        let fairness_on = FairnessConfig {
            enabled: true,
            window_turns: 10,
            max_wins: 2,
            soft_turns: 5,
            gamma: 0.3,
            mode: PenaltyMode::Ramp,
        };

        let mut wins_a_on = 0usize;
        let mut history: Vec<WinRow> = Vec::new();
        for offset in 0..500i64 {
            let window: Vec<WinRow> = history
                .iter()
                .filter(|w| w.turn_id > offset - 10)
                .cloned()
                .collect();
            let evaluation = evaluate(
                &inputs(offset),
                &eligible,
                &HashMap::new(),
                &window,
                &selection(1.0),
                &fairness_on,
                &no_pcap(),
            )
            .expect("evaluate");
            if evaluation.winner == "A" {
                wins_a_on += 1;
            }
            history.push(WinRow {
                creator: evaluation.winner,
                turn_id: offset,
            });
        }

        let mut wins_a_off = 0usize;
        for offset in 0..500i64 {
            let evaluation = evaluate(
                &inputs(offset),
                &eligible,
                &HashMap::new(),
                &[],
                &selection(1.0),
                &no_fairness(),
                &no_pcap(),
            )
            .expect("evaluate");
            if evaluation.winner == "A" {
                wins_a_off += 1;
            }
        }

        assert!(wins_a_off > 400, "unpenalized dominance, got {wins_a_off}");
        assert!(
            wins_a_on + 50 < wins_a_off,
            "penalties should spread wins: on={wins_a_on} off={wins_a_off}"
        );
    }

    #[test]
    fn pcap_flag_reported_in_evaluation() {
        let eligible = vec![
            contributor("A", "90"),
            contributor("B", "5"),
            contributor("C", "5"),
        ];
        let pcap = PcapConfig {
            enabled: true,
            limit: 0.7,
        };
        let evaluation = evaluate(
            &inputs(0),
            &eligible,
            &HashMap::new(),
            &[],
            &selection(1.0),
            &no_fairness(),
            &pcap,
        )
        .expect("evaluate");

        assert!(evaluation.pcap_applied);
        let probs: Vec<f64> = evaluation.candidates.iter().map(|c| c.probability).collect();
        assert!((probs[0] - 0.7).abs() < 1e-9);
        assert!((probs[1] - 0.15).abs() < 1e-9);
        assert!((probs[2] - 0.15).abs() < 1e-9);
    }

    #[test]
    fn empty_candidate_set_is_dropped() {
        let result = evaluate(
            &inputs(0),
            &[],
            &HashMap::new(),
            &[],
            &selection(0.7),
            &no_fairness(),
            &no_pcap(),
        );
        assert!(matches!(result, Err(OracleError::SelectionFailed(_))));
    }

    #[test]
    fn render_table_lists_every_candidate() {
        let eligible = vec![contributor("A", "5"), contributor("B", "5")];
        let evaluation = evaluate(
            &inputs(0),
            &eligible,
            &HashMap::new(),
            &[],
            &selection(0.7),
            &no_fairness(),
            &no_pcap(),
        )
        .expect("evaluate");
        let table = render_table(&evaluation);
        assert!(table.contains("A"));
        assert!(table.contains("B"));
        assert!(table.contains("winner="));
    }
}
