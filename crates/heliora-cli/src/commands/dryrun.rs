//! `heliora dryrun` - evaluate one roulette turn offline.
//!
//! Reads a contributor list (and optionally a credit map), runs the
//! full selection pipeline with fairness and the probability cap
//! disabled, and prints the candidate table plus the winner. No store,
//! no bus, no side effects.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};

use heliora_core::config::{FairnessConfig, PcapConfig, SelectionConfig};
use heliora_core::turn::{self, TurnInputs};
use heliora_core::Contributor;

pub fn run(
    contributors_path: PathBuf,
    credits_path: Option<PathBuf>,
    beta: f64,
    seed: String,
) -> Result<()> {
    let raw = std::fs::read_to_string(&contributors_path)
        .with_context(|| format!("reading {}", contributors_path.display()))?;
    let contributors: Vec<Contributor> =
        serde_json::from_str(&raw).context("parsing contributors file")?;

    let credits: HashMap<String, f64> = match credits_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).context("parsing credits file")?
        }
        None => HashMap::new(),
    };

    // Credit holders enter the union as vote-only candidates, exactly
    // like a live turn.
    let vote_only: BTreeSet<String> = credits
        .iter()
        .filter(|(_, count)| **count > 0.0)
        .map(|(address, _)| address.clone())
        .collect();
    let eligible = turn::union_candidates(&contributors, &vote_only);

    // The seed parameter stands in for the stream coordinates.
    let inputs = TurnInputs {
        fullnode_id: &seed,
        topic: "",
        partition: 0,
        offset: 0,
    };
    let selection = SelectionConfig {
        beta,
        ..SelectionConfig::default()
    };
    let evaluation = turn::evaluate(
        &inputs,
        &eligible,
        &credits,
        &[],
        &selection,
        &FairnessConfig {
            enabled: false,
            ..FairnessConfig::default()
        },
        &PcapConfig {
            enabled: false,
            ..PcapConfig::default()
        },
    )?;

    println!("===== Candidate Table =====");
    println!("beta={beta:.3}  candidates={}  seed={seed}", eligible.len());
    print!("{}", turn::render_table(&evaluation));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dryrun_evaluates_a_contributor_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let contributors = dir.path().join("contributors.json");
        std::fs::write(
            &contributors,
            r#"[{"address":"A","energy_kwh":"10"},{"address":"B","energy_kwh":"5"}]"#,
        )
        .expect("write");

        run(contributors, None, 0.7, "seed".into()).expect("dryrun");
    }

    #[test]
    fn dryrun_includes_vote_only_credits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let contributors = dir.path().join("contributors.json");
        std::fs::write(&contributors, "[]").expect("write");
        let credits = dir.path().join("credits.json");
        std::fs::write(&credits, r#"{"C": 3.0}"#).expect("write");

        run(contributors, Some(credits), 0.7, "seed".into()).expect("dryrun");
    }

    #[test]
    fn dryrun_fails_on_missing_file() {
        assert!(run(PathBuf::from("/nonexistent.json"), None, 0.7, "s".into()).is_err());
    }
}
