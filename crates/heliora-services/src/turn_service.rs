//! The turn orchestrator.
//!
//! One inbound contributor record is one turn: union the contributors
//! with every credit holder, evaluate the roulette pipeline, announce
//! the winner, then finalize the turn in the ledger. The announcement
//! deliberately precedes finalization; duplicate announcements with the
//! same turn id are harmless downstream and the finalize itself is
//! idempotent, so a crash between the two only costs a reconciliation
//! warning on replay.
//!
//! Per the recovery policy, a failed store read degrades the turn
//! instead of dropping it: with no credit snapshot the candidates
//! compete on energy alone.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use heliora_adapters::bus::{Publisher, Subscription};
use heliora_core::metrics::OracleMetrics;
use heliora_core::turn::{self, TurnInputs, TurnPhase};
use heliora_core::{
    ContributorBatch, CreditStore, FinalizeOutcome, FinalizeRequest, OracleConfig, TurnLedger,
    WinnerAnnouncement,
};

use crate::{blocking_with_timeout, now_ms, FINALIZE_TIMEOUT, READ_TIMEOUT};

/// Consumes the contributor stream and drives each turn to
/// `FINALIZED` or `DROPPED`.
pub struct TurnService<S> {
    config: Arc<OracleConfig>,
    store: Arc<S>,
    metrics: Arc<OracleMetrics>,
    winners: Publisher,
    contributors: Subscription,
    shutdown: watch::Receiver<bool>,
}

impl<S> TurnService<S>
where
    S: CreditStore + TurnLedger + 'static,
{
    pub fn new(
        config: Arc<OracleConfig>,
        store: Arc<S>,
        metrics: Arc<OracleMetrics>,
        contributors: Subscription,
        winners: Publisher,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            winners,
            contributors,
            shutdown,
        }
    }

    /// Consume until shutdown or stream end.
    pub async fn run(mut self) {
        info!(topic = %self.winners.topic(), "turn service started");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("turn service stopping");
                        return;
                    }
                }
                record = self.contributors.recv() => {
                    let Some(record) = record else {
                        info!("contributor stream ended");
                        return;
                    };
                    self.handle_turn(record.offset, &record.topic, record.partition, &record.payload).await;
                }
            }
        }
    }

    async fn handle_turn(&self, offset: i64, topic: &str, partition: i32, payload: &[u8]) {
        self.metrics.turns_total.inc();

        let batch: ContributorBatch = match serde_json::from_slice(payload) {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.parse_failures.inc();
                self.metrics.turns_dropped.inc();
                warn!(
                    turn_id = offset,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "payload parse failed, turn dropped"
                );
                return;
            }
        };

        let vote_addrs = {
            let store = self.store.clone();
            blocking_with_timeout(READ_TIMEOUT, move || store.non_zero_addresses())
                .await
                .unwrap_or_else(|e| {
                    warn!(turn_id = offset, error = %e, "vote address snapshot failed, proceeding without vote-only candidates");
                    BTreeSet::new()
                })
        };

        let eligible = turn::union_candidates(&batch.contributors, &vote_addrs);
        if eligible.is_empty() {
            self.metrics.turns_dropped.inc();
            info!(
                turn_id = offset,
                phase = %TurnPhase::Dropped,
                "no candidates (contributors and vote-only union empty)"
            );
            return;
        }

        let addrs: Vec<String> = eligible.iter().map(|c| c.address.clone()).collect();

        let scores = {
            let store = self.store.clone();
            let addrs = addrs.clone();
            blocking_with_timeout(READ_TIMEOUT, move || store.counts(&addrs))
                .await
                .unwrap_or_else(|e| {
                    warn!(turn_id = offset, error = %e, "credit snapshot failed, scoring on energy alone");
                    Default::default()
                })
        };

        let wins = if self.config.fairness.enabled {
            let store = self.store.clone();
            let addrs = addrs.clone();
            let after = offset - i64::from(self.config.fairness.window_turns);
            blocking_with_timeout(READ_TIMEOUT, move || store.wins_since(&addrs, after))
                .await
                .unwrap_or_else(|e| {
                    warn!(turn_id = offset, error = %e, "win history query failed, skipping penalties");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let inputs = TurnInputs {
            fullnode_id: &batch.fullnode_id,
            topic,
            partition,
            offset,
        };
        let evaluation = match turn::evaluate(
            &inputs,
            &eligible,
            &scores,
            &wins,
            &self.config.selection,
            &self.config.fairness,
            &self.config.pcap,
        ) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                self.metrics.turns_dropped.inc();
                warn!(turn_id = offset, error = %e, phase = %TurnPhase::Dropped, "turn evaluation failed");
                return;
            }
        };

        self.metrics
            .fair_penalized_candidates
            .set(evaluation.penalized as u64);
        self.metrics
            .fair_max_penalty_factor
            .set(evaluation.min_multiplier);
        self.metrics
            .fair_candidates_total
            .set(evaluation.candidates.len() as u64);
        self.metrics
            .fair_pcap_applied
            .set(u64::from(evaluation.pcap_applied));

        debug!(
            turn_id = offset,
            candidates = evaluation.candidates.len(),
            penalized = evaluation.penalized,
            pcap = evaluation.pcap_applied,
            "turn evaluated\n{}",
            turn::render_table(&evaluation)
        );

        let announcement = WinnerAnnouncement {
            creator: evaluation.winner.clone(),
            contribution: evaluation.winner_weight,
            fullnode_id: batch.fullnode_id.clone(),
        };
        if let Err(e) = self.winners.send_json(&announcement) {
            self.metrics.publish_failures.inc();
            error!(turn_id = offset, error = %e, phase = %TurnPhase::Published, "winner publish failed, finalize skipped");
            return;
        }
        info!(
            turn_id = offset,
            creator = %announcement.creator,
            weight = announcement.contribution,
            fullnode_id = %announcement.fullnode_id,
            "winner announced"
        );
        self.metrics.record_winner(&announcement.creator);

        let outcome = {
            let store = self.store.clone();
            let creator = evaluation.winner.clone();
            let fullnode_id = batch.fullnode_id.clone();
            let weight = evaluation.winner_weight;
            let candidates = addrs;
            let mode = self.config.finalize.mode;
            blocking_with_timeout(FINALIZE_TIMEOUT, move || {
                store.finalize_turn(
                    &FinalizeRequest {
                        turn_id: offset,
                        fullnode_id: &fullnode_id,
                        creator: &creator,
                        weight,
                        candidates: &candidates,
                        mode,
                    },
                    now_ms(),
                )
            })
            .await
        };

        match outcome {
            Ok(FinalizeOutcome::Committed { ledger_entries }) => {
                info!(
                    turn_id = offset,
                    ledger_entries,
                    phase = %TurnPhase::Finalized,
                    "turn finalized"
                );
            }
            Ok(FinalizeOutcome::AlreadyFinalized) => {
                self.metrics.finalize_replays.inc();
                debug!(turn_id = offset, "turn already finalized, replay ignored");
            }
            Err(e) => {
                self.metrics.finalize_failures.inc();
                // The winner is already announced; the ledger will
                // catch up on the idempotent replay.
                warn!(turn_id = offset, error = %e, "finalize failed after publish, reconciliation needed");
            }
        }
    }
}
