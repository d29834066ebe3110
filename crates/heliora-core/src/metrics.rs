//! Oracle metrics.
//!
//! Counters and gauges are plain atomics so the hot path never locks;
//! the labeled winner counter sits behind an `RwLock` map and is only
//! touched once per turn. `render` serializes the whole registry in
//! Prometheus text exposition format for the metrics endpoint.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A monotonically increasing counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge over unsigned integers.
#[derive(Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge over floats, stored as IEEE-754 bits in an atomic word.
pub struct FloatGauge {
    bits: AtomicU64,
}

impl FloatGauge {
    pub fn new(initial: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.to_bits()),
        }
    }

    pub fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for FloatGauge {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Central metrics registry for the oracle.
pub struct OracleMetrics {
    // Turn stream
    pub turns_total: Counter,
    pub turns_dropped: Counter,
    pub parse_failures: Counter,
    pub publish_failures: Counter,
    pub finalize_failures: Counter,
    pub finalize_replays: Counter,

    // Per-turn fairness figures
    pub fair_penalized_candidates: Gauge,
    pub fair_max_penalty_factor: FloatGauge,
    pub fair_candidates_total: Gauge,
    pub fair_pcap_applied: Gauge,

    // Reward stream
    pub reward_requests_total: Counter,
    pub reward_failures: Counter,

    // Baseline refresh
    pub baseline_refresh_total: Counter,
    pub baseline_refresh_failures: Counter,
    pub baseline_r0: FloatGauge,

    // Wins keyed by creator
    winners: RwLock<HashMap<String, Counter>>,
}

impl OracleMetrics {
    pub fn new() -> Self {
        Self {
            turns_total: Counter::new(),
            turns_dropped: Counter::new(),
            parse_failures: Counter::new(),
            publish_failures: Counter::new(),
            finalize_failures: Counter::new(),
            finalize_replays: Counter::new(),

            fair_penalized_candidates: Gauge::new(),
            fair_max_penalty_factor: FloatGauge::new(1.0),
            fair_candidates_total: Gauge::new(),
            fair_pcap_applied: Gauge::new(),

            reward_requests_total: Counter::new(),
            reward_failures: Counter::new(),

            baseline_refresh_total: Counter::new(),
            baseline_refresh_failures: Counter::new(),
            baseline_r0: FloatGauge::default(),

            winners: RwLock::new(HashMap::new()),
        }
    }

    /// Count one win for a creator.
    pub fn record_winner(&self, creator: &str) {
        if let Ok(mut map) = self.winners.write() {
            map.entry(creator.to_string()).or_insert_with(Counter::new).inc();
        }
    }

    /// Win count for a creator, zero when unseen.
    pub fn winner_count(&self, creator: &str) -> u64 {
        self.winners
            .read()
            .ok()
            .and_then(|map| map.get(creator).map(|c| c.get()))
            .unwrap_or(0)
    }

    /// Serialize the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let counters: [(&str, &str, &Counter); 10] = [
            ("heliora_turns_total", "Turns consumed from the contributor stream", &self.turns_total),
            ("heliora_turns_dropped_total", "Turns dropped before a winner was drawn", &self.turns_dropped),
            ("heliora_parse_failures_total", "Inbound payloads that failed to parse", &self.parse_failures),
            ("heliora_publish_failures_total", "Winner announcements that failed to publish", &self.publish_failures),
            ("heliora_finalize_failures_total", "Turn finalizations that returned an error", &self.finalize_failures),
            ("heliora_finalize_replays_total", "Finalizations skipped as already recorded", &self.finalize_replays),
            ("heliora_reward_requests_total", "Reward rounds consumed", &self.reward_requests_total),
            ("heliora_reward_failures_total", "Reward rounds that failed", &self.reward_failures),
            ("heliora_baseline_refresh_total", "Baseline refresh attempts", &self.baseline_refresh_total),
            ("heliora_baseline_refresh_failures_total", "Baseline refreshes that kept the previous value", &self.baseline_refresh_failures),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("fair_penalized_candidates", "Number of penalized candidates in the turn", self.fair_penalized_candidates.get()),
            ("fair_candidates_total", "Number of candidates in the turn", self.fair_candidates_total.get()),
            ("fair_pcap_applied", "1 if the probability cap triggered in the turn", self.fair_pcap_applied.get()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        let float_gauges: [(&str, &str, f64); 2] = [
            ("fair_max_penalty_factor", "The strongest penalty factor applied in the turn", self.fair_max_penalty_factor.get()),
            ("heliora_baseline_r0", "Current irradiance baseline reward unit", self.baseline_r0.get()),
        ];
        for (name, help, value) in float_gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        let _ = writeln!(out, "# HELP block_winner_total Total wins per creator");
        let _ = writeln!(out, "# TYPE block_winner_total counter");
        if let Ok(map) = self.winners.read() {
            let mut creators: Vec<_> = map.iter().collect();
            creators.sort_by_key(|(creator, _)| creator.as_str());
            for (creator, counter) in creators {
                let _ = writeln!(
                    out,
                    "block_winner_total{{creator=\"{}\"}} {}",
                    escape_label(creator),
                    counter.get()
                );
            }
        }

        out
    }
}

impl Default for OracleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_label(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let counter = Counter::new();
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn float_gauge_round_trips() {
        let gauge = FloatGauge::default();
        gauge.set(0.125);
        assert_eq!(gauge.get(), 0.125);
    }

    #[test]
    fn winner_counter_tracks_per_creator() {
        let metrics = OracleMetrics::new();
        metrics.record_winner("a");
        metrics.record_winner("a");
        metrics.record_winner("b");
        assert_eq!(metrics.winner_count("a"), 2);
        assert_eq!(metrics.winner_count("b"), 1);
        assert_eq!(metrics.winner_count("c"), 0);
    }

    #[test]
    fn render_emits_exposition_format() {
        let metrics = OracleMetrics::new();
        metrics.turns_total.inc();
        metrics.fair_penalized_candidates.set(2);
        metrics.fair_max_penalty_factor.set(0.25);
        metrics.record_winner("addr1");

        let text = metrics.render();
        assert!(text.contains("# TYPE heliora_turns_total counter"));
        assert!(text.contains("heliora_turns_total 1"));
        assert!(text.contains("fair_penalized_candidates 2"));
        assert!(text.contains("fair_max_penalty_factor 0.25"));
        assert!(text.contains("block_winner_total{creator=\"addr1\"} 1"));
    }

    #[test]
    fn render_escapes_label_values() {
        let metrics = OracleMetrics::new();
        metrics.record_winner("we\"ird");
        assert!(metrics.render().contains("creator=\"we\\\"ird\""));
    }
}
