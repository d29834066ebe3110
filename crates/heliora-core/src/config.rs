//! Configuration for the oracle.
//!
//! Structured configuration with validation for every component.
//! Values load from programmatic defaults, a JSON file, or environment
//! variables prefixed with `HELIORA_` (highest precedence).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{FinalizeMode, OracleError, Result};

/// Complete oracle configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Producer-selection weighting.
    pub selection: SelectionConfig,

    /// Win-concentration penalty.
    pub fairness: FairnessConfig,

    /// Post-normalization probability cap.
    pub pcap: PcapConfig,

    /// Vote-participation reward.
    pub reward: RewardConfig,

    /// Irradiance baseline derivation and refresh schedule.
    pub baseline: BaselineConfig,

    /// Upstream KMA fetch.
    pub kma: KmaConfig,

    /// Credit handling at turn finalization.
    pub finalize: FinalizeConfig,

    /// Metrics endpoint.
    pub metrics: MetricsConfig,

    /// Durable store location.
    pub storage: StorageConfig,

    /// Topic names of the message streams.
    pub topics: TopicConfig,

    /// Log filtering.
    pub logging: LoggingConfig,
}

impl OracleConfig {
    /// Load configuration from the environment on top of defaults.
    ///
    /// Recognized variables:
    /// - `HELIORA_BETA` - energy vs credit weight
    /// - `HELIORA_EPSILON` - weight floor
    /// - `HELIORA_FAIRNESS_ENABLED`, `HELIORA_FAIRNESS_WINDOW`,
    ///   `HELIORA_FAIRNESS_MAX_WINS`, `HELIORA_FAIRNESS_SOFT_TURNS`,
    ///   `HELIORA_FAIRNESS_GAMMA`, `HELIORA_FAIRNESS_MODE`
    /// - `HELIORA_PCAP_ENABLED`, `HELIORA_PCAP_LIMIT`
    /// - `HELIORA_REWARD_POPULATION`, `HELIORA_REWARD_ANNOUNCE`
    /// - `HELIORA_KMA_AUTH_KEY`, `HELIORA_KMA_STATION`
    /// - `HELIORA_FINALIZE_MODE`
    /// - `HELIORA_METRICS_ADDR`
    /// - `HELIORA_STORAGE_PATH`
    /// - `HELIORA_LOG` - EnvFilter directive
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        let config = self;

        if let Ok(v) = std::env::var("HELIORA_BETA") {
            config.selection.beta = parse_var("HELIORA_BETA", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_EPSILON") {
            config.selection.epsilon = parse_var("HELIORA_EPSILON", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_ENABLED") {
            config.fairness.enabled = parse_var("HELIORA_FAIRNESS_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_WINDOW") {
            config.fairness.window_turns = parse_var("HELIORA_FAIRNESS_WINDOW", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_MAX_WINS") {
            config.fairness.max_wins = parse_var("HELIORA_FAIRNESS_MAX_WINS", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_SOFT_TURNS") {
            config.fairness.soft_turns = parse_var("HELIORA_FAIRNESS_SOFT_TURNS", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_GAMMA") {
            config.fairness.gamma = parse_var("HELIORA_FAIRNESS_GAMMA", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_FAIRNESS_MODE") {
            config.fairness.mode = match v.as_str() {
                "ramp" => PenaltyMode::Ramp,
                "fixed" => PenaltyMode::Fixed,
                other => {
                    return Err(OracleError::Config(format!(
                        "invalid HELIORA_FAIRNESS_MODE: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("HELIORA_PCAP_ENABLED") {
            config.pcap.enabled = parse_var("HELIORA_PCAP_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_PCAP_LIMIT") {
            config.pcap.limit = parse_var("HELIORA_PCAP_LIMIT", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_REWARD_POPULATION") {
            config.reward.population = parse_var("HELIORA_REWARD_POPULATION", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_REWARD_ANNOUNCE") {
            config.reward.announce = parse_var("HELIORA_REWARD_ANNOUNCE", &v)?;
        }
        if let Ok(v) = std::env::var("HELIORA_KMA_AUTH_KEY") {
            config.kma.auth_key = v;
        }
        if let Ok(v) = std::env::var("HELIORA_KMA_STATION") {
            config.kma.station = v;
        }
        if let Ok(v) = std::env::var("HELIORA_FINALIZE_MODE") {
            config.finalize.mode = match v.as_str() {
                "no-reset" => FinalizeMode::NoReset,
                "reset-subset" => FinalizeMode::ResetSubset,
                "reset-all" => FinalizeMode::ResetAll,
                other => {
                    return Err(OracleError::Config(format!(
                        "invalid HELIORA_FINALIZE_MODE: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("HELIORA_METRICS_ADDR") {
            config.metrics.listen_addr = v;
        }
        if let Ok(v) = std::env::var("HELIORA_STORAGE_PATH") {
            config.storage.path = v;
        }
        if let Ok(v) = std::env::var("HELIORA_LOG") {
            config.logging.filter = v;
        }

        Ok(())
    }

    /// Parse a full configuration from JSON, then validate it.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| OracleError::Config(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints. Called at startup; a failure
    /// here is the only error class that terminates the process.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.selection.beta) {
            return Err(OracleError::Config(format!(
                "selection.beta must lie in [0,1], got {}",
                self.selection.beta
            )));
        }
        if self.selection.epsilon <= 0.0 {
            return Err(OracleError::Config(
                "selection.epsilon must be positive".into(),
            ));
        }
        if self.fairness.enabled {
            if self.fairness.window_turns == 0
                || self.fairness.max_wins == 0
                || self.fairness.soft_turns == 0
            {
                return Err(OracleError::Config(
                    "fairness window, max_wins and soft_turns must be at least 1".into(),
                ));
            }
            if !(self.fairness.gamma > 0.0 && self.fairness.gamma <= 1.0) {
                return Err(OracleError::Config(format!(
                    "fairness.gamma must lie in (0,1], got {}",
                    self.fairness.gamma
                )));
            }
        }
        if self.pcap.enabled && !(self.pcap.limit > 0.0 && self.pcap.limit <= 1.0) {
            return Err(OracleError::Config(format!(
                "pcap.limit must lie in (0,1], got {}",
                self.pcap.limit
            )));
        }
        if !(0.0..=1.0).contains(&self.baseline.quantile_low)
            || !(0.0..=1.0).contains(&self.baseline.quantile_high)
            || self.baseline.quantile_low >= self.baseline.quantile_high
        {
            return Err(OracleError::Config(
                "baseline quantiles must satisfy 0 <= low < high <= 1".into(),
            ));
        }
        if self.baseline.offset_minutes >= 60 {
            return Err(OracleError::Config(
                "baseline.offset_minutes must be below 60".into(),
            ));
        }
        parse_utc_offset(&self.baseline.utc_offset)?;
        if self.storage.path.is_empty() {
            return Err(OracleError::Config("storage.path must be set".into()));
        }
        if self.metrics.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(OracleError::Config(format!(
                "metrics.listen_addr is not a socket address: {}",
                self.metrics.listen_addr
            )));
        }
        for (name, topic) in [
            ("topics.contributors", &self.topics.contributors),
            ("topics.block_creator", &self.topics.block_creator),
            ("topics.reward_request", &self.topics.reward_request),
            ("topics.reward_result", &self.topics.reward_result),
        ] {
            if topic.is_empty() {
                return Err(OracleError::Config(format!("{name} must be set")));
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| OracleError::Config(format!("invalid {name}: {e}")))
}

/// Parse a `+HH:MM` / `-HH:MM` offset into seconds east of UTC.
pub fn parse_utc_offset(raw: &str) -> Result<i32> {
    let err = || OracleError::Config(format!("invalid utc offset: {raw}"));
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(err()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(err)?;
    let hours: i32 = hours.parse().map_err(|_| err())?;
    let minutes: i32 = minutes.parse().map_err(|_| err())?;
    if hours > 14 || minutes > 59 {
        return Err(err());
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}

/// Producer-selection weighting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Energy vs credit weight: `w = beta * x + (1 - beta) * r`.
    pub beta: f64,

    /// Floor added to every weight so no candidate is unselectable.
    pub epsilon: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            beta: 0.7,
            epsilon: 1e-12,
        }
    }
}

/// Penalty curve applied to over-winning candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyMode {
    /// `gamma^R`: the penalty decays as the offending win ages out.
    #[default]
    Ramp,
    /// Flat `gamma` while the penalty window is open.
    Fixed,
}

/// Win-concentration penalty parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub enabled: bool,

    /// Sliding window length N, in turns.
    pub window_turns: u32,

    /// Maximum tolerated wins M inside the window.
    pub max_wins: u32,

    /// Penalty tail length K: how long a breach keeps hurting.
    pub soft_turns: u32,

    /// Penalty factor in (0, 1].
    pub gamma: f64,

    pub mode: PenaltyMode,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_turns: 20,
            max_wins: 3,
            soft_turns: 5,
            gamma: 0.5,
            mode: PenaltyMode::Ramp,
        }
    }
}

/// Post-normalization probability cap.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PcapConfig {
    pub enabled: bool,

    /// Hard upper bound on any single candidate's probability.
    pub limit: f64,
}

impl Default for PcapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 0.7,
        }
    }
}

/// Vote-participation reward parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Maximum bonus ratio on top of the baseline reward.
    pub bonus_beta: f64,

    /// Participation ratio at which the bonus starts.
    pub r_start: f64,

    /// Days of inactivity after which accumulated credit resets.
    pub inactivity_days: u32,

    /// Publish the per-address reward map on the result topic. When
    /// off, credit accumulates silently.
    pub announce: bool,

    /// Seed for the registered light-node population counter.
    pub population: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            bonus_beta: 0.5,
            r_start: 0.5,
            inactivity_days: 7,
            announce: true,
            population: 0,
        }
    }
}

/// Irradiance baseline parameters and refresh schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub scheduler_enabled: bool,

    /// Minutes past the hour at which to refresh; upstream data lands
    /// shortly after the top of the hour.
    pub offset_minutes: u32,

    /// Fixed offset of the refresh wall clock, e.g. `+09:00`.
    pub utc_offset: String,

    /// Regions admitted into the per-region median aggregation.
    pub requested_regions: BTreeSet<String>,

    pub quantile_low: f64,
    pub quantile_high: f64,

    /// Map `q*` back through the inverse ECDF of the raw samples
    /// instead of using it directly.
    pub enable_inverse: bool,

    /// Scale constant B applied to the raw baseline.
    pub scale: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            // Opt-in: refreshing needs upstream credentials and a
            // station mapping; without them rewards pay a zero
            // baseline.
            scheduler_enabled: false,
            offset_minutes: 10,
            utc_offset: "+09:00".into(),
            requested_regions: BTreeSet::new(),
            quantile_low: 0.10,
            quantile_high: 0.90,
            enable_inverse: true,
            scale: 1.0,
        }
    }
}

/// Upstream KMA fetch parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KmaConfig {
    pub api_url: String,
    pub auth_key: String,

    /// Station selector; empty means all stations.
    pub station: String,

    /// How many hours to walk back when the freshest timestamp has no
    /// rows yet.
    pub backoff_hours: u32,

    /// Path of the station-to-region mapping table.
    pub stations_path: String,
}

impl Default for KmaConfig {
    fn default() -> Self {
        Self {
            api_url: "https://apihub.kma.go.kr/api/typ01/url/kma_sfctm2.php".into(),
            auth_key: String::new(),
            station: String::new(),
            backoff_hours: 3,
            stations_path: "solar_stations.json".into(),
        }
    }
}

/// Credit handling at turn finalization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub mode: FinalizeMode,
}

/// Metrics endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9464".into(),
        }
    }
}

/// Durable store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "heliora-data".into(),
        }
    }
}

/// Topic names of the message streams.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub contributors: String,
    pub block_creator: String,
    pub reward_request: String,
    pub reward_result: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            contributors: "contributors".into(),
            block_creator: "block-creator".into(),
            reward_request: "request-vote-member".into(),
            reward_result: "result-vote-member".into(),
        }
    }
}

/// Log filtering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        OracleConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_beta_out_of_range() {
        let mut config = OracleConfig::default();
        config.selection.beta = 1.5;
        assert!(matches!(config.validate(), Err(OracleError::Config(_))));
    }

    #[test]
    fn rejects_gamma_out_of_range_when_fairness_enabled() {
        let mut config = OracleConfig::default();
        config.fairness.enabled = true;
        config.fairness.gamma = 0.0;
        assert!(matches!(config.validate(), Err(OracleError::Config(_))));

        config.fairness.gamma = 0.5;
        config.validate().expect("gamma back in range");
    }

    #[test]
    fn rejects_degenerate_quantiles() {
        let mut config = OracleConfig::default();
        config.baseline.quantile_low = 0.9;
        config.baseline.quantile_high = 0.1;
        assert!(matches!(config.validate(), Err(OracleError::Config(_))));
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config = OracleConfig::default();
        config.metrics.listen_addr = "not-an-addr".into();
        assert!(matches!(config.validate(), Err(OracleError::Config(_))));
    }

    #[test]
    fn parses_utc_offsets() {
        assert_eq!(parse_utc_offset("+09:00").expect("kst"), 9 * 3600);
        assert_eq!(parse_utc_offset("-05:30").expect("west"), -(5 * 3600 + 30 * 60));
        assert!(parse_utc_offset("09:00").is_err());
        assert!(parse_utc_offset("+15:00").is_err());
    }

    #[test]
    fn from_json_round_trips_mode_names() {
        let raw = r#"{
            "fairness": {"enabled": true, "mode": "fixed"},
            "finalize": {"mode": "reset-subset"}
        }"#;
        let config = OracleConfig::from_json(raw).expect("parse");
        assert_eq!(config.fairness.mode, PenaltyMode::Fixed);
        assert_eq!(config.finalize.mode, crate::FinalizeMode::ResetSubset);
    }
}
