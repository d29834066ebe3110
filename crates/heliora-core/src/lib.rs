use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod baseline;
pub mod config;
pub mod fairness;
pub mod metrics;
pub mod reward;
pub mod roulette;
pub mod turn;

pub use config::OracleConfig;

/// Opaque bech32-like account identifier. The store and every wire
/// message key on it.
pub type Address = String;

/// Energy contribution as received from a full node. `energy_kwh` stays
/// a string on the wire; parsing is defensive (unparseable or negative
/// values count as zero).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub energy_kwh: String,
}

/// One turn's inbound contributor message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorBatch {
    pub fullnode_id: String,
    #[serde(default)]
    pub contributors: Vec<Contributor>,
}

/// Outbound block-producer announcement. `contribution` carries the
/// winner's final weight for downstream debugging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinnerAnnouncement {
    pub creator: Address,
    pub contribution: f64,
    pub fullnode_id: String,
}

/// Inbound request to reward one round of signing validators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRequest {
    pub fullnode_id: String,
    #[serde(default)]
    pub validators: Vec<Address>,
    #[serde(default)]
    pub timestamp: String,
}

/// Outbound per-address reward map, keyed by the requesting full node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardBatch {
    pub sender_id: String,
    pub rewards: HashMap<Address, f64>,
}

/// Durable per-address credit state.
///
/// Invariants:
/// - `count >= 0` at all times.
/// - `last_time_ms` is monotonically non-decreasing per address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub last_time_ms: Option<i64>,
    pub count: f64,
}

/// Immutable record of a finalized turn. At most one row per `turn_id`;
/// the turn id is the contributor-stream offset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: i64,
    pub fullnode_id: String,
    pub creator: Address,
    pub weight: f64,
    pub created_at_ms: i64,
}

/// Before/after snapshot of one credit mutation performed by a turn
/// finalization. `after_count = before_count + delta`; reset rows have
/// `after_count = 0` and `delta = -before_count`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub turn_id: i64,
    pub address: Address,
    pub before_count: f64,
    pub after_count: f64,
    pub delta: f64,
    pub before_last_time_ms: Option<i64>,
    pub after_last_time_ms: Option<i64>,
    pub created_at_ms: i64,
}

/// One historical win, as consumed by the fairness policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WinRow {
    pub creator: Address,
    pub turn_id: i64,
}

/// Credit handling applied when a turn is finalized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeMode {
    /// Record the turn only; credit is left untouched.
    #[default]
    NoReset,
    /// Zero the credit of every candidate that participated this turn.
    ResetSubset,
    /// Zero the credit of every address with a non-zero count.
    ResetAll,
}

/// Finalization arguments for one turn.
#[derive(Clone, Debug)]
pub struct FinalizeRequest<'a> {
    pub turn_id: i64,
    pub fullnode_id: &'a str,
    pub creator: &'a Address,
    pub weight: f64,
    /// Deduplicated candidate set of the turn; the reset target when
    /// `mode` is `ResetSubset`.
    pub candidates: &'a [Address],
    pub mode: FinalizeMode,
}

/// Result of a finalization attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The turn record was inserted; `ledger_entries` credit rows were
    /// reset and journaled in the same transaction.
    Committed { ledger_entries: usize },
    /// A record for this `turn_id` already existed. Nothing changed.
    AlreadyFinalized,
}

/// Unified error type for oracle core operations.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("selection failed: {0}")]
    SelectionFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("baseline error: {0}")]
    Baseline(String),

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// Upper bound on the candidate set accepted by a single turn.
pub const MAX_CANDIDATES: usize = 4096;

/// Durable per-address credit counter.
///
/// Implementations must be safe under concurrent callers on different
/// addresses; callers mutating the same address serialize.
pub trait CreditStore: Send + Sync {
    /// Adds `delta` to the address's count, creating the row on first
    /// use and stamping `last_time_ms = now_ms`.
    ///
    /// Fails with `InvalidInput` on an empty address; a zero delta is a
    /// no-op.
    fn upsert(&self, address: &str, delta: f64, now_ms: i64) -> Result<()>;

    /// Counts for the given addresses. Missing addresses are simply
    /// absent from the result; callers treat them as zero.
    fn counts(&self, addresses: &[Address]) -> Result<HashMap<Address, f64>>;

    /// Snapshot of every address whose count is strictly positive.
    fn non_zero_addresses(&self) -> Result<BTreeSet<Address>>;

    /// Atomic read-modify-write used by the reward engine: insert the
    /// row if absent; if the address has been inactive for at least
    /// `inactivity_ms`, reset the working count to zero; then add
    /// `amount` and stamp `now_ms`. Returns the new count.
    fn accrue(&self, address: &str, amount: f64, now_ms: i64, inactivity_ms: i64) -> Result<f64>;

    /// Full record for a single address, if present.
    fn credit(&self, address: &str) -> Result<Option<CreditRecord>>;
}

/// Append-only turn bookkeeping.
pub trait TurnLedger: Send + Sync {
    /// Finalizes one turn in a single atomic transaction: the turn
    /// record insert is the commit point, and any credit resets plus
    /// their ledger rows commit with it or not at all.
    ///
    /// Replaying the same `turn_id` returns `AlreadyFinalized` without
    /// side effects.
    fn finalize_turn(&self, request: &FinalizeRequest<'_>, now_ms: i64)
        -> Result<FinalizeOutcome>;

    /// Wins among `candidates` with `turn_id > after_turn`, used by the
    /// fairness window query.
    fn wins_since(&self, candidates: &[Address], after_turn: i64) -> Result<Vec<WinRow>>;

    /// The recorded turn, if finalized.
    fn turn(&self, turn_id: i64) -> Result<Option<TurnRecord>>;

    /// Ledger rows written by the given turn's finalization.
    fn ledger_entries(&self, turn_id: i64) -> Result<Vec<LedgerEntry>>;
}
