//! Durable store for credit counters and the turn ledger.
//!
//! `SledStore` keeps three trees: `vote_counter` (address -> credit
//! record), `turn_result` (turn id -> turn record) and
//! `vote_counter_ledger` ((turn id, address) -> before/after snapshot).
//! Turn finalization runs as one multi-tree sled transaction: the
//! insert-if-absent on `turn_result` is the commit point, so concurrent
//! duplicate finalizers resolve deterministically and a replayed turn
//! never resets credit twice.
//!
//! `InMemoryStore` mirrors the same semantics under a mutex for tests
//! and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use heliora_core::{
    Address, CreditRecord, CreditStore, FinalizeMode, FinalizeOutcome, FinalizeRequest,
    LedgerEntry, OracleError, Result, TurnLedger, TurnRecord, WinRow,
};

const VOTE_COUNTER_TREE: &str = "vote_counter";
const TURN_RESULT_TREE: &str = "turn_result";
const LEDGER_TREE: &str = "vote_counter_ledger";

/// sled-backed implementation of both store seams.
pub struct SledStore {
    credits: sled::Tree,
    turns: sled::Tree,
    ledger: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(storage_err)?;
        Self::from_db(&db)
    }

    /// Open an ephemeral store backed by a temporary sled database.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            credits: db.open_tree(VOTE_COUNTER_TREE).map_err(storage_err)?,
            turns: db.open_tree(TURN_RESULT_TREE).map_err(storage_err)?,
            ledger: db.open_tree(LEDGER_TREE).map_err(storage_err)?,
        })
    }

    /// Flush dirty buffers to disk.
    pub fn flush(&self) -> Result<()> {
        self.credits.flush().map_err(storage_err)?;
        self.turns.flush().map_err(storage_err)?;
        self.ledger.flush().map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: impl std::fmt::Display) -> OracleError {
    OracleError::Storage(e.to_string())
}

fn turn_key(turn_id: i64) -> [u8; 8] {
    // Offsets are non-negative, so the unsigned big-endian encoding
    // keeps range scans in turn order.
    (turn_id as u64).to_be_bytes()
}

fn ledger_key(turn_id: i64, address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + address.len());
    key.extend_from_slice(&turn_key(turn_id));
    key.extend_from_slice(address.as_bytes());
    key
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(storage_err)
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    bincode::deserialize(raw).map_err(storage_err)
}

/// Addresses a finalization may reset, resolved before the transaction
/// starts. The transaction itself re-checks each row so an address
/// whose credit went to zero in between is simply skipped.
fn reset_targets(
    mode: FinalizeMode,
    candidates: &[Address],
    store: &dyn CreditStore,
) -> Result<Vec<Address>> {
    match mode {
        FinalizeMode::NoReset => Ok(Vec::new()),
        FinalizeMode::ResetSubset => Ok(candidates.to_vec()),
        FinalizeMode::ResetAll => Ok(store.non_zero_addresses()?.into_iter().collect()),
    }
}

impl CreditStore for SledStore {
    fn upsert(&self, address: &str, delta: f64, now_ms: i64) -> Result<()> {
        if address.is_empty() {
            return Err(OracleError::InvalidInput("upsert: empty address".into()));
        }
        if delta == 0.0 {
            return Ok(());
        }
        let result = self.credits.transaction(|tree| {
            let mut record: CreditRecord = match tree.get(address.as_bytes())? {
                Some(raw) => decode(&raw).map_err(ConflictableTransactionError::Abort)?,
                None => CreditRecord::default(),
            };
            // Counts never go below zero.
            record.count = (record.count + delta).max(0.0);
            record.last_time_ms = Some(now_ms);
            let raw = encode(&record).map_err(ConflictableTransactionError::Abort)?;
            tree.insert(address.as_bytes(), raw)?;
            Ok(())
        });
        unwrap_transaction(result)
    }

    fn counts(&self, addresses: &[Address]) -> Result<HashMap<Address, f64>> {
        let mut out = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if let Some(raw) = self.credits.get(address.as_bytes()).map_err(storage_err)? {
                let record: CreditRecord = decode(&raw)?;
                out.insert(address.clone(), record.count);
            }
        }
        Ok(out)
    }

    fn non_zero_addresses(&self) -> Result<BTreeSet<Address>> {
        let mut out = BTreeSet::new();
        for entry in self.credits.iter() {
            let (key, raw) = entry.map_err(storage_err)?;
            let record: CreditRecord = decode(&raw)?;
            if record.count > 0.0 {
                let address = String::from_utf8(key.to_vec())
                    .map_err(|_| OracleError::Storage("non-utf8 address key".into()))?;
                out.insert(address);
            }
        }
        Ok(out)
    }

    fn accrue(&self, address: &str, amount: f64, now_ms: i64, inactivity_ms: i64) -> Result<f64> {
        if address.is_empty() {
            return Err(OracleError::InvalidInput("accrue: empty address".into()));
        }
        let result = self.credits.transaction(|tree| {
            let mut record: CreditRecord = match tree.get(address.as_bytes())? {
                Some(raw) => decode(&raw).map_err(ConflictableTransactionError::Abort)?,
                None => CreditRecord::default(),
            };
            if let Some(last) = record.last_time_ms {
                if inactivity_ms > 0 && now_ms - last >= inactivity_ms {
                    record.count = 0.0;
                }
            }
            record.count += amount;
            record.last_time_ms = Some(now_ms);
            let raw = encode(&record).map_err(ConflictableTransactionError::Abort)?;
            tree.insert(address.as_bytes(), raw)?;
            Ok(record.count)
        });
        unwrap_transaction(result)
    }

    fn credit(&self, address: &str) -> Result<Option<CreditRecord>> {
        match self.credits.get(address.as_bytes()).map_err(storage_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }
}

fn unwrap_transaction<T>(
    result: std::result::Result<T, sled::transaction::TransactionError<OracleError>>,
) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(sled::transaction::TransactionError::Abort(e)) => Err(e),
        Err(sled::transaction::TransactionError::Storage(e)) => Err(storage_err(e)),
    }
}

impl TurnLedger for SledStore {
    fn finalize_turn(
        &self,
        request: &FinalizeRequest<'_>,
        now_ms: i64,
    ) -> Result<FinalizeOutcome> {
        let targets = reset_targets(request.mode, request.candidates, self)?;

        let record = TurnRecord {
            turn_id: request.turn_id,
            fullnode_id: request.fullnode_id.to_string(),
            creator: request.creator.clone(),
            weight: request.weight,
            created_at_ms: now_ms,
        };
        let record_raw = encode(&record)?;
        let key = turn_key(request.turn_id);

        let result = (&self.turns, &self.credits, &self.ledger).transaction(
            |(turns, credits, ledger)| {
                if turns.get(key)?.is_some() {
                    return Ok(FinalizeOutcome::AlreadyFinalized);
                }
                turns.insert(&key, record_raw.clone())?;

                let mut entries = 0usize;
                for address in &targets {
                    let Some(raw) = credits.get(address.as_bytes())? else {
                        continue;
                    };
                    let before: CreditRecord =
                        decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                    if before.count == 0.0 {
                        continue;
                    }
                    let after = CreditRecord {
                        last_time_ms: Some(now_ms),
                        count: 0.0,
                    };
                    let entry = LedgerEntry {
                        turn_id: request.turn_id,
                        address: address.clone(),
                        before_count: before.count,
                        after_count: 0.0,
                        delta: -before.count,
                        before_last_time_ms: before.last_time_ms,
                        after_last_time_ms: after.last_time_ms,
                        created_at_ms: now_ms,
                    };
                    let after_raw =
                        encode(&after).map_err(ConflictableTransactionError::Abort)?;
                    let entry_raw =
                        encode(&entry).map_err(ConflictableTransactionError::Abort)?;
                    credits.insert(address.as_bytes(), after_raw)?;
                    ledger.insert(ledger_key(request.turn_id, address), entry_raw)?;
                    entries += 1;
                }
                Ok(FinalizeOutcome::Committed {
                    ledger_entries: entries,
                })
            },
        );
        unwrap_transaction(result)
    }

    fn wins_since(&self, candidates: &[Address], after_turn: i64) -> Result<Vec<WinRow>> {
        let wanted: BTreeSet<&str> = candidates.iter().map(|a| a.as_str()).collect();
        let start = turn_key(after_turn.saturating_add(1).max(0));
        let mut out = Vec::new();
        for entry in self.turns.range(start..) {
            let (_, raw) = entry.map_err(storage_err)?;
            let record: TurnRecord = decode(&raw)?;
            if wanted.contains(record.creator.as_str()) {
                out.push(WinRow {
                    creator: record.creator,
                    turn_id: record.turn_id,
                });
            }
        }
        Ok(out)
    }

    fn turn(&self, turn_id: i64) -> Result<Option<TurnRecord>> {
        match self.turns.get(turn_key(turn_id)).map_err(storage_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn ledger_entries(&self, turn_id: i64) -> Result<Vec<LedgerEntry>> {
        let mut out = Vec::new();
        for entry in self.ledger.scan_prefix(turn_key(turn_id)) {
            let (_, raw) = entry.map_err(storage_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct MemoryInner {
    credits: BTreeMap<Address, CreditRecord>,
    turns: BTreeMap<i64, TurnRecord>,
    ledger: BTreeMap<(i64, Address), LedgerEntry>,
}

/// In-memory store with the same semantics as [`SledStore`].
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CreditStore for InMemoryStore {
    fn upsert(&self, address: &str, delta: f64, now_ms: i64) -> Result<()> {
        if address.is_empty() {
            return Err(OracleError::InvalidInput("upsert: empty address".into()));
        }
        if delta == 0.0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner.credits.entry(address.to_string()).or_default();
        record.count = (record.count + delta).max(0.0);
        record.last_time_ms = Some(now_ms);
        Ok(())
    }

    fn counts(&self, addresses: &[Address]) -> Result<HashMap<Address, f64>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(addresses
            .iter()
            .filter_map(|a| inner.credits.get(a).map(|r| (a.clone(), r.count)))
            .collect())
    }

    fn non_zero_addresses(&self) -> Result<BTreeSet<Address>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .credits
            .iter()
            .filter(|(_, r)| r.count > 0.0)
            .map(|(a, _)| a.clone())
            .collect())
    }

    fn accrue(&self, address: &str, amount: f64, now_ms: i64, inactivity_ms: i64) -> Result<f64> {
        if address.is_empty() {
            return Err(OracleError::InvalidInput("accrue: empty address".into()));
        }
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner.credits.entry(address.to_string()).or_default();
        if let Some(last) = record.last_time_ms {
            if inactivity_ms > 0 && now_ms - last >= inactivity_ms {
                record.count = 0.0;
            }
        }
        record.count += amount;
        record.last_time_ms = Some(now_ms);
        Ok(record.count)
    }

    fn credit(&self, address: &str) -> Result<Option<CreditRecord>> {
        Ok(self.inner.lock().expect("store lock").credits.get(address).copied())
    }
}

impl TurnLedger for InMemoryStore {
    fn finalize_turn(
        &self,
        request: &FinalizeRequest<'_>,
        now_ms: i64,
    ) -> Result<FinalizeOutcome> {
        let targets = reset_targets(request.mode, request.candidates, self)?;

        let mut inner = self.inner.lock().expect("store lock");
        if inner.turns.contains_key(&request.turn_id) {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        inner.turns.insert(
            request.turn_id,
            TurnRecord {
                turn_id: request.turn_id,
                fullnode_id: request.fullnode_id.to_string(),
                creator: request.creator.clone(),
                weight: request.weight,
                created_at_ms: now_ms,
            },
        );

        let mut entries = 0usize;
        for address in &targets {
            let Some(record) = inner.credits.get_mut(address) else {
                continue;
            };
            if record.count == 0.0 {
                continue;
            }
            let before = *record;
            record.count = 0.0;
            record.last_time_ms = Some(now_ms);
            inner.ledger.insert(
                (request.turn_id, address.clone()),
                LedgerEntry {
                    turn_id: request.turn_id,
                    address: address.clone(),
                    before_count: before.count,
                    after_count: 0.0,
                    delta: -before.count,
                    before_last_time_ms: before.last_time_ms,
                    after_last_time_ms: Some(now_ms),
                    created_at_ms: now_ms,
                },
            );
            entries += 1;
        }
        Ok(FinalizeOutcome::Committed {
            ledger_entries: entries,
        })
    }

    fn wins_since(&self, candidates: &[Address], after_turn: i64) -> Result<Vec<WinRow>> {
        let wanted: BTreeSet<&str> = candidates.iter().map(|a| a.as_str()).collect();
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .turns
            .range((after_turn.saturating_add(1))..)
            .filter(|(_, r)| wanted.contains(r.creator.as_str()))
            .map(|(_, r)| WinRow {
                creator: r.creator.clone(),
                turn_id: r.turn_id,
            })
            .collect())
    }

    fn turn(&self, turn_id: i64) -> Result<Option<TurnRecord>> {
        Ok(self.inner.lock().expect("store lock").turns.get(&turn_id).cloned())
    }

    fn ledger_entries(&self, turn_id: i64) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .ledger
            .range((turn_id, String::new())..=(turn_id, "\u{10ffff}".to_string()))
            .map(|(_, e)| e.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize_request<'a>(
        turn_id: i64,
        creator: &'a Address,
        candidates: &'a [Address],
        mode: FinalizeMode,
    ) -> FinalizeRequest<'a> {
        FinalizeRequest {
            turn_id,
            fullnode_id: "fn1",
            creator,
            weight: 0.7,
            candidates,
            mode,
        }
    }

    fn stores() -> Vec<(&'static str, Box<dyn Store>)> {
        vec![
            ("memory", Box::new(InMemoryStore::new())),
            (
                "sled",
                Box::new(SledStore::open_temporary().expect("temporary store")),
            ),
        ]
    }

    trait Store: CreditStore + TurnLedger {}
    impl<T: CreditStore + TurnLedger> Store for T {}

    #[test]
    fn upsert_rejects_empty_address_and_skips_zero_delta() {
        for (name, store) in stores() {
            assert!(
                matches!(store.upsert("", 1.0, 0), Err(OracleError::InvalidInput(_))),
                "{name}"
            );
            store.upsert("a", 0.0, 0).expect("zero delta");
            assert!(store.credit("a").expect("credit").is_none(), "{name}");
        }
    }

    #[test]
    fn upsert_accumulates_and_stamps_time() {
        for (name, store) in stores() {
            store.upsert("a", 1.5, 100).expect("upsert");
            store.upsert("a", 2.5, 200).expect("upsert");
            let record = store.credit("a").expect("credit").expect("row");
            assert_eq!(record.count, 4.0, "{name}");
            assert_eq!(record.last_time_ms, Some(200), "{name}");
        }
    }

    #[test]
    fn counts_omits_missing_addresses() {
        for (name, store) in stores() {
            store.upsert("a", 3.0, 0).expect("upsert");
            let counts = store
                .counts(&["a".to_string(), "ghost".to_string()])
                .expect("counts");
            assert_eq!(counts.len(), 1, "{name}");
            assert_eq!(counts["a"], 3.0, "{name}");
        }
    }

    #[test]
    fn non_zero_addresses_snapshot() {
        for (name, store) in stores() {
            store.upsert("a", 3.0, 0).expect("upsert");
            store.upsert("b", 1.0, 0).expect("upsert");
            store.upsert("b", -1.0, 1).expect("upsert");
            let set = store.non_zero_addresses().expect("snapshot");
            assert_eq!(set.len(), 1, "{name}");
            assert!(set.contains("a"), "{name}");
        }
    }

    #[test]
    fn accrue_inserts_then_adds() {
        for (name, store) in stores() {
            let first = store.accrue("a", 2.0, 100, 0).expect("accrue");
            assert_eq!(first, 2.0, "{name}");
            let second = store.accrue("a", 2.0, 200, 0).expect("accrue");
            assert_eq!(second, 4.0, "{name}");
        }
    }

    #[test]
    fn accrue_resets_after_inactivity() {
        let week = 7 * 24 * 60 * 60 * 1000i64;
        for (name, store) in stores() {
            store.accrue("a", 5.0, 0, week).expect("accrue");
            let count = store.accrue("a", 1.0, week + 1, week).expect("accrue");
            assert_eq!(count, 1.0, "{name}");
        }
    }

    #[test]
    fn finalize_records_turn_and_resets_subset() {
        for (name, store) in stores() {
            store.upsert("a", 4.0, 10).expect("upsert");
            store.upsert("b", 2.0, 10).expect("upsert");
            store.upsert("c", 9.0, 10).expect("upsert");

            let creator = "a".to_string();
            let candidates = vec!["a".to_string(), "b".to_string()];
            let outcome = store
                .finalize_turn(
                    &finalize_request(7, &creator, &candidates, FinalizeMode::ResetSubset),
                    1_000,
                )
                .expect("finalize");
            assert_eq!(outcome, FinalizeOutcome::Committed { ledger_entries: 2 }, "{name}");

            let turn = store.turn(7).expect("turn").expect("row");
            assert_eq!(turn.creator, "a", "{name}");

            assert_eq!(store.credit("a").expect("credit").expect("row").count, 0.0, "{name}");
            assert_eq!(store.credit("b").expect("credit").expect("row").count, 0.0, "{name}");
            // Outside the candidate subset: untouched.
            assert_eq!(store.credit("c").expect("credit").expect("row").count, 9.0, "{name}");

            let entries = store.ledger_entries(7).expect("entries");
            assert_eq!(entries.len(), 2, "{name}");
            for entry in &entries {
                assert_eq!(entry.after_count, 0.0, "{name}");
                assert_eq!(entry.after_count, entry.before_count + entry.delta, "{name}");
                assert_eq!(entry.after_last_time_ms, Some(1_000), "{name}");
            }
        }
    }

    #[test]
    fn finalize_no_reset_leaves_credit_alone() {
        for (name, store) in stores() {
            store.upsert("a", 4.0, 10).expect("upsert");
            let creator = "a".to_string();
            let candidates = vec!["a".to_string()];
            store
                .finalize_turn(
                    &finalize_request(1, &creator, &candidates, FinalizeMode::NoReset),
                    1_000,
                )
                .expect("finalize");
            assert_eq!(store.credit("a").expect("credit").expect("row").count, 4.0, "{name}");
            assert!(store.ledger_entries(1).expect("entries").is_empty(), "{name}");
        }
    }

    #[test]
    fn finalize_reset_all_covers_non_candidates() {
        for (name, store) in stores() {
            store.upsert("a", 4.0, 10).expect("upsert");
            store.upsert("z", 6.0, 10).expect("upsert");
            let creator = "a".to_string();
            let candidates = vec!["a".to_string()];
            let outcome = store
                .finalize_turn(
                    &finalize_request(2, &creator, &candidates, FinalizeMode::ResetAll),
                    1_000,
                )
                .expect("finalize");
            assert_eq!(outcome, FinalizeOutcome::Committed { ledger_entries: 2 }, "{name}");
            assert_eq!(store.credit("z").expect("credit").expect("row").count, 0.0, "{name}");
        }
    }

    #[test]
    fn finalize_is_idempotent_across_replays() {
        // Replaying the identical finalize after a simulated crash must
        // leave a single turn row, a single ledger set and no double
        // reset.
        for (name, store) in stores() {
            store.upsert("a", 4.0, 10).expect("upsert");
            let creator = "a".to_string();
            let candidates = vec!["a".to_string()];
            let request = finalize_request(7, &creator, &candidates, FinalizeMode::ResetSubset);

            let first = store.finalize_turn(&request, 1_000).expect("finalize");
            assert_eq!(first, FinalizeOutcome::Committed { ledger_entries: 1 }, "{name}");

            // Credit earned between the crash and the replay must
            // survive the replay untouched.
            store.upsert("a", 5.0, 2_000).expect("upsert");

            let replay = store.finalize_turn(&request, 3_000).expect("replay");
            assert_eq!(replay, FinalizeOutcome::AlreadyFinalized, "{name}");

            assert_eq!(store.credit("a").expect("credit").expect("row").count, 5.0, "{name}");
            assert_eq!(store.ledger_entries(7).expect("entries").len(), 1, "{name}");
            let turn = store.turn(7).expect("turn").expect("row");
            assert_eq!(turn.created_at_ms, 1_000, "{name}");
        }
    }

    #[test]
    fn wins_since_filters_by_creator_and_window() {
        for (name, store) in stores() {
            let candidates = vec!["a".to_string(), "b".to_string()];
            for (turn_id, creator) in [(1i64, "a"), (2, "x"), (3, "a"), (4, "b")] {
                let creator = creator.to_string();
                store
                    .finalize_turn(
                        &finalize_request(turn_id, &creator, &[], FinalizeMode::NoReset),
                        0,
                    )
                    .expect("finalize");
            }

            let wins = store.wins_since(&candidates, 1).expect("wins");
            let got: Vec<(String, i64)> =
                wins.into_iter().map(|w| (w.creator, w.turn_id)).collect();
            assert_eq!(
                got,
                vec![("a".to_string(), 3), ("b".to_string(), 4)],
                "{name}"
            );
        }
    }

    #[test]
    fn sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = SledStore::open(dir.path()).expect("open");
            store.upsert("a", 2.5, 100).expect("upsert");
            store.flush().expect("flush");
        }
        let store = SledStore::open(dir.path()).expect("reopen");
        assert_eq!(store.credit("a").expect("credit").expect("row").count, 2.5);
    }
}
