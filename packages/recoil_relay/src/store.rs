//! Bounded, append-only transaction log for one connection.
//!
//! Each transaction holds the delta it was built from and the full snapshot
//! after applying it. Snapshots are copy-on-write: a new map is built for
//! every append and values are shared through `Arc`, so a snapshot handed out
//! earlier never changes underneath its reader.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::protocol::TransactionView;

/// Transaction sequence number. Starts at 0 and never skips.
pub type TxId = u64;

/// Named values as of one transaction.
pub type Snapshot = BTreeMap<String, Arc<Value>>;

/// Result of reading a key at a point in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Lookup {
    /// The last value written at or before the requested transaction
    Present(Arc<Value>),
    /// The key had never been written by then
    Absent,
    /// The requested transaction was evicted
    Unavailable,
}

impl Lookup {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Lookup::Present(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Lookup::Unavailable)
    }
}

/// A key's value at a transaction alongside its value one transaction earlier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diff {
    pub current: Lookup,
    pub previous: Lookup,
}

impl Diff {
    pub fn changed(&self) -> bool {
        self.current != self.previous
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxId,
    pub timestamp: DateTime<Utc>,
    modified: BTreeMap<String, Arc<Value>>,
    snapshot: Arc<Snapshot>,
}

impl Transaction {
    /// Keys written by this transaction
    pub fn modified_keys(&self) -> impl Iterator<Item = &str> {
        self.modified.keys().map(String::as_str)
    }

    pub fn modified(&self, key: &str) -> Option<&Value> {
        self.modified.get(key).map(|v| v.as_ref())
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Shared handle to the snapshot, valid for as long as the caller keeps it
    pub fn shared_snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.clone()
    }

    pub fn to_view(&self) -> TransactionView {
        TransactionView {
            id: self.id,
            timestamp: self.timestamp,
            modified_values: self
                .modified
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().clone()))
                .collect(),
        }
    }
}

pub struct TransactionStore {
    log: VecDeque<Transaction>,
    persistence_limit: usize,
}

impl TransactionStore {
    /// Create a store whose transaction 0 holds `initial_values`.
    ///
    /// A limit of 0 is raised to 1 so the head is always readable.
    pub fn new(initial_values: BTreeMap<String, Value>, persistence_limit: usize) -> Self {
        let modified: BTreeMap<String, Arc<Value>> = initial_values
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
        let snapshot = Arc::new(modified.clone());

        let mut log = VecDeque::new();
        log.push_back(Transaction {
            id: 0,
            timestamp: Utc::now(),
            modified,
            snapshot,
        });

        Self {
            log,
            persistence_limit: persistence_limit.max(1),
        }
    }

    /// Append a transaction built from `modified_values` merged onto the
    /// current snapshot, then evict anything past the persistence limit.
    pub fn append(&mut self, modified_values: BTreeMap<String, Value>) -> &Transaction {
        let head = self.head();
        let id = head.id + 1;

        let modified: BTreeMap<String, Arc<Value>> = modified_values
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();

        let mut snapshot: Snapshot = head.snapshot.as_ref().clone();
        for (key, value) in &modified {
            snapshot.insert(key.clone(), value.clone());
        }

        self.log.push_back(Transaction {
            id,
            timestamp: Utc::now(),
            modified,
            snapshot: Arc::new(snapshot),
        });

        while self.log.len() > self.persistence_limit {
            self.log.pop_front();
        }

        self.head()
    }

    /// Value of `key` as of transaction `tx`.
    ///
    /// Ids past the head read the head. Ids below the eviction floor are
    /// `Unavailable` rather than whatever happens to be oldest.
    pub fn get(&self, key: &str, tx: TxId) -> Lookup {
        match self.snapshot(tx) {
            Some(snapshot) => match snapshot.get(key) {
                Some(value) => Lookup::Present(value.clone()),
                None => Lookup::Absent,
            },
            None => Lookup::Unavailable,
        }
    }

    pub fn diff(&self, key: &str, tx: TxId) -> Diff {
        let tx = tx.min(self.current_id());
        let previous = match tx.checked_sub(1) {
            Some(prev) => self.get(key, prev),
            None => Lookup::Absent,
        };
        Diff {
            current: self.get(key, tx),
            previous,
        }
    }

    pub fn snapshot(&self, tx: TxId) -> Option<&Snapshot> {
        self.transaction(tx.min(self.current_id()))
            .map(Transaction::snapshot)
    }

    pub fn transaction(&self, tx: TxId) -> Option<&Transaction> {
        let offset = tx.checked_sub(self.floor_id())?;
        self.log.get(usize::try_from(offset).ok()?)
    }

    pub fn head(&self) -> &Transaction {
        // The log is never empty: new() seeds transaction 0 and eviction
        // keeps at least one entry.
        &self.log[self.log.len() - 1]
    }

    pub fn current_id(&self) -> TxId {
        self.head().id
    }

    /// Oldest transaction id still retained
    pub fn floor_id(&self) -> TxId {
        self.log.front().map(|t| t.id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn persistence_limit(&self) -> usize {
        self.persistence_limit
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.log.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn initial_values_are_transaction_zero() {
        let store = TransactionStore::new(values(&[("a", json!(1))]), 10);
        assert_eq!(store.current_id(), 0);
        assert_eq!(store.floor_id(), 0);
        assert_eq!(store.get("a", 0).value(), Some(&json!(1)));
        assert_eq!(store.get("b", 0), Lookup::Absent);
    }

    #[test]
    fn sequence_is_gapless() {
        let mut store = TransactionStore::new(BTreeMap::new(), 3);
        for expected in 1..=10 {
            let tx = store.append(values(&[("n", json!(expected))]));
            assert_eq!(tx.id, expected);
        }
        let ids: Vec<TxId> = store.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[test]
    fn limit_two_evicts_initial_values() {
        let mut store = TransactionStore::new(values(&[("a", json!(1))]), 2);
        store.append(values(&[("b", json!(2))]));
        assert_eq!(store.get("a", 1).value(), Some(&json!(1)));
        assert_eq!(store.get("b", 1).value(), Some(&json!(2)));

        store.append(values(&[("a", json!(3))]));
        assert_eq!(store.len(), 2);
        assert_eq!(store.floor_id(), 1);
        assert_eq!(store.get("a", 0), Lookup::Unavailable);
        assert_eq!(store.get("a", 2).value(), Some(&json!(3)));
        assert_eq!(store.get("b", 2).value(), Some(&json!(2)));
    }

    #[test]
    fn get_walks_back_to_last_write() {
        let mut store = TransactionStore::new(BTreeMap::new(), 10);
        store.append(values(&[("a", json!("x"))]));
        store.append(values(&[("b", json!(true))]));
        store.append(values(&[("c", json!(null))]));

        // Transaction 3 did not touch `a`
        assert_eq!(store.get("a", 3).value(), Some(&json!("x")));
        // `b` did not exist yet at 1
        assert_eq!(store.get("b", 1), Lookup::Absent);
        // null is a write, not a deletion
        assert_eq!(store.get("c", 3).value(), Some(&Value::Null));
    }

    #[test]
    fn future_ids_read_the_head() {
        let mut store = TransactionStore::new(values(&[("a", json!(1))]), 10);
        store.append(values(&[("a", json!(2))]));
        assert_eq!(store.get("a", 99).value(), Some(&json!(2)));
    }

    #[test]
    fn earlier_snapshots_are_not_mutated() {
        let mut store = TransactionStore::new(values(&[("a", json!(1))]), 10);
        let before = store.head().shared_snapshot();
        store.append(values(&[("a", json!(2)), ("b", json!(3))]));

        assert_eq!(before.len(), 1);
        assert_eq!(before["a"].as_ref(), &json!(1));
        assert_eq!(store.snapshot(0).unwrap()["a"].as_ref(), &json!(1));
        assert_eq!(store.snapshot(1).unwrap().len(), 2);
    }

    #[test]
    fn delta_only_holds_modified_keys() {
        let mut store = TransactionStore::new(values(&[("a", json!(1))]), 10);
        let tx = store.append(values(&[("b", json!(2))]));
        let keys: Vec<&str> = tx.modified_keys().collect();
        assert_eq!(keys, vec!["b"]);
        assert_eq!(tx.modified("a"), None);
        let view = tx.to_view();
        assert_eq!(view.id, 1);
        assert_eq!(view.modified_values, values(&[("b", json!(2))]));
    }

    #[test]
    fn zero_limit_keeps_the_head() {
        let mut store = TransactionStore::new(BTreeMap::new(), 0);
        assert_eq!(store.persistence_limit(), 1);
        store.append(values(&[("a", json!(1))]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a", 1).value(), Some(&json!(1)));
        assert!(store.get("a", 0).is_unavailable());
    }

    #[test]
    fn diff_against_previous_transaction() {
        let mut store = TransactionStore::new(values(&[("a", json!(1))]), 10);
        store.append(values(&[("a", json!(2))]));
        store.append(values(&[("b", json!(0))]));

        let d = store.diff("a", 1);
        assert_eq!(d.previous.value(), Some(&json!(1)));
        assert_eq!(d.current.value(), Some(&json!(2)));
        assert!(d.changed());

        assert!(!store.diff("a", 2).changed());

        let d = store.diff("a", 0);
        assert_eq!(d.previous, Lookup::Absent);
        assert_eq!(d.current.value(), Some(&json!(1)));
    }

    #[test]
    fn diff_at_floor_has_unavailable_previous() {
        let mut store = TransactionStore::new(BTreeMap::new(), 2);
        store.append(values(&[("a", json!(1))]));
        store.append(values(&[("a", json!(2))]));
        let d = store.diff("a", 1);
        assert_eq!(d.previous, Lookup::Unavailable);
        assert_eq!(d.current.value(), Some(&json!(1)));
    }

    #[test]
    fn lookup_serializes_with_status() {
        let present = serde_json::to_value(Lookup::Present(Arc::new(json!({"x": 1})))).unwrap();
        assert_eq!(present, json!({"status": "present", "value": {"x": 1}}));
        let absent = serde_json::to_value(Lookup::Absent).unwrap();
        assert_eq!(absent, json!({"status": "absent"}));
        let gone = serde_json::to_value(Lookup::Unavailable).unwrap();
        assert_eq!(gone, json!({"status": "unavailable"}));
    }
}
