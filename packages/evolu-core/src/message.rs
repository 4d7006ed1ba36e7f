//! Message log, row materialization, and the CRDT apply algorithm.
//!
//! A `Message` is one last-writer-wins column write. `apply` turns a batch of
//! them into row-store mutations plus merkle-tree insertions, following the
//! two independent checks the data model requires: whether the message is
//! new enough to overwrite the materialized cell, and whether it is new to
//! the log at all (duplicates never touch the merkle tree).
//!
//! Persistence lives behind the `Storage` trait so the embedded SQL engine
//! itself stays an external collaborator; an in-memory reference
//! implementation is provided for tests and for embedders that have not
//! wired up a SQL engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::id::Id;
use crate::merkle::MerkleTree;
use crate::value::Value;

/// One last-writer-wins column write: "set `table.row.column` to `value` as
/// of `timestamp`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: Timestamp,
    pub table: String,
    pub row: Id,
    pub column: String,
    pub value: Value,
}

/// A materialized row: arbitrary user columns plus the `createdAt`,
/// `updatedAt`, `isDeleted` bookkeeping columns, all stored as ordinary
/// cells.
pub type Row = HashMap<String, Value>;

/// Minimal persistence contract `MessageStore`/`SyncEngine` depend on.
/// Concrete storage (SQLite or otherwise) is an external collaborator; the
/// crate does not implement a SQL engine itself.
pub trait Storage: Send {
    /// The most recent timestamp logged for this exact cell, if any.
    fn latest_cell_timestamp(&self, table: &str, row: &str, column: &str) -> Option<Timestamp>;

    /// Upserts a single cell value into the materialized row store, creating
    /// the row if it does not already exist.
    fn upsert_cell(&mut self, table: &str, row: &str, column: &str, value: Value, now_millis: u64);

    /// Inserts a message into the log if its timestamp is not already
    /// present (the `message` table's primary key is the timestamp).
    /// Returns `true` if it was newly inserted.
    fn insert_message_if_absent(&mut self, message: &Message) -> bool;

    /// Messages with `timestamp >= since`, in ascending timestamp order, up
    /// to `limit` entries.
    fn messages_since(&self, since: Timestamp, limit: usize) -> Vec<Message>;

    /// Reads a materialized row, if present.
    fn get_row(&self, table: &str, row: &str) -> Option<Row>;

    /// The persisted `(latest_timestamp, merkle_tree_json)` clock singleton,
    /// if this replica has written anything yet. Read-modify-written inside
    /// the same transaction as any message insertion.
    fn read_clock(&self) -> Option<(Timestamp, String)>;

    /// Persists the clock singleton.
    fn write_clock(&mut self, timestamp: Timestamp, merkle_tree_json: String);
}

/// Applies a batch of incoming messages against `storage`, updating `tree`
/// in place. Idempotent: re-applying an already-seen batch is a no-op for
/// both the row store and the merkle tree.
pub fn apply(storage: &mut dyn Storage, tree: &mut MerkleTree, messages: &[Message], now_millis: u64) {
    for m in messages {
        apply_one(storage, tree, m, now_millis);
    }
}

fn apply_one(storage: &mut dyn Storage, tree: &mut MerkleTree, m: &Message, now_millis: u64) {
    let latest_cell_ts = storage.latest_cell_timestamp(&m.table, m.row.as_str(), &m.column);

    // Check 1: only overwrite the materialized cell if this message is
    // strictly newer than whatever is currently logged for the cell.
    if latest_cell_ts.map_or(true, |l| l < m.timestamp) {
        storage.upsert_cell(&m.table, m.row.as_str(), &m.column, m.value.clone(), now_millis);
    }

    // Check 2: the log itself is keyed by timestamp, independent of cell
    // recency -- a duplicate delivery of an already-logged message is a
    // pure no-op (it contributes nothing new to the merkle tree either).
    if storage.insert_message_if_absent(m) {
        tree.insert(&m.timestamp);
    }
}

/// In-memory `Storage` reference implementation. Mirrors the exact ordering
/// and indexing semantics of the SQL schema (`message` keyed by timestamp,
/// cell lookups keyed by `(table, row, column)`) so behavior is identical to
/// a SQL-backed implementation.
#[derive(Default)]
pub struct MemoryStorage {
    messages: std::collections::BTreeMap<[u8; 16], Message>,
    cell_latest: HashMap<(String, String, String), Timestamp>,
    rows: HashMap<(String, String), Row>,
    clock: Option<(Timestamp, String)>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl Storage for MemoryStorage {
    fn latest_cell_timestamp(&self, table: &str, row: &str, column: &str) -> Option<Timestamp> {
        self.cell_latest
            .get(&(table.to_string(), row.to_string(), column.to_string()))
            .copied()
    }

    fn upsert_cell(&mut self, table: &str, row: &str, column: &str, value: Value, now_millis: u64) {
        let key = (table.to_string(), row.to_string());
        let now_iso = crate::hlc::millis_to_iso8601_pub(now_millis);
        let entry = self.rows.entry(key).or_insert_with(|| {
            let mut r = Row::new();
            r.insert("id".to_string(), Value::Text(row.to_string()));
            r.insert("createdAt".to_string(), Value::Text(now_iso.clone()));
            r
        });
        entry.insert(column.to_string(), value);
        entry.insert("updatedAt".to_string(), Value::Text(now_iso));
    }

    fn insert_message_if_absent(&mut self, message: &Message) -> bool {
        let bin = message.timestamp.to_binary();
        let key = (
            message.table.clone(),
            message.row.as_str().to_string(),
            message.column.clone(),
        );
        let newly_inserted = match self.messages.entry(bin) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(message.clone());
                true
            }
        };
        if newly_inserted {
            let entry = self.cell_latest.entry(key).or_insert(message.timestamp);
            if message.timestamp > *entry {
                *entry = message.timestamp;
            }
        }
        newly_inserted
    }

    fn messages_since(&self, since: Timestamp, limit: usize) -> Vec<Message> {
        let since_bin = since.to_binary();
        self.messages
            .range(since_bin..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn get_row(&self, table: &str, row: &str) -> Option<Row> {
        self.rows.get(&(table.to_string(), row.to_string())).cloned()
    }

    fn read_clock(&self) -> Option<(Timestamp, String)> {
        self.clock.clone()
    }

    fn write_clock(&mut self, timestamp: Timestamp, merkle_tree_json: String) {
        self.clock = Some((timestamp, merkle_tree_json));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;

    fn ts(millis: u64, counter: u16, node: u8) -> Timestamp {
        Timestamp {
            millis,
            counter,
            node_id: NodeId([node; 8]),
        }
    }

    fn msg(millis: u64, counter: u16, node: u8, value: Value) -> Message {
        Message {
            timestamp: ts(millis, counter, node),
            table: "todos".to_string(),
            row: Id::try_from_string("a".repeat(21)).unwrap(),
            column: "title".to_string(),
            value,
        }
    }

    #[test]
    fn apply_materializes_cell() {
        let mut storage = MemoryStorage::new();
        let mut tree = MerkleTree::new();
        apply(&mut storage, &mut tree, &[msg(100, 0, 1, Value::Text("a".into()))], 100);
        let row = storage.get_row("todos", &"a".repeat(21)).unwrap();
        assert_eq!(row.get("title"), Some(&Value::Text("a".into())));
    }

    #[test]
    fn apply_is_idempotent() {
        let mut storage = MemoryStorage::new();
        let mut tree = MerkleTree::new();
        let m = msg(100, 0, 1, Value::Text("a".into()));
        apply(&mut storage, &mut tree, &[m.clone()], 100);
        let hash_after_first = tree.root_hash();
        let count_after_first = storage.message_count();
        apply(&mut storage, &mut tree, &[m], 100);
        assert_eq!(tree.root_hash(), hash_after_first);
        assert_eq!(storage.message_count(), count_after_first);
    }

    #[test]
    fn lww_picks_larger_timestamp_regardless_of_delivery_order() {
        let older = msg(100, 0, 1, Value::Text("old".into()));
        let newer = msg(200, 0, 1, Value::Text("new".into()));

        let mut forward = MemoryStorage::new();
        let mut t1 = MerkleTree::new();
        apply(&mut forward, &mut t1, &[older.clone(), newer.clone()], 200);

        let mut backward = MemoryStorage::new();
        let mut t2 = MerkleTree::new();
        apply(&mut backward, &mut t2, &[newer, older], 200);

        let row_a = forward.get_row("todos", &"a".repeat(21)).unwrap();
        let row_b = backward.get_row("todos", &"a".repeat(21)).unwrap();
        assert_eq!(row_a.get("title"), Some(&Value::Text("new".into())));
        assert_eq!(row_b.get("title"), Some(&Value::Text("new".into())));
        assert_eq!(t1.root_hash(), t2.root_hash());
    }

    #[test]
    fn older_message_still_logged_even_though_cell_unchanged() {
        let mut storage = MemoryStorage::new();
        let mut tree = MerkleTree::new();
        let newer = msg(200, 0, 1, Value::Text("new".into()));
        apply(&mut storage, &mut tree, &[newer], 200);
        let older = msg(100, 0, 1, Value::Text("old".into()));
        apply(&mut storage, &mut tree, &[older], 200);

        let row = storage.get_row("todos", &"a".repeat(21)).unwrap();
        assert_eq!(row.get("title"), Some(&Value::Text("new".into())));
        assert_eq!(storage.message_count(), 2);
    }

    #[test]
    fn duplicate_delivery_is_a_no_op() {
        let mut storage = MemoryStorage::new();
        let mut tree = MerkleTree::new();
        let m = msg(100, 0, 1, Value::Text("a".into()));
        apply(&mut storage, &mut tree, &[m.clone(), m], 100);
        assert_eq!(storage.message_count(), 1);
    }

    #[test]
    fn convergence_across_two_replicas_exchanging_all_messages() {
        let messages = vec![
            msg(100, 0, 1, Value::Text("a".into())),
            msg(200, 0, 2, Value::Text("b".into())),
            msg(150, 0, 1, Value::Text("c".into())),
        ];

        let mut replica_a = MemoryStorage::new();
        let mut tree_a = MerkleTree::new();
        apply(&mut replica_a, &mut tree_a, &messages, 200);

        let mut shuffled = messages.clone();
        shuffled.reverse();
        let mut replica_b = MemoryStorage::new();
        let mut tree_b = MerkleTree::new();
        apply(&mut replica_b, &mut tree_b, &shuffled, 200);

        assert_eq!(tree_a.root_hash(), tree_b.root_hash());
        assert_eq!(
            replica_a.get_row("todos", &"a".repeat(21)),
            replica_b.get_row("todos", &"a".repeat(21))
        );
    }

    use proptest::prelude::*;

    fn arb_message() -> impl Strategy<Value = Message> {
        (0u64..100_000, 0u16..100, 0u8..4, ".*".prop_map(|s: String| s.chars().take(8).collect::<String>()))
            .prop_map(|(millis, counter, node, text)| Message {
                timestamp: ts(millis, counter, node),
                table: "todos".to_string(),
                row: Id::try_from_string("a".repeat(21)).unwrap(),
                column: "title".to_string(),
                value: Value::Text(text),
            })
    }

    proptest! {
        /// Property 6: applying the same batch twice leaves both the row
        /// store and the merkle tree unchanged on the second pass.
        #[test]
        fn apply_is_idempotent_for_arbitrary_batches(messages in proptest::collection::vec(arb_message(), 0..20)) {
            let mut storage = MemoryStorage::new();
            let mut tree = MerkleTree::new();
            apply(&mut storage, &mut tree, &messages, 100_000);
            let hash_after_first = tree.root_hash();
            let count_after_first = storage.message_count();
            let row_after_first = storage.get_row("todos", &"a".repeat(21));

            apply(&mut storage, &mut tree, &messages, 100_000);
            prop_assert_eq!(tree.root_hash(), hash_after_first);
            prop_assert_eq!(storage.message_count(), count_after_first);
            prop_assert_eq!(storage.get_row("todos", &"a".repeat(21)), row_after_first);
        }
    }
}
