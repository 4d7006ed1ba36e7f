//! The `Evolu` facade: lifecycle, mutation batching, and the boundary
//! between local writes and the sync engine.
//!
//! Follows a `ManagedService`-style lifecycle (construct, run, shut down)
//! rather than an ad hoc constructor: [`Evolu::new`] wires up
//! `Clock`, `Storage`, `QueryEngine` and a `SyncEngine` from a [`Config`],
//! and [`Evolu::run_sync_loop`] owns the cancellable background sync task.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hlc::{Clock, SystemClock, Timestamp};
use crate::id::{Id, NodeId};
use crate::merkle::MerkleTree;
use crate::message::{self, Message, Row, Storage};
use crate::owner::Owner;
use crate::query::{self, Query, QueryPatches, QueryRowsCache, QueryRunner};
use crate::sync_engine::{SyncEngine, Transport};
use crate::value::Value;
use crate::Result;

/// A completion callback fired (best-effort) after a mutation's patches have
/// been delivered. An instance disposed before the drain completes never
/// fires pending callbacks -- callers must treat this as best-effort.
pub type OnComplete = Box<dyn FnOnce() + Send>;

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Owns one replica's full lifecycle: identity, clock, storage, query cache,
/// and the sync engine for a single configured transport.
pub struct Evolu<T: Transport, Q: QueryRunner> {
    config: Config,
    owner: Owner,
    node_id: NodeId,
    clock: Clock,
    tree: MerkleTree,
    storage: Box<dyn Storage>,
    query_runner: Q,
    query_cache: QueryRowsCache,
    sync_engine: SyncEngine<T>,
    /// Messages stamped locally since the last successful sync round, queued
    /// for the next `transport.sync` call.
    pending: Vec<Message>,
    on_completes: Vec<OnComplete>,
}

impl<T: Transport, Q: QueryRunner> Evolu<T, Q> {
    /// Starts a fresh replica: generates a device-local `NodeId` and an
    /// initial zero clock, unless `config.initial_owner` is set.
    pub fn new(config: Config, mut storage: Box<dyn Storage>, query_runner: Q, transport: T) -> Result<Self> {
        let owner = config.initial_owner.clone().unwrap_or_else(Owner::create);
        let node_id = NodeId::random();
        let max_drift_ms = config.max_drift_ms;

        let (clock, tree) = match storage.read_clock() {
            Some((last, tree_json)) => (
                Clock::restore(last, Box::new(SystemClock), max_drift_ms),
                MerkleTree::from_json_string(&tree_json)?,
            ),
            None => (
                Clock::with_options(node_id, Box::new(SystemClock), max_drift_ms),
                MerkleTree::new(),
            ),
        };
        storage.write_clock(clock.last(), tree.to_json_string());

        Ok(Self {
            config,
            owner,
            node_id,
            clock,
            tree,
            storage,
            query_runner,
            query_cache: QueryRowsCache::new(),
            sync_engine: SyncEngine::new(transport),
            pending: Vec::new(),
            on_completes: Vec::new(),
        })
    }

    #[must_use]
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Assigns or reuses a row id, casts `values` to their storage
    /// representation, stamps one HLC timestamp per column, applies the
    /// resulting messages to local storage immediately (the write path's
    /// "apply locally" step -- mutations are durable as soon as this
    /// returns), and buffers them for the next sync round.
    ///
    /// `on_complete` fires once the following `drain` delivers patches for
    /// this mutation's subscribed queries; never fires if the instance is
    /// disposed first.
    pub fn mutate(
        &mut self,
        table: &str,
        row_id: Option<Id>,
        values: HashMap<String, Value>,
        on_complete: Option<OnComplete>,
    ) -> Result<Id> {
        let id = row_id.unwrap_or_default();
        let mut messages = Vec::with_capacity(values.len());
        for (column, value) in values {
            let ts = self.clock.send()?;
            messages.push(Message {
                timestamp: ts,
                table: table.to_string(),
                row: id.clone(),
                column,
                value,
            });
        }

        let now_millis = self.clock.now_millis();
        message::apply(&mut *self.storage, &mut self.tree, &messages, now_millis);
        self.storage.write_clock(self.clock.last(), self.tree.to_json_string());

        self.pending.extend(messages);
        if let Some(cb) = on_complete {
            self.on_completes.push(cb);
        }
        Ok(id)
    }

    /// Reads back a materialized row by id, for convenience in tests and
    /// embedders that have not wired up the SQL engine yet.
    #[must_use]
    pub fn get_row(&self, table: &str, row: &str) -> Option<Row> {
        self.storage.get_row(table, row)
    }

    /// The microtask-equivalent drain: runs every subscribed query, computes
    /// patches, and fires every `on_complete` queued by `mutate` since the
    /// last drain. Batches "one transaction, many queued mutations" rather
    /// than committing per-call.
    pub fn drain(&mut self, subscribed: &[Query]) -> Result<Vec<QueryPatches>> {
        let patches = query::load_queries(&mut self.query_cache, &self.query_runner, subscribed)?;
        for cb in self.on_completes.drain(..) {
            cb();
        }
        Ok(patches)
    }

    pub fn subscribe(&mut self, query: &Query) {
        self.query_cache.subscribe(query);
    }

    /// Returns `true` if the query is now unsubscribed and its cache entry
    /// was evicted.
    pub fn unsubscribe(&mut self, query: &Query) -> bool {
        self.query_cache.unsubscribe(query)
    }

    /// Runs one bounded sync session against the configured transport: sends
    /// `pending` messages, applies whatever comes back, and narrows
    /// divergence until the merkle trees agree or the round cap is hit.
    pub async fn sync_once(&mut self) -> Result<()> {
        let write_key_hex = Some(hex_encode(&self.owner.write_key));
        let now_millis = self.clock.now_millis();
        let result = self
            .sync_engine
            .sync(
                &mut *self.storage,
                &mut self.tree,
                &mut self.clock,
                self.node_id,
                self.owner.id.as_str().to_string(),
                write_key_hex,
                &self.owner.encryption_key,
                &mut self.pending,
                now_millis,
            )
            .await;
        self.storage.write_clock(self.clock.last(), self.tree.to_json_string());
        result
    }

    /// Drives `sync_once` on an interval until `token` is cancelled,
    /// matching the "sync loop as a task with explicit cancellation token"
    /// design note. Transport/network errors are logged and do not stop the
    /// loop; only cancellation does.
    pub async fn run_sync_loop(&mut self, token: CancellationToken, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!("sync loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        tracing::warn!(error = %err, "sync round failed, will retry next tick");
                    }
                }
            }
        }
    }
}
