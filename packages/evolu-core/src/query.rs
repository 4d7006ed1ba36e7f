//! Reactive query cache: runs queries through an external `QueryRunner`,
//! diffs the result against what a tab last saw, and hands subscribers the
//! minimal patch rather than the full row set.
//!
//! Executing SQL is deliberately not this module's job -- the embedded SQL
//! engine is an external collaborator reached through [`QueryRunner`]. This
//! module owns only caching, diffing, and subscription bookkeeping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Row;
use crate::value::Value;
use crate::Result;

/// A serialized `(sql, parameters, options)` tuple. `key` is a stable cache
/// key derived from those three fields; the attached row shape is a
/// type-level concern left to the embedder, so this crate only ever moves
/// [`Row`]s (string-keyed maps of [`Value`]) around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    pub parameters_json: String,
    pub options_json: String,
}

impl Query {
    #[must_use]
    pub fn new(sql: impl Into<String>, parameters_json: impl Into<String>, options_json: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters_json: parameters_json.into(),
            options_json: options_json.into(),
        }
    }

    /// Stable string cache key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}\u{0}{}\u{0}{}", self.sql, self.parameters_json, self.options_json)
    }
}

/// Executes a [`Query`] against the embedded SQL engine. Implemented outside
/// this crate; an in-memory stub is provided in tests.
pub trait QueryRunner: Send + Sync {
    fn run(&self, query: &Query) -> Result<Vec<Row>>;
}

/// Minimal delta between two ordered row sets.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    ReplaceAll(Vec<Row>),
    ReplaceAt(usize, Row),
}

/// Per-query patches delivered to a tab's subscribers after a `load_queries`
/// pass.
#[derive(Debug, Clone)]
pub struct QueryPatches {
    pub query: Query,
    pub patches: Vec<Patch>,
}

fn rows_eq(a: &Row, b: &Row) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.cell_eq(bv)))
}

/// Computes the minimal patch set turning `prev` into `next`.
///
/// - No previous cache entry, or a length change: the whole set is replaced.
/// - Otherwise rows are compared index-by-index; differing rows become
///   `ReplaceAt(i, row)`. If every row differs, that degenerates to
///   `ReplaceAll` since there would be nothing smaller to send.
#[must_use]
pub fn make_patches(prev: Option<&[Row]>, next: &[Row]) -> Vec<Patch> {
    let Some(prev) = prev else {
        return vec![Patch::ReplaceAll(next.to_vec())];
    };
    if prev.len() != next.len() {
        return vec![Patch::ReplaceAll(next.to_vec())];
    }

    let mut replacements = Vec::new();
    for (i, (p, n)) in prev.iter().zip(next.iter()).enumerate() {
        if !rows_eq(p, n) {
            replacements.push((i, n.clone()));
        }
    }

    if !next.is_empty() && replacements.len() == next.len() {
        return vec![Patch::ReplaceAll(next.to_vec())];
    }

    replacements
        .into_iter()
        .map(|(i, row)| Patch::ReplaceAt(i, row))
        .collect()
}

/// Applies patches produced by [`make_patches`] to `prev`, reproducing
/// `next`. Used by property tests verifying the patch round-trip, and by
/// embedders that keep their own copy of a query's rows and only want to
/// apply deltas.
#[must_use]
pub fn apply_patches(patches: &[Patch], prev: &[Row]) -> Vec<Row> {
    match patches {
        [Patch::ReplaceAll(rows)] => rows.clone(),
        _ => {
            let mut out = prev.to_vec();
            for patch in patches {
                if let Patch::ReplaceAt(i, row) = patch {
                    if *i < out.len() {
                        out[*i] = row.clone();
                    }
                }
            }
            out
        }
    }
}

/// Tab-scoped cache mapping a query's string key to its last-seen row set.
#[derive(Default)]
pub struct QueryRowsCache {
    rows: HashMap<String, Vec<Row>>,
    /// Multiset of subscription counts; a query is eligible for eviction once
    /// its count drops to zero.
    subscriptions: HashMap<String, usize>,
}

impl QueryRowsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, query: &Query) {
        *self.subscriptions.entry(query.key()).or_insert(0) += 1;
    }

    /// Decrements the subscription count; returns `true` if the query is now
    /// eligible for eviction (and evicts its cached rows).
    pub fn unsubscribe(&mut self, query: &Query) -> bool {
        let key = query.key();
        let Some(count) = self.subscriptions.get_mut(&key) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.subscriptions.remove(&key);
            self.rows.remove(&key);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, query: &Query) -> bool {
        self.subscriptions.contains_key(&query.key())
    }
}

/// Runs every query in `queries` against `runner`, diffs it against the
/// cache, stores the new result, and returns the computed patches.
pub fn load_queries(
    cache: &mut QueryRowsCache,
    runner: &dyn QueryRunner,
    queries: &[Query],
) -> Result<Vec<QueryPatches>> {
    let mut out = Vec::with_capacity(queries.len());
    for query in queries {
        let next = runner.run(query)?;
        let key = query.key();
        let prev = cache.rows.get(&key).map(Vec::as_slice);
        let patches = make_patches(prev, &next);
        cache.rows.insert(key, next);
        out.push(QueryPatches {
            query: query.clone(),
            patches,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, value: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Text(id.to_string()));
        r.insert("title".to_string(), Value::Text(value.to_string()));
        r
    }

    struct StaticRunner(Vec<Row>);
    impl QueryRunner for StaticRunner {
        fn run(&self, _query: &Query) -> Result<Vec<Row>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn no_previous_cache_replaces_all() {
        let next = vec![row("a", "x")];
        let patches = make_patches(None, &next);
        assert_eq!(patches, vec![Patch::ReplaceAll(next)]);
    }

    #[test]
    fn length_change_replaces_all() {
        let prev = vec![row("a", "x")];
        let next = vec![row("a", "x"), row("b", "y")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(patches, vec![Patch::ReplaceAll(next)]);
    }

    #[test]
    fn single_differing_row_produces_replace_at() {
        let prev = vec![row("a", "x"), row("b", "y")];
        let next = vec![row("a", "x"), row("b", "z")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(patches, vec![Patch::ReplaceAt(1, row("b", "z"))]);
    }

    #[test]
    fn every_row_differing_degenerates_to_replace_all() {
        let prev = vec![row("a", "x"), row("b", "y")];
        let next = vec![row("a", "x2"), row("b", "y2")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(patches, vec![Patch::ReplaceAll(next)]);
    }

    #[test]
    fn unchanged_rows_produce_no_patches() {
        let prev = vec![row("a", "x")];
        let next = vec![row("a", "x")];
        let patches = make_patches(Some(&prev), &next);
        assert!(patches.is_empty());
    }

    #[test]
    fn apply_patches_round_trips_make_patches() {
        let prev = vec![row("a", "x"), row("b", "y"), row("c", "z")];
        let next = vec![row("a", "x"), row("b", "y2"), row("c", "z")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(apply_patches(&patches, &prev), next);
    }

    #[test]
    fn apply_patches_round_trips_replace_all() {
        let prev = vec![row("a", "x")];
        let next = vec![row("a", "x"), row("b", "y")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(apply_patches(&patches, &prev), next);
    }

    #[test]
    fn subscription_count_gates_eviction() {
        let mut cache = QueryRowsCache::new();
        let query = Query::new("select * from todos", "[]", "{}");
        cache.subscribe(&query);
        cache.subscribe(&query);
        assert!(!cache.unsubscribe(&query));
        assert!(cache.is_subscribed(&query));
        assert!(cache.unsubscribe(&query));
        assert!(!cache.is_subscribed(&query));
    }

    #[test]
    fn load_queries_caches_and_diffs_across_calls() {
        let mut cache = QueryRowsCache::new();
        let query = Query::new("select * from todos", "[]", "{}");
        let runner = StaticRunner(vec![row("a", "x")]);

        let first = load_queries(&mut cache, &runner, std::slice::from_ref(&query)).unwrap();
        assert_eq!(first[0].patches, vec![Patch::ReplaceAll(vec![row("a", "x")])]);

        let second = load_queries(&mut cache, &runner, std::slice::from_ref(&query)).unwrap();
        assert!(second[0].patches.is_empty());
    }

    use proptest::prelude::*;

    fn arb_row() -> impl Strategy<Value = Row> {
        ("[a-z]{1,6}", "[a-z]{1,6}").prop_map(|(id, title)| row(&id, &title))
    }

    proptest! {
        /// Property 9: applying the patches `make_patches` produces for any
        /// `(prev, next)` pair reproduces `next` exactly.
        #[test]
        fn make_patches_round_trips_for_arbitrary_row_sets(
            prev in proptest::collection::vec(arb_row(), 0..8),
            next in proptest::collection::vec(arb_row(), 0..8),
        ) {
            let patches = make_patches(Some(&prev), &next);
            prop_assert_eq!(apply_patches(&patches, &prev), next);
        }
    }
}
