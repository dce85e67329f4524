use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ViewError;
use crate::local_store::{ChangesSinceOptions, LocalStore, Revision};

/// User-defined map function: receives the document body and an `emit`
/// callback, matching spec.md §4.8's `map(body, emit)` contract. Native Rust
/// closures stand in for the JS functions a real CouchDB design document
/// would carry, since design-document storage itself is out of scope
/// (spec.md §1).
pub type MapFn = Arc<dyn Fn(&Value, &mut dyn FnMut(Value, Value)) + Send + Sync>;

/// User-defined reduce function: `reduce(keys, values, rereduce)`.
pub type ReduceFn = Arc<dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync>;

/// String-key comparison order (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collation {
    Unicode,
    Raw,
    ASCII,
}

/// A named, versioned map/reduce view.
#[derive(Clone)]
pub struct View {
    pub name: String,
    pub version: u32,
    pub map_fn: MapFn,
    pub reduce_fn: Option<ReduceFn>,
    pub collation: Collation,
}

#[derive(Clone)]
struct Row {
    doc_id: String,
    sequence: u64,
    key: Value,
    value: Value,
}

struct ViewState {
    view: View,
    last_sequence: u64,
    rows: Vec<Row>,
}

/// One row of a view query result. `doc_id` is `None` for reduced rows,
/// which represent a group rather than a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub key: Value,
    pub value: Value,
    pub doc_id: Option<String>,
}

/// Options accepted by [`ViewIndexer::query`] (spec.md §4.8 "Query").
#[derive(Default)]
pub struct QueryOptions {
    pub keys: Option<Vec<Value>>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    pub descending: bool,
    pub limit: Option<usize>,
    pub skip: usize,
    pub reduce: bool,
    /// `None` means a single ungrouped reduce over the whole result set;
    /// `Some(n)` groups rows via [`group_together`] with `n` as its depth.
    pub group_level: Option<usize>,
}

/// Maintains one or more map/reduce views over the revisions a
/// [`LocalStore`] exposes, following the five-step update protocol of
/// spec.md §4.8. Row storage lives in memory here — the durable schema for
/// it is explicitly out of scope (spec.md §1) — so a real embedding crate
/// would back `ViewState` with the same on-disk store `LocalStore` wraps.
pub struct ViewIndexer {
    local_store: Arc<dyn LocalStore>,
    views: Mutex<HashMap<String, ViewState>>,
}

impl ViewIndexer {
    pub fn new(local_store: Arc<dyn LocalStore>) -> Self {
        ViewIndexer {
            local_store,
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Registers or replaces a view. A version bump forces a full reindex
    /// from sequence 0, the same as CouchDB treats a changed design document.
    pub async fn register_view(&self, view: View) {
        let mut views = self.views.lock().await;
        let needs_reset = views
            .get(&view.name)
            .map(|existing| existing.view.version != view.version)
            .unwrap_or(true);

        if needs_reset {
            views.insert(
                view.name.clone(),
                ViewState {
                    view,
                    last_sequence: 0,
                    rows: Vec::new(),
                },
            );
        } else if let Some(state) = views.get_mut(&view.name) {
            state.view = view;
        }
    }

    /// Runs the update protocol for `view_name`. All fallible work happens
    /// before any mutation of the stored rows, so a failure partway through
    /// leaves the view exactly as it was at the last successful commit
    /// (spec.md §4.8 "Aborts roll back the transaction").
    pub async fn update(&self, view_name: &str) -> Result<(), ViewError> {
        let mut views = self.views.lock().await;
        let state = views
            .get_mut(view_name)
            .ok_or_else(|| ViewError::NotFound(view_name.to_string()))?;

        self.local_store.begin_transaction().await?;
        let result = self.update_locked(state).await;
        self.local_store
            .end_transaction(result.is_ok())
            .await?;
        result
    }

    /// Steps 1-5 of the update protocol, run inside the transaction
    /// [`update`](Self::update) opens around this call.
    async fn update_locked(&self, state: &mut ViewState) -> Result<(), ViewError> {
        let max_seq = self.local_store.last_sequence_number().await?;
        let l = state.last_sequence;
        if l == max_seq {
            return Ok(());
        }

        // Step 3: winners among everything touched since L.
        let touched = self
            .local_store
            .changes_since(l, ChangesSinceOptions { include_docs: true })
            .await?;

        let mut winners: HashMap<String, Revision> = HashMap::new();
        for rev in &touched {
            if rev.doc_id.starts_with("_design/") {
                continue;
            }
            let better = match winners.get(&rev.doc_id) {
                None => true,
                Some(existing) => {
                    (rev.generation(), rev.hash()) > (existing.generation(), existing.hash())
                }
            };
            if better {
                winners.insert(rev.doc_id.clone(), rev.clone());
            }
        }

        // Step 4: invoke map() for each non-deleted winner.
        let mut new_entries: Vec<Row> = Vec::new();
        for rev in winners.values() {
            if rev.deleted {
                continue;
            }
            let Some(body) = &rev.body else { continue };
            let mut emitted = Vec::new();
            (state.view.map_fn)(body, &mut |k, v| emitted.push((k, v)));
            for (key, value) in emitted {
                new_entries.push(Row {
                    doc_id: rev.doc_id.clone(),
                    sequence: rev.sequence,
                    key,
                    value,
                });
            }
        }

        // Step 2: rows for any doc touched since L are superseded (whether
        // it re-won, was deleted, or lost to a different winner) and must be
        // dropped before the fresh rows from step 4 are added.
        let touched_ids: HashSet<&str> = touched.iter().map(|r| r.doc_id.as_str()).collect();
        let mut rows = if l == 0 {
            Vec::new()
        } else {
            state
                .rows
                .iter()
                .filter(|row| !touched_ids.contains(row.doc_id.as_str()))
                .cloned()
                .collect()
        };
        rows.extend(new_entries);

        // Step 5: commit.
        state.rows = rows;
        state.last_sequence = max_seq;
        Ok(())
    }

    pub async fn query(&self, view_name: &str, opts: QueryOptions) -> Result<Vec<QueryRow>, ViewError> {
        let views = self.views.lock().await;
        let state = views
            .get(view_name)
            .ok_or_else(|| ViewError::NotFound(view_name.to_string()))?;
        let collation = state.view.collation;

        let mut rows: Vec<&Row> = state.rows.iter().collect();
        rows.sort_by(|a, b| compare_value(&a.key, &b.key, collation));
        if opts.descending {
            rows.reverse();
        }

        let filtered: Vec<&Row> = rows
            .into_iter()
            .filter(|row| row_matches(row, &opts, collation))
            .collect();

        let windowed: Vec<&Row> = filtered
            .into_iter()
            .skip(opts.skip)
            .take(opts.limit.unwrap_or(usize::MAX))
            .collect();

        if !opts.reduce {
            return Ok(windowed
                .into_iter()
                .map(|r| QueryRow {
                    key: r.key.clone(),
                    value: r.value.clone(),
                    doc_id: Some(r.doc_id.clone()),
                })
                .collect());
        }

        let reduce_fn = state
            .view
            .reduce_fn
            .clone()
            .ok_or_else(|| ViewError::NoReduceFunction(view_name.to_string()))?;

        match opts.group_level {
            None => {
                let keys: Vec<Value> = windowed.iter().map(|r| r.key.clone()).collect();
                let values: Vec<Value> = windowed.iter().map(|r| r.value.clone()).collect();
                let reduced = reduce_fn(&keys, &values, false);
                Ok(vec![QueryRow {
                    key: Value::Null,
                    value: reduced,
                    doc_id: None,
                }])
            }
            Some(level) => {
                let mut groups: Vec<(Value, Vec<Value>, Vec<Value>)> = Vec::new();
                for row in windowed {
                    let gk = group_key(&row.key, level);
                    if let Some(last) = groups.last_mut() {
                        if group_together(&last.0, &gk, level) {
                            last.1.push(row.key.clone());
                            last.2.push(row.value.clone());
                            continue;
                        }
                    }
                    groups.push((gk, vec![row.key.clone()], vec![row.value.clone()]));
                }
                Ok(groups
                    .into_iter()
                    .map(|(key, keys, values)| QueryRow {
                        value: reduce_fn(&keys, &values, false),
                        key,
                        doc_id: None,
                    })
                    .collect())
            }
        }
    }
}

fn row_matches(row: &Row, opts: &QueryOptions, collation: Collation) -> bool {
    if let Some(keys) = &opts.keys {
        return keys.iter().any(|k| compare_value(k, &row.key, collation) == Ordering::Equal);
    }
    if let Some(start) = &opts.start_key {
        let cmp = compare_value(&row.key, start, collation);
        let ok = if opts.descending { cmp != Ordering::Greater } else { cmp != Ordering::Less };
        if !ok {
            return false;
        }
    }
    if let Some(end) = &opts.end_key {
        let cmp = compare_value(&row.key, end, collation);
        let ok = if opts.inclusive_end {
            if opts.descending { cmp != Ordering::Less } else { cmp != Ordering::Greater }
        } else if opts.descending {
            cmp == Ordering::Greater
        } else {
            cmp == Ordering::Less
        };
        if !ok {
            return false;
        }
    }
    true
}

/// `groupTogether(k1, k2, n)` (spec.md §4.8): exact equality when `n == 0`
/// or either key isn't an array, otherwise structural equality over the
/// first `min(n, len(k1), len(k2))` elements.
fn group_together(k1: &Value, k2: &Value, n: usize) -> bool {
    if n == 0 {
        return k1 == k2;
    }
    match (k1, k2) {
        (Value::Array(a), Value::Array(b)) => {
            let len = n.min(a.len()).min(b.len());
            a[..len] == b[..len]
        }
        _ => k1 == k2,
    }
}

fn group_key(key: &Value, level: usize) -> Value {
    if level == 0 {
        return key.clone();
    }
    match key {
        Value::Array(arr) => Value::Array(arr.iter().take(level).cloned().collect()),
        other => other.clone(),
    }
}

/// CouchDB-style type ordering (null < bool < number < string < array <
/// object) with collation applied within strings.
///
/// [SUPPLEMENT-DECISION] `Unicode` and `ASCII` collation both fall back to
/// Rust's native byte-wise `str` ordering, same as `Raw`: true ICU-grade
/// Unicode collation needs a dedicated locale-aware crate that isn't part of
/// this pack's dependency set (see DESIGN.md). `Raw`/`ASCII` are exact for
/// this crate's purposes; `Unicode` is an approximation.
fn compare_value(a: &Value, b: &Value, collation: Collation) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => compare_strings(x, y, collation),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let c = compare_value(xi, yi, collation);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_strings(a: &str, b: &str, _collation: Collation) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::{AttachmentEncoding, InMemoryLocalStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    fn doc_rev(id: &str, rev: &str, body: Value) -> Revision {
        Revision {
            doc_id: id.to_string(),
            rev_id: rev.to_string(),
            sequence: 0,
            deleted: false,
            body: Some(body),
            attachments: Vec::new(),
        }
    }

    fn by_year_view() -> View {
        View {
            name: "by_year".to_string(),
            version: 1,
            map_fn: Arc::new(|doc, emit| {
                if let Some(year) = doc.get("year") {
                    emit(year.clone(), Value::Null);
                }
            }),
            reduce_fn: Some(Arc::new(|_keys, values, _rereduce| {
                Value::from(values.len())
            })),
            collation: Collation::Raw,
        }
    }

    #[tokio::test]
    async fn update_indexes_non_deleted_winners_and_skips_design_docs() {
        let store = Arc::new(InMemoryLocalStore::new());
        store.insert_for_test(doc_rev("a", "1-x", serde_json::json!({"year": 2001})));
        store.insert_for_test(doc_rev("b", "1-x", serde_json::json!({"year": 2002})));
        store.insert_for_test(doc_rev("_design/foo", "1-x", serde_json::json!({"views": {}})));

        let indexer = ViewIndexer::new(store);
        indexer.register_view(by_year_view()).await;
        indexer.update("by_year").await.unwrap();

        let rows = indexer
            .query("by_year", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, Value::from(2001));
        assert_eq!(rows[1].key, Value::from(2002));
    }

    #[tokio::test]
    async fn update_is_noop_when_already_caught_up() {
        let store = Arc::new(InMemoryLocalStore::new());
        store.insert_for_test(doc_rev("a", "1-x", serde_json::json!({"year": 2001})));
        let indexer = ViewIndexer::new(store);
        indexer.register_view(by_year_view()).await;
        indexer.update("by_year").await.unwrap();
        indexer.update("by_year").await.unwrap();

        let rows = indexer.query("by_year", QueryOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn reduce_without_group_level_yields_single_row() {
        let store = Arc::new(InMemoryLocalStore::new());
        store.insert_for_test(doc_rev("a", "1-x", serde_json::json!({"year": 2001})));
        store.insert_for_test(doc_rev("b", "1-x", serde_json::json!({"year": 2001})));
        let indexer = ViewIndexer::new(store);
        indexer.register_view(by_year_view()).await;
        indexer.update("by_year").await.unwrap();

        let rows = indexer
            .query(
                "by_year",
                QueryOptions {
                    reduce: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Value::from(2));
    }

    #[test]
    fn group_together_matches_spec_rules() {
        let k1 = Value::from(vec![1, 2, 3]);
        let k2 = Value::from(vec![1, 2, 9]);
        assert!(!group_together(&k1, &k2, 0));
        assert!(group_together(&k1, &k2, 2));
        assert!(!group_together(&k1, &k2, 3));
        assert!(group_together(&Value::from(1), &Value::from(1), 0));
    }

    struct FlakyLocalStore {
        inner: InMemoryLocalStore,
        fail_changes_since: AtomicBool,
    }

    #[async_trait]
    impl LocalStore for FlakyLocalStore {
        async fn last_sequence_number(&self) -> Result<u64, crate::error::LocalStoreError> {
            self.inner.last_sequence_number().await
        }
        async fn last_sequence_for(
            &self,
            checkpoint_id: &str,
        ) -> Result<Option<String>, crate::error::LocalStoreError> {
            self.inner.last_sequence_for(checkpoint_id).await
        }
        async fn set_last_sequence(
            &self,
            checkpoint_id: &str,
            seq: &str,
            is_push: bool,
        ) -> Result<(), crate::error::LocalStoreError> {
            self.inner.set_last_sequence(checkpoint_id, seq, is_push).await
        }
        async fn private_uuid(&self) -> Result<String, crate::error::LocalStoreError> {
            self.inner.private_uuid().await
        }
        async fn documents_with_ids(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, Vec<String>>, crate::error::LocalStoreError> {
            self.inner.documents_with_ids(ids).await
        }
        async fn revs_diff(
            &self,
            requested: &HashMap<String, Vec<String>>,
        ) -> Result<HashMap<String, Vec<String>>, crate::error::LocalStoreError> {
            self.inner.revs_diff(requested).await
        }
        async fn force_insert(
            &self,
            rev: Revision,
            history: Vec<String>,
        ) -> Result<(), crate::error::LocalStoreError> {
            self.inner.force_insert(rev, history).await
        }
        async fn changes_since(
            &self,
            since: u64,
            options: ChangesSinceOptions,
        ) -> Result<Vec<Revision>, crate::error::LocalStoreError> {
            if self.fail_changes_since.load(AtomicOrdering::SeqCst) {
                return Err(crate::error::LocalStoreError::Other("simulated failure".into()));
            }
            self.inner.changes_since(since, options).await
        }
        async fn add_active_replication(
            &self,
            session_id: &str,
        ) -> Result<(), crate::error::LocalStoreError> {
            self.inner.add_active_replication(session_id).await
        }
        async fn forget_replication(
            &self,
            session_id: &str,
        ) -> Result<(), crate::error::LocalStoreError> {
            self.inner.forget_replication(session_id).await
        }
        async fn is_closed(&self) -> bool {
            self.inner.is_closed().await
        }
        async fn begin_transaction(&self) -> Result<(), crate::error::LocalStoreError> {
            self.inner.begin_transaction().await
        }
        async fn end_transaction(&self, commit: bool) -> Result<(), crate::error::LocalStoreError> {
            self.inner.end_transaction(commit).await
        }
    }

    #[tokio::test]
    async fn aborted_update_leaves_previous_rows_unchanged() {
        let inner = InMemoryLocalStore::new();
        inner.insert_for_test(doc_rev("a", "1-x", serde_json::json!({"year": 2001})));
        let store = Arc::new(FlakyLocalStore {
            inner,
            fail_changes_since: AtomicBool::new(false),
        });

        let indexer = ViewIndexer::new(store.clone());
        indexer.register_view(by_year_view()).await;
        indexer.update("by_year").await.unwrap();
        let before = indexer.query("by_year", QueryOptions::default()).await.unwrap();

        store.inner.insert_for_test(doc_rev("b", "1-x", serde_json::json!({"year": 2002})));
        store.fail_changes_since.store(true, AtomicOrdering::SeqCst);
        let result = indexer.update("by_year").await;
        assert!(result.is_err());

        let after = indexer.query("by_year", QueryOptions::default()).await.unwrap();
        assert_eq!(before, after);
        let _ = AttachmentEncoding::None;
    }
}
