use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LocalStoreError;

/// One immutable version of a document, identified by `N-hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub deleted: bool,
    pub body: Option<Value>,
    pub attachments: Vec<AttachmentRef>,
}

impl Revision {
    /// Generation `N` parsed out of `N-hash`.
    pub fn generation(&self) -> u64 {
        self.rev_id
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    /// The `hash` half of `N-hash`.
    pub fn hash(&self) -> &str {
        self.rev_id.splitn(2, '-').nth(1).unwrap_or("")
    }
}

/// How an attachment body is transport-encoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEncoding {
    None,
    Gzip,
}

/// A reference to an attachment body stored in the [`BlobStore`](crate::blob_store::BlobStore).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRef {
    pub name: String,
    pub content_type: String,
    pub length: u64,
    pub encoded_length: u64,
    pub encoding: AttachmentEncoding,
    pub revpos: u64,
    /// Hex-encoded SHA-1 of the raw content.
    pub blob_key: String,
}

impl AttachmentRef {
    /// Checks the invariants spec.md §3 requires of an `AttachmentRef`.
    pub fn is_valid(&self) -> bool {
        if self.revpos == 0 {
            return false;
        }
        match self.encoding {
            AttachmentEncoding::None => self.encoded_length == 0,
            AttachmentEncoding::Gzip => self.length == 0 || self.encoded_length > 0,
        }
    }
}

/// A single row from a remote `_changes` feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEntry {
    pub seq: String,
    pub doc_id: String,
    pub revs: Vec<String>,
    pub deleted: bool,
}

/// Options accepted by [`LocalStore::changes_since`].
#[derive(Debug, Clone, Default)]
pub struct ChangesSinceOptions {
    pub include_docs: bool,
}

/// The narrow interface the replication core and view indexer consume to
/// reach the on-disk relational schema, which is out of scope for this
/// crate (spec.md §1).
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// The current maximum sequence number in the database.
    async fn last_sequence_number(&self) -> Result<u64, LocalStoreError>;

    /// The cached replication checkpoint sequence for `checkpoint_id`, if any.
    async fn last_sequence_for(&self, checkpoint_id: &str) -> Result<Option<String>, LocalStoreError>;

    /// Persists the replication checkpoint sequence for `checkpoint_id`.
    async fn set_last_sequence(
        &self,
        checkpoint_id: &str,
        seq: &str,
        is_push: bool,
    ) -> Result<(), LocalStoreError>;

    /// A UUID stable for the lifetime of this local database.
    async fn private_uuid(&self) -> Result<String, LocalStoreError>;

    /// Revisions already known locally for the given document ids.
    async fn documents_with_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, LocalStoreError>;

    /// Given candidate revisions per document, returns those the local store
    /// does not yet have (mirrors `_revs_diff`).
    async fn revs_diff(
        &self,
        requested: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>, LocalStoreError>;

    /// Inserts a revision with an explicit history, without generating a new
    /// revision id (`new_edits: false` semantics).
    async fn force_insert(&self, rev: Revision, history: Vec<String>) -> Result<(), LocalStoreError>;

    /// All revisions with `sequence > since`, in ascending sequence order.
    async fn changes_since(
        &self,
        since: u64,
        options: ChangesSinceOptions,
    ) -> Result<Vec<Revision>, LocalStoreError>;

    /// Registers an active replication session against this database.
    async fn add_active_replication(&self, session_id: &str) -> Result<(), LocalStoreError>;

    /// Unregisters a previously-registered replication session.
    async fn forget_replication(&self, session_id: &str) -> Result<(), LocalStoreError>;

    /// Whether the local store has been closed and should refuse new work.
    async fn is_closed(&self) -> bool;

    /// Opens a store-level transaction. The view indexer wraps its entire
    /// update pass in exactly one (spec.md §4.8 step 1, §5), so a read taken
    /// mid-transaction never observes a write from a concurrent session.
    async fn begin_transaction(&self) -> Result<(), LocalStoreError>;

    /// Closes the transaction opened by [`begin_transaction`](LocalStore::begin_transaction).
    /// `commit: false` discards any writes made since the matching
    /// `begin_transaction`, mirroring an aborted update leaving prior rows
    /// untouched.
    async fn end_transaction(&self, commit: bool) -> Result<(), LocalStoreError>;
}

/// An in-memory [`LocalStore`] used by tests and as a reference
/// implementation; never the production persistence layer (spec.md §1
/// puts the on-disk schema out of scope).
#[derive(Default)]
pub struct InMemoryLocalStore {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    revisions: Vec<Revision>,
    checkpoints: HashMap<String, String>,
    active_replications: std::collections::HashSet<String>,
    uuid: Option<String>,
    closed: bool,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: appends a revision, assigning it the next sequence.
    pub fn insert_for_test(&self, mut rev: Revision) -> u64 {
        let mut state = self.state.lock().unwrap();
        let seq = state.revisions.len() as u64 + 1;
        rev.sequence = seq;
        state.revisions.push(rev);
        seq
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    /// Current revisions, for assertions in tests.
    pub fn all_revisions(&self) -> Vec<Revision> {
        self.state.lock().unwrap().revisions.clone()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn last_sequence_number(&self) -> Result<u64, LocalStoreError> {
        Ok(self.state.lock().unwrap().revisions.len() as u64)
    }

    async fn last_sequence_for(&self, checkpoint_id: &str) -> Result<Option<String>, LocalStoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(checkpoint_id)
            .cloned())
    }

    async fn set_last_sequence(
        &self,
        checkpoint_id: &str,
        seq: &str,
        _is_push: bool,
    ) -> Result<(), LocalStoreError> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert(checkpoint_id.to_string(), seq.to_string());
        Ok(())
    }

    async fn private_uuid(&self) -> Result<String, LocalStoreError> {
        let mut state = self.state.lock().unwrap();
        if state.uuid.is_none() {
            state.uuid = Some(uuid::Uuid::new_v4().to_string());
        }
        Ok(state.uuid.clone().unwrap())
    }

    async fn documents_with_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, LocalStoreError> {
        let state = self.state.lock().unwrap();
        let mut out = HashMap::new();
        for id in ids {
            let revs: Vec<String> = state
                .revisions
                .iter()
                .filter(|r| &r.doc_id == id)
                .map(|r| r.rev_id.clone())
                .collect();
            out.insert(id.clone(), revs);
        }
        Ok(out)
    }

    async fn revs_diff(
        &self,
        requested: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>, LocalStoreError> {
        let state = self.state.lock().unwrap();
        let mut out = HashMap::new();
        for (doc_id, revs) in requested {
            let known: Vec<&String> = state
                .revisions
                .iter()
                .filter(|r| &r.doc_id == doc_id)
                .map(|r| &r.rev_id)
                .collect();
            let missing: Vec<String> = revs
                .iter()
                .filter(|r| !known.contains(r))
                .cloned()
                .collect();
            if !missing.is_empty() {
                out.insert(doc_id.clone(), missing);
            }
        }
        Ok(out)
    }

    async fn force_insert(&self, rev: Revision, _history: Vec<String>) -> Result<(), LocalStoreError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(LocalStoreError::Closed);
        }
        let seq = state.revisions.len() as u64 + 1;
        let mut rev = rev;
        rev.sequence = seq;
        state.revisions.push(rev);
        Ok(())
    }

    async fn changes_since(
        &self,
        since: u64,
        _options: ChangesSinceOptions,
    ) -> Result<Vec<Revision>, LocalStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .revisions
            .iter()
            .filter(|r| r.sequence > since)
            .cloned()
            .collect())
    }

    async fn add_active_replication(&self, session_id: &str) -> Result<(), LocalStoreError> {
        self.state
            .lock()
            .unwrap()
            .active_replications
            .insert(session_id.to_string());
        Ok(())
    }

    async fn forget_replication(&self, session_id: &str) -> Result<(), LocalStoreError> {
        self.state
            .lock()
            .unwrap()
            .active_replications
            .remove(session_id);
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    async fn begin_transaction(&self) -> Result<(), LocalStoreError> {
        Ok(())
    }

    async fn end_transaction(&self, _commit: bool) -> Result<(), LocalStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_generation_and_hash_parse_rev_id() {
        let rev = Revision {
            doc_id: "a".into(),
            rev_id: "3-deadbeef".into(),
            sequence: 0,
            deleted: false,
            body: None,
            attachments: vec![],
        };
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.hash(), "deadbeef");
    }

    #[test]
    fn attachment_ref_invariants() {
        let none_ok = AttachmentRef {
            name: "a".into(),
            content_type: "text/plain".into(),
            length: 10,
            encoded_length: 0,
            encoding: AttachmentEncoding::None,
            revpos: 1,
            blob_key: "x".into(),
        };
        assert!(none_ok.is_valid());

        let none_bad = AttachmentRef {
            encoded_length: 5,
            ..none_ok.clone()
        };
        assert!(!none_bad.is_valid());

        let gzip_ok = AttachmentRef {
            encoding: AttachmentEncoding::Gzip,
            encoded_length: 4,
            ..none_ok.clone()
        };
        assert!(gzip_ok.is_valid());

        let gzip_bad = AttachmentRef {
            encoding: AttachmentEncoding::Gzip,
            encoded_length: 0,
            length: 10,
            ..none_ok.clone()
        };
        assert!(!gzip_bad.is_valid());

        let zero_revpos = AttachmentRef {
            revpos: 0,
            ..none_ok
        };
        assert!(!zero_revpos.is_valid());
    }

    #[tokio::test]
    async fn in_memory_store_tracks_sequence_and_revs_diff() {
        let store = InMemoryLocalStore::new();
        store.insert_for_test(Revision {
            doc_id: "a".into(),
            rev_id: "1-x".into(),
            sequence: 0,
            deleted: false,
            body: Some(serde_json::json!({"k": "v"})),
            attachments: vec![],
        });
        assert_eq!(store.last_sequence_number().await.unwrap(), 1);

        let mut req = HashMap::new();
        req.insert("a".to_string(), vec!["1-x".to_string(), "2-y".to_string()]);
        let missing = store.revs_diff(&req).await.unwrap();
        assert_eq!(missing.get("a").unwrap(), &vec!["2-y".to_string()]);
    }
}
