use std::sync::Arc;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::error::CheckpointError;
use crate::transport::HttpTransport;

/// Identifies a checkpoint document: `_local/<hex sha1 of "localUUID\nremoteURL\npush?1:0">`
/// (spec.md §4.6). Stable for a given local/remote pair and direction so either
/// side of a replication can resume from the last durably-recorded sequence.
pub fn checkpoint_id(local_uuid: &str, remote_url: &str, push: bool) -> String {
    let material = format!("{}\n{}\n{}", local_uuid, remote_url, if push { '1' } else { '0' });
    let digest = Sha1::digest(material.as_bytes());
    hex::encode(digest)
}

/// The last durably-recorded replication sequence and the revision of the
/// checkpoint document that recorded it.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    pub last_sequence: Option<String>,
    pub rev: Option<String>,
}

struct Inner {
    rev: Option<String>,
    last_sequence: Option<String>,
    /// The full body last fetched from (or successfully PUT to) the remote
    /// checkpoint document, unknown fields and all. `saveLastSequence()`
    /// composes `{...remoteCheckpoint, lastSequence}` (spec.md §4.7) rather
    /// than reconstructing the body from scratch, so anything a foreign
    /// replicator stashed on the doc survives our writes.
    remote_body: Map<String, Value>,
    saving: bool,
    overdue: bool,
    timer_pending: bool,
}

/// A debounced `_local/<id>` checkpoint: at most one PUT in flight at a time.
/// A [`save`](Checkpoint::save) requested while one is already outstanding
/// sets an `overdue` flag and is folded into the next round rather than
/// queued as a second request (spec.md §4.6, §5). [`schedule_save`](Checkpoint::schedule_save)
/// layers a second, time-based debounce on top: `lastSequence` is marked
/// dirty immediately but the PUT itself waits out a single outstanding
/// `CHECKPOINT_SAVE_DELAY` timer, so a burst of advancing sequences during
/// one pass collapses into one remote write (spec.md §4.7).
pub struct Checkpoint {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    id: String,
    inner: Mutex<Inner>,
}

impl Checkpoint {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Checkpoint {
            transport,
            base_url: base_url.into(),
            id: id.into(),
            inner: Mutex::new(Inner {
                rev: None,
                last_sequence: None,
                remote_body: Map::new(),
                saving: false,
                overdue: false,
                timer_pending: false,
            }),
        }
    }

    fn doc_url(&self) -> String {
        format!("{}/_local/{}", self.base_url, self.id)
    }

    /// GETs the checkpoint document. A 404 is not an error: it means
    /// replication has never recorded progress against this remote before,
    /// and fetch returns `Ok(None)`.
    pub async fn fetch(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        let response = self.transport.get(&self.doc_url()).await?;
        let status = response.status();

        if status.as_u16() == 404 {
            let mut inner = self.inner.lock().await;
            inner.rev = None;
            inner.last_sequence = None;
            inner.remote_body = Map::new();
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckpointError::Unexpected(status.as_u16(), body));
        }

        let body: Value = response.json().await?;
        let rev = body.get("_rev").and_then(Value::as_str).map(String::from);
        let last_sequence = body
            .get("last_sequence")
            .and_then(Value::as_str)
            .map(String::from);
        let remote_body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut inner = self.inner.lock().await;
        inner.rev = rev.clone();
        inner.last_sequence = last_sequence.clone();
        inner.remote_body = remote_body;

        Ok(Some(CheckpointState { last_sequence, rev }))
    }

    /// Marks `last_sequence` dirty and, if no save is already scheduled,
    /// arms a single `CHECKPOINT_SAVE_DELAY` timer that performs the actual
    /// [`save`](Checkpoint::save) once it elapses. Returns immediately —
    /// callers that need to know the PUT actually landed should call
    /// [`save`] directly instead (e.g. the authoritative save at pass end).
    pub async fn schedule_save(self: &Arc<Self>, last_sequence: impl Into<String>) {
        let last_sequence = last_sequence.into();
        {
            let mut inner = self.inner.lock().await;
            inner.last_sequence = Some(last_sequence);
            if inner.timer_pending {
                return;
            }
            inner.timer_pending = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(crate::config::CHECKPOINT_SAVE_DELAY).await;
            let seq = {
                let mut inner = this.inner.lock().await;
                inner.timer_pending = false;
                inner.last_sequence.clone()
            };
            if let Some(seq) = seq {
                if let Err(err) = this.save(seq).await {
                    tracing::warn!(error = %err, "debounced checkpoint save failed");
                }
            }
        });
    }

    /// Records `last_sequence` as durably replicated. If a save is already
    /// in flight, this call marks the checkpoint `overdue` and returns
    /// immediately; the in-flight save's completion will trigger a follow-up
    /// save carrying the newest `last_sequence` instead of queuing one PUT
    /// per call (spec.md §5's checkpoint-debouncing invariant).
    pub async fn save(&self, last_sequence: impl Into<String>) -> Result<(), CheckpointError> {
        let last_sequence = last_sequence.into();
        {
            let mut inner = self.inner.lock().await;
            inner.last_sequence = Some(last_sequence);
            if inner.saving {
                inner.overdue = true;
                return Ok(());
            }
            inner.saving = true;
        }

        loop {
            let (seq, rev) = {
                let inner = self.inner.lock().await;
                (inner.last_sequence.clone(), inner.rev.clone())
            };
            let Some(seq) = seq else {
                let mut inner = self.inner.lock().await;
                inner.saving = false;
                return Ok(());
            };

            let result = self.put_once(&seq, rev.as_deref()).await;

            let retry = match result {
                Ok(new_rev) => {
                    let mut inner = self.inner.lock().await;
                    inner.rev = Some(new_rev);
                    false
                }
                Err(CheckpointError::Deleted) => {
                    // Someone deleted our checkpoint doc; drop the stale rev
                    // and resave unconditionally on the next pass.
                    let mut inner = self.inner.lock().await;
                    inner.rev = None;
                    true
                }
                Err(CheckpointError::Conflict) => {
                    self.refresh_rev().await?;
                    true
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.saving = false;
                    return Err(e);
                }
            };

            let mut inner = self.inner.lock().await;
            if retry || inner.overdue {
                inner.overdue = false;
                continue;
            }
            inner.saving = false;
            return Ok(());
        }
    }

    async fn put_once(&self, last_sequence: &str, rev: Option<&str>) -> Result<String, CheckpointError> {
        // Compose `{...remoteCheckpoint, lastSequence}` (spec.md §4.7):
        // clone whatever the remote last returned rather than rebuilding
        // the body from scratch, so unknown fields round-trip.
        let mut body = self.inner.lock().await.remote_body.clone();
        body.insert(
            "last_sequence".to_string(),
            Value::String(last_sequence.to_string()),
        );
        match rev {
            Some(rev) => {
                body.insert("_rev".to_string(), Value::String(rev.to_string()));
            }
            None => {
                body.remove("_rev");
            }
        }
        let body = Value::Object(body);

        let response = self.transport.put_json(&self.doc_url(), &body).await?;
        let status = response.status();

        match status.as_u16() {
            200 | 201 => {
                let resp_body: Value = response.json().await?;
                let rev = resp_body
                    .get("rev")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| {
                        CheckpointError::Unexpected(status.as_u16(), "missing rev in response".into())
                    })?;
                if let Value::Object(mut map) = body {
                    map.insert("_rev".to_string(), Value::String(rev.clone()));
                    self.inner.lock().await.remote_body = map;
                }
                Ok(rev)
            }
            404 => Err(CheckpointError::Deleted),
            409 => Err(CheckpointError::Conflict),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(CheckpointError::Unexpected(status.as_u16(), body))
            }
        }
    }

    /// Refetches just the current `_rev` after a 409, so the next save
    /// attempt carries the remote's latest revision rather than retrying
    /// with the stale one that caused the conflict.
    async fn refresh_rev(&self) -> Result<(), CheckpointError> {
        let response = self.transport.get(&self.doc_url()).await?;
        let status = response.status();

        if status.as_u16() == 404 {
            let mut inner = self.inner.lock().await;
            inner.rev = None;
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckpointError::Unexpected(status.as_u16(), body));
        }

        let body: Value = response.json().await?;
        let rev = body.get("_rev").and_then(Value::as_str).map(String::from);
        let remote_body = match &body {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut inner = self.inner.lock().await;
        inner.rev = rev;
        inner.remote_body = remote_body;
        Ok(())
    }

    pub async fn current_sequence(&self) -> Option<String> {
        self.inner.lock().await.last_sequence.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> Arc<dyn HttpTransport> {
        Arc::new(crate::transport::ReqwestTransport::new())
    }

    #[test]
    fn checkpoint_id_is_stable_for_same_inputs() {
        let a = checkpoint_id("uuid-1", "http://remote/db", true);
        let b = checkpoint_id("uuid-1", "http://remote/db", true);
        assert_eq!(a, b);
    }

    #[test]
    fn checkpoint_id_differs_by_direction() {
        let push = checkpoint_id("uuid-1", "http://remote/db", true);
        let pull = checkpoint_id("uuid-1", "http://remote/db", false);
        assert_ne!(push, pull);
    }

    #[tokio::test]
    async fn fetch_returns_none_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_local/abc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cp = Checkpoint::new(transport(), server.uri(), "abc");
        let result = cp.fetch().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn fetch_parses_existing_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_local/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_id": "_local/abc",
                "_rev": "0-1",
                "last_sequence": "42",
            })))
            .mount(&server)
            .await;

        let cp = Checkpoint::new(transport(), server.uri(), "abc");
        let result = cp.fetch().await.unwrap().unwrap();
        assert_eq!(result.last_sequence.as_deref(), Some("42"));
        assert_eq!(result.rev.as_deref(), Some("0-1"));
    }

    #[tokio::test]
    async fn save_puts_and_records_new_rev() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_local/abc"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "ok": true,
                "id": "_local/abc",
                "rev": "0-1",
            })))
            .mount(&server)
            .await;

        let cp = Checkpoint::new(transport(), server.uri(), "abc");
        cp.save("7").await.unwrap();
        assert_eq!(cp.current_sequence().await.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn save_drops_rev_on_404_and_retries_without_it() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_local/abc"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_local/abc"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "ok": true,
                "rev": "0-1",
            })))
            .mount(&server)
            .await;

        let cp = Checkpoint::new(transport(), server.uri(), "abc");
        cp.save("9").await.unwrap();
        assert_eq!(cp.current_sequence().await.as_deref(), Some("9"));
    }
}
