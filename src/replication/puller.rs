//! Pull strategy: consumes a remote `_changes` feed, fetches whatever the
//! local store doesn't already have, and stores it (spec.md §4.7 "Pull
//! behaviour").

use std::sync::atomic::Ordering;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::change_feed::{ChangeFeed, ChangesFeedParams, FeedMode};
use crate::error::ReplicatorError;
use crate::local_store::Revision;
use crate::multipart::MultipartDocReader;

use super::{encode_path_segment, Progress, ReplicationContext};

/// One revision the feed reported that the local store doesn't have yet.
#[derive(Debug, Clone)]
struct PullItem {
    doc_id: String,
    rev_id: String,
    seq: String,
}

/// Runs one one-shot pull pass starting at `start_seq`. Returns the highest
/// sequence whose body was durably stored, or `None` if nothing new arrived
/// — never past a revision this pass never heard back on (spec.md §4.7,
/// §5's monotonic-`lastSequence` guarantee).
///
/// [SUPPLEMENT-DECISION] CouchDB change-feed sequences aren't always totally
/// ordered (vector-clock seqs on clustered deployments), but feed delivery
/// order is always the intended progress order. This pull tracks "highest
/// durable sequence" as "the sequence of the most recently *dispatched*
/// inbox batch that stored successfully", trusting feed order rather than
/// comparing sequence values — see DESIGN.md.
pub(crate) async fn run(
    ctx: &ReplicationContext,
    start_seq: String,
    progress: &Arc<Progress>,
) -> Result<Option<String>, ReplicatorError> {
    let change_feed = ChangeFeed::new(ctx.transport.clone(), ctx.config.remote_url.clone());
    let params = ChangesFeedParams::new()
        .since(start_seq)
        .doc_ids(ctx.config.doc_ids.clone());

    let durable_seq: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let ctx_for_batches = ctx.clone();
    let progress_for_batches = progress.clone();
    let durable_seq_for_batches = durable_seq.clone();

    let processor = move |batch: Vec<PullItem>| {
        let ctx = ctx_for_batches.clone();
        let progress = progress_for_batches.clone();
        let durable_seq = durable_seq_for_batches.clone();
        async move {
            progress.enter();
            if let Some(seq) = process_batch(&ctx, batch).await {
                *durable_seq.lock().await = Some(seq.clone());
                ctx.checkpoint.schedule_save(seq).await;
            }
            progress.exit();
        }
    };
    let batcher = crate::batcher::Batcher::new(
        ctx.config.inbox_capacity,
        ctx.config.inbox_delay,
        Arc::new(processor),
    );

    let ctx_for_feed = ctx.clone();
    let batcher_for_feed = batcher.clone();
    let feed_result = change_feed
        .run(FeedMode::Normal, &params, move |entry| {
            let ctx = ctx_for_feed.clone();
            let batcher = batcher_for_feed.clone();
            async move {
                let known = ctx
                    .local_store
                    .documents_with_ids(std::slice::from_ref(&entry.doc_id))
                    .await
                    .unwrap_or_default();
                let known_revs = known.get(&entry.doc_id).cloned().unwrap_or_default();

                for rev in &entry.revs {
                    if !known_revs.contains(rev) {
                        batcher
                            .queue(PullItem {
                                doc_id: entry.doc_id.clone(),
                                rev_id: rev.clone(),
                                seq: entry.seq.clone(),
                            })
                            .await;
                    }
                }
                true
            }
        })
        .await;

    feed_result.map_err(ReplicatorError::ChangeFeed)?;

    // The feed only returns once its response body is fully consumed, so
    // every record has already been queued; flush dispatches whatever
    // didn't hit the capacity/delay trigger on its own, and gives one-shot
    // `normal` mode a clean drain point before it's considered done.
    batcher.flush().await;

    Ok(durable_seq.lock().await.clone())
}

/// Fetches and stores every item in one dispatched batch with bounded
/// concurrency, returning the highest sequence for which every preceding
/// item in feed order also stored successfully (or `None` if the very first
/// item failed). A later item's success never pulls `lastSequence` past an
/// earlier failure still unresolved in this batch (spec.md §4.7).
async fn process_batch(ctx: &ReplicationContext, batch: Vec<PullItem>) -> Option<String> {
    if batch.is_empty() {
        return None;
    }

    let mut handles = Vec::with_capacity(batch.len());
    for item in batch {
        let ctx = ctx.clone();
        let semaphore = ctx.semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            fetch_and_store(&ctx, item).await
        }));
    }

    // `handles` preserves the original batch/feed order; awaiting each in
    // turn yields outcomes in that same order regardless of which task
    // actually finished first.
    let mut highest_ok: Option<String> = None;
    let mut contiguous = true;
    for handle in handles {
        match handle.await {
            Ok(Ok(seq)) => {
                if contiguous {
                    highest_ok = Some(seq);
                }
            }
            Ok(Err((seq, err))) => {
                tracing::warn!(seq, error = %err, "failed to pull revision");
                ctx.revisions_failed.fetch_add(1, Ordering::SeqCst);
                contiguous = false;
            }
            Err(join_err) => {
                tracing::warn!(error = %join_err, "pull task panicked");
                ctx.revisions_failed.fetch_add(1, Ordering::SeqCst);
                contiguous = false;
            }
        }
    }
    highest_ok
}

async fn fetch_and_store(
    ctx: &ReplicationContext,
    item: PullItem,
) -> Result<String, (String, ReplicatorError)> {
    let url = format!(
        "{}/{}?rev={}&attachments=true&revs=true",
        ctx.config.remote_url,
        encode_path_segment(&item.doc_id),
        encode_path_segment(&item.rev_id),
    );

    let response = ctx
        .transport
        .client()
        .get(&url)
        .header("Accept", "multipart/related, application/json")
        .send()
        .await
        .map_err(|e| (item.seq.clone(), ReplicatorError::InvalidUrlOrPort(e)))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err((
            item.seq.clone(),
            ReplicatorError::GenericCouchdbError(Value::String(format!(
                "status {status}: {body}"
            ))),
        ));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let doc: Value = if content_type.starts_with("multipart/related") {
        let stream = response.bytes_stream();
        let reader = MultipartDocReader::new(&ctx.blob_store, &content_type, stream)
            .map_err(|e| (item.seq.clone(), ReplicatorError::Multipart(e)))?;
        reader
            .finish()
            .await
            .map_err(|e| (item.seq.clone(), ReplicatorError::Multipart(e)))?
    } else {
        response
            .json()
            .await
            .map_err(|e| (item.seq.clone(), ReplicatorError::InvalidUrlOrPort(e)))?
    };

    let deleted = doc
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let revision = Revision {
        doc_id: item.doc_id.clone(),
        rev_id: item.rev_id.clone(),
        sequence: 0,
        deleted,
        body: Some(doc),
        attachments: Vec::new(),
    };

    // `_revisions` carries the full ancestor chain; this crate's `LocalStore`
    // only needs it to satisfy `new_edits: false`-style inserts, so a
    // single-entry history (just this revision) is sufficient for the
    // revision tree shape `force_insert` is expected to build incrementally
    // as later revisions of the same document arrive.
    ctx.local_store
        .force_insert(revision, vec![item.rev_id.clone()])
        .await
        .map_err(|e| (item.seq.clone(), ReplicatorError::LocalStore(e)))?;

    Ok(item.seq)
}
