//! Push strategy: diffs local revisions against the remote via
//! `_revs_diff`, then uploads whatever's missing (spec.md §4.7 "Push
//! behaviour").

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::ReplicatorError;
use crate::local_store::{ChangesSinceOptions, Revision};

use super::{encode_path_segment, Progress, ReplicationContext};

/// Runs one push pass of every local revision with `sequence > start_seq`.
/// Returns the highest sequence the remote acknowledged, or `None` if there
/// was nothing new to send (spec.md §4.7 "Push behaviour").
pub(crate) async fn run(
    ctx: &ReplicationContext,
    start_seq: String,
    progress: &Arc<Progress>,
) -> Result<Option<String>, ReplicatorError> {
    let since: u64 = start_seq.parse().unwrap_or(0);
    let revisions = ctx
        .local_store
        .changes_since(since, ChangesSinceOptions { include_docs: true })
        .await?;

    if revisions.is_empty() {
        return Ok(None);
    }

    progress.enter();
    let result = push_revisions(ctx, since, revisions).await;
    progress.exit();
    result
}

async fn push_revisions(
    ctx: &ReplicationContext,
    since: u64,
    revisions: Vec<Revision>,
) -> Result<Option<String>, ReplicatorError> {
    let mut requested: HashMap<String, Vec<String>> = HashMap::new();
    for rev in &revisions {
        requested
            .entry(rev.doc_id.clone())
            .or_default()
            .push(rev.rev_id.clone());
    }

    let missing = remote_revs_diff(ctx, &requested).await?;

    let mut highest_ok = since;
    let mut plain_docs = Vec::new();

    for rev in revisions {
        let needs_upload = missing
            .get(&rev.doc_id)
            .map(|revs| revs.contains(&rev.rev_id))
            .unwrap_or(false);

        if !needs_upload {
            // Remote already has this revision; its upload is vacuously
            // acknowledged.
            highest_ok = highest_ok.max(rev.sequence);
            continue;
        }

        if rev.attachments.is_empty() {
            plain_docs.push(rev);
        } else {
            let seq = rev.sequence;
            match upload_with_attachments(ctx, &rev).await {
                Ok(()) => highest_ok = highest_ok.max(seq),
                Err(err) => {
                    tracing::warn!(seq, error = %err, "failed to push revision with attachments");
                    ctx.revisions_failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    if !plain_docs.is_empty() {
        let seqs: Vec<u64> = plain_docs.iter().map(|r| r.sequence).collect();
        let count = plain_docs.len();
        match bulk_docs_upload(ctx, &plain_docs).await {
            Ok(()) => {
                if let Some(max) = seqs.into_iter().max() {
                    highest_ok = highest_ok.max(max);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to push batch via _bulk_docs");
                ctx.revisions_failed.fetch_add(count, Ordering::SeqCst);
            }
        }
    }

    if highest_ok == since {
        Ok(None)
    } else {
        let seq = highest_ok.to_string();
        ctx.checkpoint.schedule_save(seq.clone()).await;
        Ok(Some(seq))
    }
}

async fn remote_revs_diff(
    ctx: &ReplicationContext,
    requested: &HashMap<String, Vec<String>>,
) -> Result<HashMap<String, Vec<String>>, ReplicatorError> {
    let url = format!("{}/_revs_diff", ctx.config.remote_url);
    let response = ctx.transport.post_json(&url, &serde_json::to_value(requested)?).await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ReplicatorError::GenericCouchdbError(Value::String(format!(
            "_revs_diff failed with status {status}: {body}"
        ))));
    }

    let body: Value = response.json().await?;
    let mut out = HashMap::new();
    if let Value::Object(map) = body {
        for (doc_id, entry) in map {
            let missing: Vec<String> = entry
                .get("missing")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            if !missing.is_empty() {
                out.insert(doc_id, missing);
            }
        }
    }
    Ok(out)
}

async fn bulk_docs_upload(ctx: &ReplicationContext, revisions: &[Revision]) -> Result<(), ReplicatorError> {
    let _permit = ctx.semaphore.acquire().await.expect("semaphore closed");

    let docs: Vec<Value> = revisions
        .iter()
        .map(|rev| {
            let mut doc = rev.body.clone().unwrap_or_else(|| serde_json::json!({}));
            if let Value::Object(map) = &mut doc {
                map.insert("_id".to_string(), Value::String(rev.doc_id.clone()));
                map.insert("_rev".to_string(), Value::String(rev.rev_id.clone()));
                if rev.deleted {
                    map.insert("_deleted".to_string(), Value::Bool(true));
                }
            }
            doc
        })
        .collect();

    let body = serde_json::json!({ "new_edits": false, "docs": docs });
    let url = format!("{}/_bulk_docs", ctx.config.remote_url);
    let response = ctx.transport.post_json(&url, &body).await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        return Err(ReplicatorError::GenericCouchdbError(Value::String(format!(
            "_bulk_docs failed with status {status}: {text}"
        ))));
    }
    Ok(())
}

/// Uploads a document carrying attachments as `multipart/related`, with the
/// JSON document as the first part and each attachment's raw bytes,
/// read back from the blob store, as subsequent parts (spec.md §4.5, §4.7).
async fn upload_with_attachments(ctx: &ReplicationContext, rev: &Revision) -> Result<(), ReplicatorError> {
    let _permit = ctx.semaphore.acquire().await.expect("semaphore closed");

    let mut doc = rev.body.clone().unwrap_or_else(|| serde_json::json!({}));
    if let Value::Object(map) = &mut doc {
        map.insert("_id".to_string(), Value::String(rev.doc_id.clone()));
        map.insert("_rev".to_string(), Value::String(rev.rev_id.clone()));
    }
    let doc_bytes = serde_json::to_vec(&doc)?;

    let mut form = Form::new().part(
        "document",
        Part::bytes(doc_bytes).mime_str("application/json").expect("valid mime"),
    );

    for att in &rev.attachments {
        let key = crate::blob_store::BlobKey::from_hex(&att.blob_key).ok_or_else(|| {
            ReplicatorError::GenericCouchdbError(Value::String(format!(
                "malformed blob key for attachment {}",
                att.name
            )))
        })?;
        let bytes = ctx.blob_store.open_blob(&key).await?;
        form = form.part(
            att.name.clone(),
            Part::bytes(bytes)
                .mime_str(&att.content_type)
                .unwrap_or_else(|_| Part::bytes(Vec::new())),
        );
    }

    let boundary = form.boundary().to_string();
    let url = format!(
        "{}/{}",
        ctx.config.remote_url,
        encode_path_segment(&rev.doc_id)
    );

    let response = ctx
        .transport
        .client()
        .put(&url)
        .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
        .multipart(form)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        return Err(ReplicatorError::GenericCouchdbError(Value::String(format!(
            "attachment upload for {} failed with status {status}: {text}",
            rev.doc_id
        ))));
    }
    Ok(())
}
