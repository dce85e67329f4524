use std::sync::Arc;
use std::time::Duration;

use bevy_reflect::Reflect;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ChangeFeedError;
use crate::local_store::ChangeEntry;
use crate::transport::HttpTransport;
use crate::ParseQueryParams;

type Transport = Arc<dyn HttpTransport>;

/// `feed` mode. `continuous` exists in the wire protocol but is explicitly
/// unsupported here (spec.md §4.4, §9 Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Normal,
    LongPoll,
}

impl FeedMode {
    fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::LongPoll => "longpoll",
        }
    }
}

/// Parameters for the `_changes` request, matching the teacher's
/// consuming-builder `*RequestParams` style.
#[derive(Debug, Clone, Reflect)]
pub struct ChangesFeedParams {
    since: String,
    heartbeat: i64,
    style_all_docs: bool,
    filter: String,
    doc_ids: Vec<String>,
}

impl Default for ChangesFeedParams {
    fn default() -> Self {
        ChangesFeedParams {
            since: "0".to_string(),
            heartbeat: 300_000,
            style_all_docs: false,
            filter: String::new(),
            doc_ids: Vec::new(),
        }
    }
}

impl ChangesFeedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = since.into();
        self
    }

    pub fn style_all_docs(mut self, enable: bool) -> Self {
        self.style_all_docs = enable;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Empty `doc_ids` skips the `filter=_doc_ids` parameter entirely
    /// (spec.md §9 Open Question — the recommended reading).
    pub fn doc_ids(mut self, ids: Vec<String>) -> Self {
        self.doc_ids = ids;
        self
    }

    fn query_string(&self, mode: FeedMode) -> String {
        let mut qs = format!("feed={}&heartbeat={}", mode.as_str(), self.heartbeat);
        if self.style_all_docs {
            qs.push_str("&style=all_docs");
        }
        if self.since != "0" {
            qs.push_str(&format!("&since={}", urlencode(&self.since)));
        }
        if !self.doc_ids.is_empty() {
            qs.push_str("&filter=_doc_ids");
            qs.push_str(&format!(
                "&doc_ids={}",
                urlencode(&serde_json::to_string(&self.doc_ids).unwrap_or_default())
            ));
        } else if !self.filter.is_empty() {
            qs.push_str(&format!("&filter={}", urlencode(&self.filter)));
        }
        qs
    }
}

impl ParseQueryParams for ChangesFeedParams {}

#[derive(Debug, Serialize, Deserialize)]
struct WireChangeEntry {
    seq: Value,
    id: String,
    changes: Vec<WireRevId>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRevId {
    rev: String,
}

fn seq_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<WireChangeEntry> for ChangeEntry {
    fn from(w: WireChangeEntry) -> Self {
        ChangeEntry {
            seq: seq_to_string(&w.seq),
            doc_id: w.id,
            revs: w.changes.into_iter().map(|c| c.rev).collect(),
            deleted: w.deleted,
        }
    }
}

/// Feed state machine (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Requesting,
    Streaming,
    Stopped,
    Error,
}

/// Consumes a remote `_changes` feed, one-shot or long-poll, emitting change
/// records as they're parsed off the wire rather than after buffering the
/// whole response body (spec.md §9's streaming-parser redesign flag).
pub struct ChangeFeed {
    transport: Transport,
    base_url: String,
    running: Arc<Mutex<bool>>,
}

impl ChangeFeed {
    pub fn new(transport: Transport, base_url: impl Into<String>) -> Self {
        ChangeFeed {
            transport,
            base_url: base_url.into(),
            running: Arc::new(Mutex::new(true)),
        }
    }

    /// Aborts the feed. A cooperative IOException surfacing during teardown
    /// after this call is swallowed by [`run`](Self::run), not surfaced.
    pub async fn stop(&self) {
        *self.running.lock().await = false;
    }

    async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Runs one pass over the feed starting at `params.since`, invoking
    /// `on_change` for each record in feed order and updating its own
    /// notion of `last_sequence_id` only after `on_change` returns `Ok`
    /// (mirroring `changeTrackerReceivedChange` acceptance semantics).
    ///
    /// Returns the last accepted sequence once the feed naturally ends
    /// (one-shot `normal` mode) or when `stop()` is observed (`longpoll`).
    pub async fn run<F, Fut>(
        &self,
        mode: FeedMode,
        params: &ChangesFeedParams,
        mut on_change: F,
    ) -> Result<String, ChangeFeedError>
    where
        F: FnMut(ChangeEntry) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut last_sequence_id = params.since.clone();
        let mut current_params = params.clone();

        loop {
            if !self.is_running().await {
                return Ok(last_sequence_id);
            }

            let url = format!(
                "{}/_changes?{}",
                self.base_url,
                current_params.query_string(mode)
            );

            let response = match self.transport.client().get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    if !self.is_running().await {
                        return Ok(last_sequence_id);
                    }
                    return Err(ChangeFeedError::Transport(e));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(ChangeFeedError::RemoteError(status, body));
            }

            let mut stream = response.bytes_stream();
            let mut scanner = RecordScanner::new();

            while let Some(chunk) = stream.next().await {
                if !self.is_running().await {
                    return Ok(last_sequence_id);
                }
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        if !self.is_running().await {
                            return Ok(last_sequence_id);
                        }
                        return Err(ChangeFeedError::Transport(e));
                    }
                };
                scanner.feed(&chunk);

                while let Some(record_bytes) = scanner.next_record() {
                    let wire: WireChangeEntry = serde_json::from_slice(&record_bytes)?;
                    let entry: ChangeEntry = wire.into();
                    let entry_seq = entry.seq.clone();
                    let accepted = on_change(entry).await;
                    if accepted {
                        last_sequence_id = entry_seq;
                    }
                }
                // Drains the trailing `last_seq` field from the buffer once
                // seen; the feed's own bookkeeping of what to resume from is
                // driven by per-record acceptance above, not this footer.
                scanner.take_last_seq();
            }

            match mode {
                FeedMode::Normal => return Ok(last_sequence_id),
                FeedMode::LongPoll => {
                    current_params = current_params.since(last_sequence_id.clone());
                    continue;
                }
            }
        }
    }
}

/// Incrementally scans a byte stream for `"results":[ ... ]` array elements
/// and a trailing `"last_seq":...` field, without requiring the whole body
/// to be buffered: at most one partially-received JSON object is held at a
/// time (spec.md §9 streaming-parser redesign flag, §4.4 normal-mode
/// contract).
struct RecordScanner {
    buf: Vec<u8>,
    in_results_array: bool,
}

impl RecordScanner {
    fn new() -> Self {
        RecordScanner {
            buf: Vec::new(),
            in_results_array: false,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if !self.in_results_array {
            if let Some(pos) = find_subslice(&self.buf, b"\"results\"") {
                if let Some(bracket) = self.buf[pos..].iter().position(|&b| b == b'[') {
                    let found_results_at = pos + bracket + 1;
                    self.in_results_array = true;
                    self.buf.drain(..found_results_at);
                }
            }
        }
    }

    /// Returns the next complete top-level JSON value in the results array,
    /// if one is fully buffered.
    fn next_record(&mut self) -> Option<Vec<u8>> {
        if !self.in_results_array {
            return None;
        }
        // skip leading whitespace/commas
        let mut start = 0;
        while start < self.buf.len()
            && matches!(self.buf[start], b' ' | b'\n' | b'\r' | b'\t' | b',')
        {
            start += 1;
        }
        if start >= self.buf.len() || self.buf[start] == b']' {
            self.buf.drain(..start);
            return None;
        }
        if self.buf[start] != b'{' {
            return None;
        }

        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape = false;
        for i in start..self.buf.len() {
            let b = self.buf[i];
            if in_string {
                if escape {
                    escape = false;
                } else if b == b'\\' {
                    escape = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let record = self.buf[start..=i].to_vec();
                        self.buf.drain(..=i);
                        return Some(record);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn take_last_seq(&mut self) -> Option<String> {
        if let Some(pos) = find_subslice(&self.buf, b"\"last_seq\"") {
            let rest = &self.buf[pos + 10..];
            let colon = rest.iter().position(|&b| b == b':')?;
            let after = &rest[colon + 1..];
            let end = after
                .iter()
                .position(|&b| b == b',' || b == b'}')
                .unwrap_or(after.len());
            let raw = std::str::from_utf8(&after[..end]).ok()?.trim();
            let cleaned = raw.trim_matches('"');
            return Some(cleaned.to_string());
        }
        None
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_scanner_finds_records_across_chunk_boundaries() {
        let mut scanner = RecordScanner::new();
        scanner.feed(br#"{"results":[{"seq":"1","id":"a","chang"#);
        assert!(scanner.next_record().is_none());
        scanner.feed(br#"es":[{"rev":"1-x"}]},{"seq":"2","id":"b","changes":[{"rev":"1-y"}]}],"#);
        let r1 = scanner.next_record().unwrap();
        let v1: Value = serde_json::from_slice(&r1).unwrap();
        assert_eq!(v1["id"], "a");
        let r2 = scanner.next_record().unwrap();
        let v2: Value = serde_json::from_slice(&r2).unwrap();
        assert_eq!(v2["id"], "b");
        assert!(scanner.next_record().is_none());
    }

    #[test]
    fn record_scanner_handles_strings_containing_braces() {
        let mut scanner = RecordScanner::new();
        let payload = br#"{"results":[{"seq":"1","id":"a","changes":[{"rev":"1-x"}],"note":"a{b}c"}],"last_seq":"1","pending":0}"#;
        scanner.feed(payload);
        let r = scanner.next_record().unwrap();
        let v: Value = serde_json::from_slice(&r).unwrap();
        assert_eq!(v["note"], "a{b}c");
        assert_eq!(scanner.take_last_seq().unwrap(), "1");
    }

    #[test]
    fn empty_doc_ids_skips_filter_param() {
        let params = ChangesFeedParams::new();
        let qs = params.query_string(FeedMode::Normal);
        assert!(!qs.contains("filter="));
    }

    #[test]
    fn doc_ids_sets_filter_and_encodes_value() {
        let params = ChangesFeedParams::new().doc_ids(vec!["a".to_string(), "b".to_string()]);
        let qs = params.query_string(FeedMode::Normal);
        assert!(qs.contains("filter=_doc_ids"));
        assert!(qs.contains("doc_ids="));
    }

    #[tokio::test]
    async fn stop_before_run_returns_since_unchanged() {
        let transport: Transport = Arc::new(crate::transport::ReqwestTransport::new());
        let feed = ChangeFeed::new(transport, "http://example.invalid/db");
        feed.stop().await;
        let params = ChangesFeedParams::new().since("42");
        let result = feed
            .run(FeedMode::Normal, &params, |_| async { true })
            .await
            .unwrap();
        assert_eq!(result, "42");
    }
}
