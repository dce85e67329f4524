use std::sync::Arc;
use std::time::Duration;

use crate::authorizer::Authorizer;

/// Which way documents flow relative to the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

/// Replication retry delay once a batch fails or a feed pass ends in
/// continuous mode (spec.md §4.7's `RETRY_DELAY`).
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Checkpoint-save debounce delay (spec.md §4.7's "schedule `saveLastSequence()`
/// 2s later").
pub const CHECKPOINT_SAVE_DELAY: Duration = Duration::from_secs(2);

/// Default size of the bounded remote-request pool (spec.md §5).
pub const DEFAULT_REMOTE_CONCURRENCY: usize = 2;

/// Inbox batcher defaults (spec.md §4.1's capacity/delay knobs, applied to
/// the replication inbox specifically).
const DEFAULT_INBOX_CAPACITY: usize = 100;
const DEFAULT_INBOX_DELAY: Duration = Duration::from_millis(500);

/// Everything a [`ReplicationCore`](crate::replication::ReplicationCore) needs
/// to run one direction of sync against one remote database. Built with a
/// consuming builder, matching the teacher's `*RequestParams` style.
#[derive(Clone)]
pub struct ReplicationConfig {
    pub remote_url: String,
    pub direction: Direction,
    pub continuous: bool,
    pub create_target: bool,
    pub doc_ids: Vec<String>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub remote_concurrency: usize,
    pub inbox_capacity: usize,
    pub inbox_delay: Duration,
}

impl ReplicationConfig {
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        let remote_url = remote_url.into();
        let (remote_url, authorizer) = match crate::authorizer::authorizer_from_query_string(&remote_url) {
            Some(parsed) => (parsed.stripped_url, Some(parsed.authorizer)),
            None => (remote_url, None),
        };
        ReplicationConfig {
            remote_url,
            direction,
            continuous: false,
            create_target: false,
            doc_ids: Vec::new(),
            authorizer,
            remote_concurrency: DEFAULT_REMOTE_CONCURRENCY,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            inbox_delay: DEFAULT_INBOX_DELAY,
        }
    }

    pub fn continuous(mut self, enable: bool) -> Self {
        self.continuous = enable;
        self
    }

    pub fn create_target(mut self, enable: bool) -> Self {
        self.create_target = enable;
        self
    }

    pub fn doc_ids(mut self, ids: Vec<String>) -> Self {
        self.doc_ids = ids;
        self
    }

    /// Overrides the query-string-derived authorizer (or sets one when the
    /// remote URL carried none).
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn remote_concurrency(mut self, permits: usize) -> Self {
        self.remote_concurrency = permits.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_query_param_is_extracted_into_authorizer() {
        let config = ReplicationConfig::new("https://example.com/db?persona=abc", Direction::Pull);
        assert_eq!(config.remote_url, "https://example.com/db");
        assert!(config.authorizer.is_some());
    }

    #[test]
    fn plain_url_has_no_authorizer_by_default() {
        let config = ReplicationConfig::new("https://example.com/db", Direction::Push);
        assert_eq!(config.remote_url, "https://example.com/db");
        assert!(config.authorizer.is_none());
    }
}
