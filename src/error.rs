use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error body returned by a CouchDB-compatible remote on a non-2xx response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CouchDBError {
    pub error: String,
    pub reason: String,
}

/// Errors surfaced by the content-addressed attachment store.
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("blob not found for key {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while consuming a remote `_changes` feed.
#[derive(Error, Debug)]
pub enum ChangeFeedError {
    #[error("remote returned status {0}: {1}")]
    RemoteError(u16, String),
    #[error("continuous feed mode is not supported")]
    UnsupportedMode,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("malformed change record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("feed stopped")]
    Stopped,
}

/// Errors surfaced by `_local/<id>` checkpoint fetch/save.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("remote checkpoint was deleted (404)")]
    Deleted,
    #[error("remote checkpoint conflict (409)")]
    Conflict,
    #[error("unexpected status {0}: {1}")]
    Unexpected(u16, String),
}

/// Errors surfaced while parsing a `multipart/related` document response.
#[derive(Error, Debug)]
pub enum MultipartError {
    #[error("missing boundary parameter on content-type")]
    MissingBoundary,
    #[error("first MIME part was not the JSON document")]
    MissingDocumentPart,
    #[error("attachment {0} referenced by the document was never received")]
    MissingAttachment(String),
    #[error(transparent)]
    Parse(#[from] multer::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
}

/// Errors surfaced by the map/reduce view update loop.
#[derive(Error, Debug)]
pub enum ViewError {
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),
    #[error("view transaction aborted")]
    Aborted,
    #[error("no such view: {0}")]
    NotFound(String),
    #[error("view {0} has no reduce function")]
    NoReduceFunction(String),
}

/// Errors surfaced by the injected `LocalStore` collaborator.
#[derive(Error, Debug)]
pub enum LocalStoreError {
    #[error("local store is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Top-level error type for the replication engine.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("unable to reach remote")]
    InvalidUrlOrPort(#[from] reqwest::Error),
    #[error("Status Code: {1}, meaning: {}, reason: {}", .0.error, .0.reason)]
    Unauthorized(CouchDBError, u16),
    #[error("unable to parse json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{0}")]
    GenericCouchdbError(Value),
    #[error("replication already running")]
    AlreadyRunning,
    #[error("local store is closed")]
    LocalStoreClosed,
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),
    #[error(transparent)]
    ChangeFeed(#[from] ChangeFeedError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("replication was cancelled")]
    Cancelled,
}
