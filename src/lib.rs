use bevy_reflect::Reflect;
#[cfg(feature = "color")]
pub use colored_json;
use serde::Serialize;
use serde_json::Value;

pub mod authorizer;
pub mod backoff;
pub mod batcher;
pub mod blob_store;
pub mod change_feed;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod local_store;
pub mod multipart;
pub mod replication;
pub mod transport;
pub mod view_indexer;

pub use authorizer::{Authorizer, CookieAuthorizer, FacebookAuthorizer, PersonaAuthorizer};
pub use backoff::Backoff;
pub use batcher::Batcher;
pub use blob_store::{BlobKey, BlobStore, BlobWriter, BlobWriterDigest, InstallableBlob};
pub use change_feed::{ChangeFeed, ChangesFeedParams, FeedMode, FeedState};
pub use checkpoint::{checkpoint_id, Checkpoint, CheckpointState};
pub use config::{Direction, ReplicationConfig};
pub use error::ReplicatorError;
pub use local_store::{AttachmentRef, ChangeEntry, InMemoryLocalStore, LocalStore, Revision};
pub use multipart::MultipartDocReader;
pub use replication::{ReplicationCore, ReplicationHandle, ReplicationState};
pub use transport::{HttpTransport, ReqwestTransport};
pub use view_indexer::{Collation, MapFn, QueryOptions, QueryRow, ReduceFn, View, ViewIndexer};

/// Pretty-printing helpers for the engine's own JSON-shaped types, carried
/// over from the teacher's response-struct conversions rather than built
/// fresh (`checkpoint::CheckpointState`, `view_indexer::QueryRow` stand in
/// for the old `CouchDBInfo`/`DBOperationSuccess` targets).
pub trait Convert {
    fn to_string_pretty(&self) -> Result<String, ReplicatorError>
    where
        Self: Serialize,
    {
        let u = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&u)?)
    }

    fn to_json(&self) -> Result<Value, ReplicatorError>
    where
        Self: Serialize,
    {
        Ok(serde_json::to_value(self)?)
    }

    #[cfg(feature = "color")]
    fn to_colored_string(&self) -> Result<String, ReplicatorError>
    where
        Self: Serialize,
    {
        let u = serde_json::to_value(self)?;
        colored_json::to_colored_json_auto(&u)
            .map_err(|e| ReplicatorError::GenericCouchdbError(Value::String(e.to_string())))
    }
}

impl Convert for CheckpointState {}

/// Parses a `bevy_reflect` struct's fields into an HTTP query string,
/// reused by [`ChangesFeedParams`] and available to any future
/// request-parameter struct built the same way.
pub trait ParseQueryParams: bevy_reflect::Struct {
    fn parse_params(&self) -> String {
        let mut params = String::new();
        for (index, value) in self.iter_fields().enumerate() {
            let field_name = self.name_at(index).unwrap();
            let value_formatted = self.get_value(value);
            if !value_formatted.eq("false") && !value_formatted.is_empty() && !value_formatted.eq("0")
            {
                params.push_str(&format!("{}={}&", field_name, value_formatted));
            }
        }
        params
    }

    fn get_value(&self, value: &dyn Reflect) -> String {
        match value.type_name() {
            "bool" => value.downcast_ref::<bool>().unwrap().to_string(),
            "i64" => value.downcast_ref::<i64>().unwrap().to_string(),
            "alloc::string::String" => value.downcast_ref::<String>().unwrap().to_owned(),
            _ => String::new(),
        }
    }
}
