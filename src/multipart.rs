use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use crate::blob_store::{base64_encode, BlobStore};
use crate::error::MultipartError;

/// Parses a `multipart/related` response body into a JSON document plus an
/// attachment map (spec.md §4.5). The first MIME part is the document; each
/// subsequent part corresponds to an `_attachments[name]` entry whose
/// `follows: true` flag marks it as streamed out-of-band.
pub struct MultipartDocReader<'a> {
    store: &'a BlobStore,
    parser: multer::Multipart<'static>,
}

impl<'a> MultipartDocReader<'a> {
    /// `content_type` must carry the `boundary=` parameter, as returned on
    /// the response's `Content-Type` header.
    pub fn new(
        store: &'a BlobStore,
        content_type: &str,
        body: impl futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> Result<Self, MultipartError> {
        let boundary =
            multer::parse_boundary(content_type).map_err(|_| MultipartError::MissingBoundary)?;
        let parser = multer::Multipart::new(body, boundary);
        Ok(MultipartDocReader { store, parser })
    }

    /// Consumes the whole body and returns the JSON document with its
    /// `_attachments` stubs amended to reflect what was actually received.
    pub async fn finish(mut self) -> Result<Value, MultipartError> {
        let mut doc: Option<Value> = None;
        let mut received: HashMap<String, (Vec<u8>, String)> = HashMap::new();

        while let Some(field) = self.parser.next_field().await? {
            let content_type = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());

            if doc.is_none() {
                let bytes = field.bytes().await?;
                doc = Some(serde_json::from_slice(&bytes)?);
                continue;
            }

            let name = field
                .name()
                .map(|s| s.to_string())
                .unwrap_or_default();
            let bytes = field.bytes().await?.to_vec();
            received.insert(name, (bytes, content_type));
        }

        let mut doc = doc.ok_or(MultipartError::MissingDocumentPart)?;
        self.amend_attachments(&mut doc, received).await?;
        Ok(doc)
    }

    async fn amend_attachments(
        &self,
        doc: &mut Value,
        mut received: HashMap<String, (Vec<u8>, String)>,
    ) -> Result<(), MultipartError> {
        let attachments = match doc.get_mut("_attachments") {
            Some(Value::Object(map)) => map,
            _ => return Ok(()),
        };

        for (name, stub) in attachments.iter_mut() {
            let follows = stub
                .get("follows")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !follows {
                continue;
            }
            let (bytes, content_type) = received
                .remove(name)
                .ok_or_else(|| MultipartError::MissingAttachment(name.clone()))?;

            let (key, _len) = self.store.store_blob(&bytes).await?;
            let digest = format!("sha1-{}", base64_of_hex(&key.to_hex()));

            if let Value::Object(stub_obj) = stub {
                stub_obj.insert("digest".to_string(), Value::String(digest));
                stub_obj.insert("length".to_string(), Value::from(bytes.len() as u64));
                stub_obj.insert("follows".to_string(), Value::Bool(false));
                stub_obj
                    .entry("content_type")
                    .or_insert_with(|| Value::String(content_type));
            }
        }

        Ok(())
    }
}

/// Convenience: turn a hex digest string into the bytes it represents,
/// base64-encoded, for the CouchDB `sha1-<base64>` digest convention.
fn base64_of_hex(hex_str: &str) -> String {
    let bytes = hex::decode(hex_str).unwrap_or_default();
    base64_encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn multipart_body(boundary: &str, doc: &str, attachment_name: &str, attachment_body: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
        body.extend_from_slice(doc.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: attachment; filename=\"{attachment_name}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: text/plain\r\n\r\n");
        body.extend_from_slice(attachment_body);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn parses_document_and_amends_attachment_stub() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let doc_json = serde_json::json!({
            "_id": "doc1",
            "_attachments": {
                "att1": {"follows": true, "content_type": "text/plain"}
            }
        })
        .to_string();

        let boundary = "boundary123";
        let body = multipart_body(boundary, &doc_json, "att1", b"attachment content");
        let stream = stream::once(async move { Ok::<_, reqwest::Error>(Bytes::from(body)) });

        let content_type = format!("multipart/related; boundary={boundary}");
        let reader = MultipartDocReader::new(&store, &content_type, stream).unwrap();
        let doc = reader.finish().await.unwrap();

        assert_eq!(doc["_id"], "doc1");
        let stub = &doc["_attachments"]["att1"];
        assert_eq!(stub["follows"], false);
        assert_eq!(stub["length"], 19);
        assert!(stub["digest"].as_str().unwrap().starts_with("sha1-"));
    }

    #[tokio::test]
    async fn missing_document_part_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let stream = stream::iter(Vec::<Result<Bytes, reqwest::Error>>::new());
        let content_type = "multipart/related; boundary=xyz";
        let reader = MultipartDocReader::new(&store, content_type, stream).unwrap();
        let err = reader.finish().await.unwrap_err();
        assert!(matches!(err, MultipartError::MissingDocumentPart));
    }
}
