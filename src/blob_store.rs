use std::path::{Path, PathBuf};

use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::BlobStoreError;

/// The SHA-1 of an attachment's raw content. Files in the blob store are
/// named by this key's hex encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(pub [u8; 20]);

impl BlobKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha1::digest(bytes);
        let mut key = [0u8; 20];
        key.copy_from_slice(&digest);
        BlobKey(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 20 {
            return None;
        }
        let mut key = [0u8; 20];
        key.copy_from_slice(&bytes);
        Some(BlobKey(key))
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Content-addressed storage of attachment bodies, keyed by the SHA-1 of
/// their content. Directory layout: `<dir>/<40-hex>.blob` with a sibling
/// `<dir>/tmp/` used for staging writes (spec.md §6 persistence layout).
#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let dir = dir.into();
        let tmp_dir = dir.join("tmp");
        fs::create_dir_all(&dir).await?;
        fs::create_dir_all(&tmp_dir).await?;
        Ok(BlobStore { dir, tmp_dir })
    }

    /// Pure: same bytes always resolve to the same path. Deduplication is
    /// automatic because storage is content-addressed.
    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.dir.join(format!("{}.blob", key.to_hex()))
    }

    /// Writes `bytes` atomically via a temp file + rename and returns the
    /// resulting key and length.
    pub async fn store_blob(&self, bytes: &[u8]) -> Result<(BlobKey, u64), BlobStoreError> {
        let key = BlobKey::from_bytes(bytes);
        let final_path = self.path_for(&key);
        if fs::metadata(&final_path).await.is_ok() {
            return Ok((key, bytes.len() as u64));
        }

        let tmp_path = self.tmp_dir.join(uuid::Uuid::new_v4().to_string());
        {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
        }
        install_or_discard(&tmp_path, &final_path).await?;
        Ok((key, bytes.len() as u64))
    }

    /// Opens a previously stored blob for reading.
    pub async fn open_blob(&self, key: &BlobKey) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tmp_path(&self) -> PathBuf {
        self.tmp_dir.join(uuid::Uuid::new_v4().to_string())
    }
}

/// Renames `tmp_path` to `final_path`. If the target already exists (another
/// writer of identical content won the race), the existing file is treated
/// as canonical and the temp file is discarded — first writer wins
/// (spec.md §4.3, §5).
async fn install_or_discard(tmp_path: &Path, final_path: &Path) -> Result<(), BlobStoreError> {
    match fs::rename(tmp_path, final_path).await {
        Ok(()) => Ok(()),
        Err(_) if fs::metadata(final_path).await.is_ok() => {
            let _ = fs::remove_file(tmp_path).await;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(tmp_path).await;
            Err(e.into())
        }
    }
}

/// A streaming builder for attachment bodies received in chunks (e.g. from a
/// `multipart/related` part). Incrementally updates SHA-1 (for the blob key)
/// and MD5 (for the CouchDB-style legacy `digest` attachment field) digests;
/// owns its temp file exclusively until [`install`](BlobWriter::install)
/// moves it into the store, or [`cancel`](BlobWriter::cancel) unlinks it.
pub struct BlobWriter {
    store: BlobStore,
    tmp_path: PathBuf,
    file: Option<fs::File>,
    sha1: Sha1,
    md5: Md5,
    length: u64,
}

/// The digests and length recorded once a [`BlobWriter`] is finished.
pub struct BlobWriterDigest {
    pub key: BlobKey,
    pub md5_base64: String,
    pub length: u64,
}

impl BlobWriter {
    pub async fn new(store: &BlobStore) -> Result<Self, BlobStoreError> {
        let tmp_path = store.tmp_path();
        let file = fs::File::create(&tmp_path).await?;
        Ok(BlobWriter {
            store: store.clone(),
            tmp_path,
            file: Some(file),
            sha1: Sha1::new(),
            md5: Md5::new(),
            length: 0,
        })
    }

    /// Incrementally appends a chunk, updating both digests.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), BlobStoreError> {
        self.sha1.update(bytes);
        self.md5.update(bytes);
        self.length += bytes.len() as u64;
        let file = self.file.as_mut().expect("append after finish");
        file.write_all(bytes).await?;
        Ok(())
    }

    /// Closes the temp file and records the final digests, without yet
    /// moving the blob into its final location.
    pub async fn finish(mut self) -> Result<(BlobWriterDigest, InstallableBlob), BlobStoreError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let sha1 = self.sha1.clone().finalize();
        let mut key_bytes = [0u8; 20];
        key_bytes.copy_from_slice(&sha1);
        let key = BlobKey(key_bytes);
        let md5_base64 = base64_encode(&self.md5.clone().finalize());

        Ok((
            BlobWriterDigest {
                key: key.clone(),
                md5_base64,
                length: self.length,
            },
            InstallableBlob {
                store: self.store.clone(),
                tmp_path: self.tmp_path.clone(),
                key,
            },
        ))
    }

    /// Unlinks the temp file without installing it.
    pub async fn cancel(mut self) -> Result<(), BlobStoreError> {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path).await;
        Ok(())
    }
}

/// A finished write, ready to be moved into the store.
pub struct InstallableBlob {
    store: BlobStore,
    tmp_path: PathBuf,
    key: BlobKey,
}

impl InstallableBlob {
    pub async fn install(self) -> Result<BlobKey, BlobStoreError> {
        let final_path = self.store.path_for(&self.key);
        install_or_discard(&self.tmp_path, &final_path).await?;
        Ok(self.key)
    }
}

pub(crate) fn base64_encode(bytes: &[u8]) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32);
        out.push(CHARS[((n >> 18) & 0x3f) as usize] as char);
        out.push(CHARS[((n >> 12) & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            CHARS[((n >> 6) & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            CHARS[(n & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_open_round_trips_and_key_matches_sha1() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let data = b"hello world, this is attachment content";
        let (key, len) = store.store_blob(data).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(key, BlobKey::from_bytes(data));

        let read_back = store.open_blob(&key).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn duplicate_content_deduplicates_to_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let data = b"same content";
        let (key1, _) = store.store_blob(data).await.unwrap();
        let (key2, _) = store.store_blob(data).await.unwrap();
        assert_eq!(key1, key2);
        assert_eq!(store.path_for(&key1), store.path_for(&key2));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let key = BlobKey::from_bytes(b"never stored");
        let err = store.open_blob(&key).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn blob_writer_streams_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let mut writer = BlobWriter::new(&store).await.unwrap();
        writer.append(b"hello ").await.unwrap();
        writer.append(b"world").await.unwrap();
        let (digest, installable) = writer.finish().await.unwrap();
        assert_eq!(digest.length, 11);
        assert_eq!(digest.key, BlobKey::from_bytes(b"hello world"));
        let key = installable.install().await.unwrap();

        let content = store.open_blob(&key).await.unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn blob_writer_cancel_unlinks_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let mut writer = BlobWriter::new(&store).await.unwrap();
        writer.append(b"discarded").await.unwrap();
        writer.cancel().await.unwrap();

        let mut entries = fs::read_dir(dir.path().join("tmp")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
