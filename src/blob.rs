use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of a blob read.
///
/// The store deliberately distinguishes "the object is not there" from "the
/// store could not be reached", so callers can decide whether absence is
/// authoritative. Treating a transient failure as an empty object is how
/// saved annotations get lost.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch<T> {
    /// The object exists and was read in full.
    Found(T),
    /// The store answered and the object genuinely does not exist.
    Missing,
    /// Network or server failure; the object may or may not exist.
    Unavailable(String),
}

impl<T> Fetch<T> {
    /// Map the payload of a successful fetch, leaving the other arms alone.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetch<U> {
        match self {
            Fetch::Found(v) => Fetch::Found(f(v)),
            Fetch::Missing => Fetch::Missing,
            Fetch::Unavailable(e) => Fetch::Unavailable(e),
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            Fetch::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// A fetched object together with the etag the store reported for it.
///
/// The etag feeds `put_if_match` so read-modify-write updates (the credential
/// map in particular) can detect a concurrent writer instead of clobbering it.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub etag: Option<String>,
}

/// One entry from a prefix listing.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobEntry {
    pub key: String,
    #[serde(default)]
    pub etag: String,
}

/// Failure modes of a conditional write.
#[derive(Debug, PartialEq)]
pub enum PutError {
    /// The precondition failed: someone else wrote the key since we read it.
    Conflict,
    /// The write itself failed (network, server, IO).
    Failed(String),
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::Conflict => write!(f, "object changed since it was read"),
            PutError::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Client interface to the blob store the whole service persists through.
///
/// Keys are path-like strings (`<namespace>/config/users.json`). Writes
/// overwrite by key; there is no append. `put_if_match` is the only
/// concurrency primitive on offer.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, String>;

    /// Read an object in full.
    async fn fetch(&self, key: &str) -> Fetch<Blob>;

    /// Write an object, overwriting any previous content.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), String>;

    /// Write an object only if its current etag matches `expected`.
    /// `None` means "only if the object does not exist yet".
    async fn put_if_match(
        &self,
        key: &str,
        bytes: &[u8],
        expected: Option<&str>,
    ) -> Result<(), PutError>;

    /// Delete a single object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), String>;

    /// Delete every object under `prefix`, returning how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, String>;
}

/// Blob store key layout.
///
/// These are conventions, not a contract: the namespace groups one
/// deployment's blobs, `config/` holds the JSON "database" files, the master
/// workbook sits at the namespace root and per-store results live under
/// `hasil/` with the version embedded in the filename.
pub mod keys {
    /// Credential map: identifier -> secret.
    pub fn users(namespace: &str) -> String {
        format!("{}/config/users.json", namespace)
    }

    /// Per-day per-user login counters.
    pub fn activity_log(namespace: &str) -> String {
        format!("{}/config/logs.json", namespace)
    }

    /// Metadata describing the active master workbook.
    pub fn master_meta(namespace: &str) -> String {
        format!("{}/config/master.json", namespace)
    }

    /// The uploaded master workbook itself.
    pub fn master(namespace: &str, filename: &str) -> String {
        format!("{}/{}", namespace, filename)
    }

    /// Prefix holding every per-store result workbook.
    pub fn results_prefix(namespace: &str) -> String {
        format!("{}/hasil/", namespace)
    }

    /// Result workbook for one (store, version) pair. Overwritten on every
    /// save, which is what makes saving idempotent.
    pub fn result(namespace: &str, store_code: &str, version: &str) -> String {
        format!(
            "{}/hasil/{}_{}.xlsx",
            namespace,
            canonical_store(store_code),
            version
        )
    }

    /// Store codes as they appear in filenames: trimmed, uppercased, no
    /// interior spaces.
    pub fn canonical_store(store_code: &str) -> String {
        store_code.trim().to_uppercase().replace(' ', "")
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    objects: Vec<BlobEntry>,
}

/// Blob store backed by a remote HTTP object endpoint.
///
/// Objects are addressed as `{base}/{key}` with GET/PUT/DELETE; conditional
/// writes use `If-Match`/`If-None-Match`; `GET {base}/?prefix=` returns a JSON
/// listing. Reads carry a `t=<unix-seconds>` query parameter to defeat any CDN
/// cache in front of the store. One fixed timeout, no retries.
pub struct HttpBlobStore {
    client: reqwest::Client,
    base: String,
}

impl HttpBlobStore {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(HttpBlobStore {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    fn cache_bust() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, String> {
        let bust = Self::cache_bust().to_string();
        let resp = self
            .client
            .get(format!("{}/", self.base))
            .query(&[("prefix", prefix), ("t", bust.as_str())])
            .send()
            .await
            .map_err(|e| format!("list failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("list failed: HTTP {}", resp.status()));
        }

        let listing: ListResponse = resp
            .json()
            .await
            .map_err(|e| format!("list response was not valid JSON: {}", e))?;
        Ok(listing.objects)
    }

    async fn fetch(&self, key: &str) -> Fetch<Blob> {
        let resp = match self
            .client
            .get(self.url(key))
            .query(&[("t", Self::cache_bust())])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Fetch::Unavailable(e.to_string()),
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Fetch::Missing;
        }
        if !resp.status().is_success() {
            return Fetch::Unavailable(format!("HTTP {}", resp.status()));
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        match resp.bytes().await {
            Ok(bytes) => Fetch::Found(Blob {
                bytes: bytes.to_vec(),
                etag,
            }),
            Err(e) => Fetch::Unavailable(e.to_string()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        let resp = self
            .client
            .put(self.url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| format!("upload failed: {}", e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("upload failed: HTTP {}", resp.status()))
        }
    }

    async fn put_if_match(
        &self,
        key: &str,
        bytes: &[u8],
        expected: Option<&str>,
    ) -> Result<(), PutError> {
        let mut req = self
            .client
            .put(self.url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream");

        req = match expected {
            Some(etag) => req.header(reqwest::header::IF_MATCH, format!("\"{}\"", etag)),
            None => req.header(reqwest::header::IF_NONE_MATCH, "*"),
        };

        let resp = req
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| PutError::Failed(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(PutError::Conflict);
        }
        if !resp.status().is_success() {
            return Err(PutError::Failed(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let resp = self
            .client
            .delete(self.url(key))
            .send()
            .await
            .map_err(|e| format!("delete failed: {}", e))?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("delete failed: HTTP {}", resp.status()))
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, String> {
        let entries = self.list(prefix).await?;
        let mut deleted = 0;
        for entry in &entries {
            self.delete(&entry.key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Blob store backed by a local directory; keys map to relative file paths.
///
/// Used for local runs and tests. Etags are the SHA-256 of the content, and a
/// process-wide mutex makes `put_if_match` atomic within this process.
pub struct DirBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirBlobStore {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, String> {
        let rel = Path::new(key);
        // Keys never escape the root.
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(format!("invalid blob key: {}", key));
        }
        Ok(self.root.join(rel))
    }

    fn etag_of(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn write_file(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| format!("failed to write {}: {}", key, e))
    }

    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    Self::walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
    }

    fn keys_under(&self, prefix: &str) -> Vec<String> {
        let mut files = Vec::new();
        Self::walk(&self.root, &mut files);
        let mut keys: Vec<String> = files
            .iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, String> {
        let mut entries = Vec::new();
        for key in self.keys_under(prefix) {
            let path = self.path_for(&key)?;
            let bytes = std::fs::read(&path).map_err(|e| format!("failed to read {}: {}", key, e))?;
            entries.push(BlobEntry {
                etag: Self::etag_of(&bytes),
                key,
            });
        }
        Ok(entries)
    }

    async fn fetch(&self, key: &str) -> Fetch<Blob> {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(e) => return Fetch::Unavailable(e),
        };
        match std::fs::read(&path) {
            Ok(bytes) => {
                let etag = Self::etag_of(&bytes);
                Fetch::Found(Blob {
                    bytes,
                    etag: Some(etag),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Fetch::Missing,
            Err(e) => Fetch::Unavailable(e.to_string()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        let _guard = self.write_lock.lock().unwrap();
        self.write_file(key, bytes)
    }

    async fn put_if_match(
        &self,
        key: &str,
        bytes: &[u8],
        expected: Option<&str>,
    ) -> Result<(), PutError> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.path_for(key).map_err(PutError::Failed)?;

        let current = match std::fs::read(&path) {
            Ok(existing) => Some(Self::etag_of(&existing)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(PutError::Failed(e.to_string())),
        };

        match (expected, current) {
            (None, None) => {}
            (Some(want), Some(have)) if want == have => {}
            _ => return Err(PutError::Conflict),
        }

        self.write_file(key, bytes).map_err(PutError::Failed)
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("failed to delete {}: {}", key, e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, String> {
        let keys = self.keys_under(prefix);
        let mut deleted = 0;
        for key in &keys {
            self.delete(key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DirBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn fetch_distinguishes_missing_from_found() {
        let (_dir, store) = store();
        assert_eq!(store.fetch("ns/config/users.json").await, Fetch::Missing);

        store.put("ns/config/users.json", b"{}").await.unwrap();
        let blob = store.fetch("ns/config/users.json").await.found().unwrap();
        assert_eq!(blob.bytes, b"{}");
        assert!(blob.etag.is_some());
    }

    #[tokio::test]
    async fn put_overwrites_by_key() {
        let (_dir, store) = store();
        store.put("ns/a.json", b"one").await.unwrap();
        store.put("ns/a.json", b"two").await.unwrap();
        let blob = store.fetch("ns/a.json").await.found().unwrap();
        assert_eq!(blob.bytes, b"two");
    }

    #[tokio::test]
    async fn put_if_match_detects_concurrent_writer() {
        let (_dir, store) = store();
        store.put("ns/u.json", b"v1").await.unwrap();
        let stale = store.fetch("ns/u.json").await.found().unwrap();

        // Someone else writes in between.
        store.put("ns/u.json", b"v2").await.unwrap();

        let err = store
            .put_if_match("ns/u.json", b"v3", stale.etag.as_deref())
            .await
            .unwrap_err();
        assert_eq!(err, PutError::Conflict);
        assert_eq!(store.fetch("ns/u.json").await.found().unwrap().bytes, b"v2");
    }

    #[tokio::test]
    async fn put_if_match_create_only() {
        let (_dir, store) = store();
        store.put_if_match("ns/new.json", b"x", None).await.unwrap();
        let err = store
            .put_if_match("ns/new.json", b"y", None)
            .await
            .unwrap_err();
        assert_eq!(err, PutError::Conflict);
    }

    #[tokio::test]
    async fn list_and_delete_prefix() {
        let (_dir, store) = store();
        store.put("ns/hasil/T001_2026-01.xlsx", b"a").await.unwrap();
        store.put("ns/hasil/T002_2026-01.xlsx", b"b").await.unwrap();
        store.put("ns/master.xlsx", b"m").await.unwrap();

        let listed = store.list("ns/hasil/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.key.starts_with("ns/hasil/")));

        let gone = store.delete_prefix("ns/hasil/").await.unwrap();
        assert_eq!(gone, 2);
        assert!(store.list("ns/hasil/").await.unwrap().is_empty());
        assert!(matches!(store.fetch("ns/master.xlsx").await, Fetch::Found(_)));
    }

    #[test]
    fn result_keys_embed_store_and_version() {
        assert_eq!(
            keys::result("ns", " f08c ", "2026-01"),
            "ns/hasil/F08C_2026-01.xlsx"
        );
        assert_eq!(keys::users("ns"), "ns/config/users.json");
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let (_dir, store) = store();
        assert!(store.put("../escape", b"x").await.is_err());
    }
}
