//! Blob storage for raw uploads and thumbnails
//!
//! Paths are relative, `/`-separated keys. Uploads live under a
//! content-addressed layout (`objects/ab/cd/<hash>`) so identical bytes always
//! map to the same key.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Content-addressed key for an upload with the given hex hash
pub fn content_path(content_hash: &str) -> String {
    if content_hash.len() < 4 {
        return format!("objects/{}", content_hash);
    }
    format!(
        "objects/{}/{}/{}",
        &content_hash[0..2],
        &content_hash[2..4],
        content_hash
    )
}

/// Key for a document's thumbnail
pub fn thumbnail_path(document_id: &uuid::Uuid) -> String {
    format!("thumbnails/{}.png", document_id)
}

/// Trait for blob storage
///
/// Implementations:
/// - `LocalObjectStore`: Local filesystem
/// - `MemoryObjectStore`: In-process map
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `path`, replacing any previous object
    async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()>;

    /// Fetch an object; `Error::NotFound` when absent
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Time-limited URL for direct download
    async fn presign(&self, path: &str, ttl: Duration) -> Result<String>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Signs and verifies presigned URLs
#[derive(Debug, Clone)]
pub struct UrlSigner {
    secret: String,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::internal(format!("Invalid presign secret: {}", e)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// `<base>/<path>?expires=<unix>&signature=<sig>`
    pub fn sign(&self, path: &str, ttl: Duration) -> Result<String> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = URL_SAFE_NO_PAD.encode(self.mac(path, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url, path, expires, signature
        ))
    }

    /// Check a signature and that it has not expired
    ///
    /// The comparison runs in constant time.
    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(tag) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        self.mac(path, expires)
            .map(|mac| mac.verify_slice(&tag).is_ok())
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize)]
struct ObjectMeta {
    size: u64,
    content_type: String,
    stored_at: chrono::DateTime<Utc>,
}

/// Object store on the local filesystem
pub struct LocalObjectStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalObjectStore {
    /// Create a new local object store rooted at `root`
    pub fn new(root: PathBuf, signer: UrlSigner) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, signer })
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::validation(format!("Invalid object path: {}", path)));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()> {
        if data.len() as u64 != size {
            return Err(Error::validation(format!(
                "Declared size {} does not match {} bytes",
                size,
                data.len()
            )));
        }

        let object_path = self.resolve(path)?;
        if let Some(parent) = object_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // write-then-rename so readers never see a partial object
        let tmp_path = object_path.with_extension("partial");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &object_path).await?;

        let meta = ObjectMeta {
            size,
            content_type: content_type.to_string(),
            stored_at: Utc::now(),
        };
        tokio::fs::write(Self::meta_path(&object_path), serde_json::to_vec(&meta)?).await?;

        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let object_path = self.resolve(path)?;
        match tokio::fs::read(&object_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("Object {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let object_path = self.resolve(path)?;
        for target in [Self::meta_path(&object_path), object_path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let object_path = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&object_path).await?)
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        if !self.exists(path).await? {
            return Err(Error::not_found(format!("Object {}", path)));
        }
        self.signer.sign(path, ttl)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.root).await?)
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

/// In-process object store
pub struct MemoryObjectStore {
    objects: DashMap<String, (Bytes, String)>,
    signer: UrlSigner,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            signer: UrlSigner::new("memory", "memory://objects"),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()> {
        if data.len() as u64 != size {
            return Err(Error::validation(format!(
                "Declared size {} does not match {} bytes",
                size,
                data.len()
            )));
        }
        self.objects
            .insert(path.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| Error::not_found(format!("Object {}", path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        if !self.objects.contains_key(path) {
            return Err(Error::not_found(format!("Object {}", path)));
        }
        self.signer.sign(path, ttl)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_path_layout() {
        let hash = "abcdef0123";
        assert_eq!(content_path(hash), "objects/ab/cd/abcdef0123");
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            LocalObjectStore::new(dir.path().to_path_buf(), UrlSigner::new("s", "http://x")).unwrap();

        let path = content_path("aabbccdd");
        let data = Bytes::from_static(b"hello");
        store.put(&path, data.clone(), 5, "text/plain").await.unwrap();

        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap(), data);

        store.delete(&path).await.unwrap();
        assert!(!store.exists(&path).await.unwrap());
        assert!(matches!(store.get(&path).await, Err(Error::NotFound(_))));
        // second delete is a no-op
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            LocalObjectStore::new(dir.path().to_path_buf(), UrlSigner::new("s", "http://x")).unwrap();

        let result = store
            .put("../escape", Bytes::from_static(b"x"), 1, "text/plain")
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_presign_and_verify() {
        let store = MemoryObjectStore::new();
        store
            .put("objects/a", Bytes::from_static(b"abc"), 3, "text/plain")
            .await
            .unwrap();

        let url = store.presign("objects/a", Duration::from_secs(60)).await.unwrap();
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = "";
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v,
                _ => {}
            }
        }

        assert!(store.signer.verify("objects/a", expires, signature));
        assert!(!store.signer.verify("objects/b", expires, signature));
        assert!(!store.signer.verify("objects/a", expires - 3600, signature));
        assert!(!store.signer.verify("objects/a", expires, "not base64!"));
        assert!(!UrlSigner::new("other-secret", "memory://objects").verify("objects/a", expires, signature));
        assert!(matches!(
            store.presign("objects/missing", Duration::from_secs(60)).await,
            Err(Error::NotFound(_))
        ));
    }
}
