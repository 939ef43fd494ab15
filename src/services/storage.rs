use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::config::{Settings, StorageDriver};

#[derive(Debug, Error)]
pub(crate) enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub(crate) struct StoredBlob {
    pub(crate) key: String,
    pub(crate) size: i64,
    pub(crate) sha256: String,
}

impl StoredBlob {
    pub(crate) fn describe(key: &str, bytes: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            size: bytes.len() as i64,
            sha256: hex::encode(Sha256::digest(bytes)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BlobEntry {
    pub(crate) key: String,
    pub(crate) last_modified: Option<OffsetDateTime>,
}

/// Object storage for certificate artifacts and course images.
#[async_trait]
pub(crate) trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Removing a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError>;

    fn public_url(&self, key: &str) -> String;
}

pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match settings.storage().driver {
        StorageDriver::Local => {
            let root = PathBuf::from(&settings.storage().local_root);
            tokio::fs::create_dir_all(&root).await?;
            tracing::info!(root = %root.display(), "Using local blob storage");
            Arc::new(LocalBlobStore::new(root, settings.storage().public_url.clone()))
        }
        StorageDriver::S3 => {
            if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
                anyhow::bail!("STORAGE_DRIVER=s3 requires S3_ACCESS_KEY and S3_SECRET_KEY");
            }
            tracing::info!(bucket = %settings.s3().bucket, "Using S3 blob storage");
            Arc::new(S3BlobStore::from_settings(settings).await)
        }
    };
    Ok(store)
}

/// Keys are relative, slash separated and may not climb out of the store root.
pub(crate) fn validate_key(raw: &str) -> Result<PathBuf, StorageError> {
    let normalized = raw.trim().replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return Err(StorageError::InvalidKey(raw.to_string()));
    }

    let path = Path::new(&normalized);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir
            | Component::ParentDir
            | Component::RootDir
            | Component::Prefix(_) => {
                return Err(StorageError::InvalidKey(raw.to_string()));
            }
        }
    }

    Ok(path.to_path_buf())
}

#[derive(Debug, Clone)]
pub(crate) struct LocalBlobStore {
    root: PathBuf,
    public_base: String,
}

impl LocalBlobStore {
    pub(crate) fn new(root: PathBuf, public_base: String) -> Self {
        Self { root, public_base: public_base.trim_end_matches('/').to_string() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_key(key)?))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        key: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stored = StoredBlob::describe(key, &bytes);
        let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }

        Ok(stored)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let start = self.resolve(prefix.trim_end_matches('/'))?;
        let mut pending = vec![start];
        let mut entries = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = reader.next_entry().await? {
                let metadata = entry.metadata().await?;
                let path = entry.path();
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace('\\', "/");
                if key.contains(".tmp-") {
                    continue;
                }
                entries.push(BlobEntry {
                    key,
                    last_modified: metadata.modified().ok().map(OffsetDateTime::from),
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct S3BlobStore {
    client: Client,
    bucket: String,
    public_base: String,
}

impl S3BlobStore {
    pub(crate) async fn from_settings(settings: &Settings) -> Self {
        let s3 = settings.s3();
        let creds = Credentials::new(
            s3.access_key.clone(),
            s3.secret_key.clone(),
            None,
            None,
            "certificate-registry-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(s3.endpoint.clone())
            .region(aws_config::Region::new(s3.region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let public_base = s3
            .public_url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", s3.endpoint.trim_end_matches('/'), s3.bucket));

        Self { client: Client::new(&config), bucket: s3.bucket.clone(), public_base }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredBlob, StorageError> {
        validate_key(key)?;
        let stored = StoredBlob::describe(key, &bytes);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.into_service_error().to_string()))?;

        Ok(stored)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        let output =
            match self.client.get_object().bucket(&self.bucket).key(key).send().await {
                Ok(output) => output,
                Err(err) => {
                    let service = err.into_service_error();
                    if service.is_no_such_key() {
                        return Err(StorageError::NotFound(key.to_string()));
                    }
                    return Err(StorageError::Backend(service.to_string()));
                }
            };

        let data =
            output.body.collect().await.map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| StorageError::Backend(err.into_service_error().to_string()))?;

            for object in output.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let last_modified = object
                    .last_modified()
                    .and_then(|value| OffsetDateTime::from_unix_timestamp(value.secs()).ok());
                entries.push(BlobEntry { key: key.to_string(), last_modified });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(entries)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_escapes() {
        assert!(validate_key("certificates/7/r1/qr.svg").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("  ").is_err());
    }

    #[tokio::test]
    async fn local_store_roundtrip_and_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            LocalBlobStore::new(dir.path().to_path_buf(), "http://files.test/storage/".into());

        let stored = store
            .put("certificates/7/r1/qr.svg", "image/svg+xml", b"<svg/>".to_vec())
            .await
            .expect("put");
        assert_eq!(stored.size, 6);
        assert_eq!(stored.sha256.len(), 64);

        store
            .put("courses/1/cover.png", "image/png", vec![1, 2, 3])
            .await
            .expect("put image");

        assert_eq!(store.get("certificates/7/r1/qr.svg").await.expect("get"), b"<svg/>");

        let listed = store.list("certificates/").await.expect("list");
        let keys: Vec<_> = listed.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["certificates/7/r1/qr.svg"]);
        assert!(listed[0].last_modified.is_some());

        assert_eq!(
            store.public_url("certificates/7/r1/qr.svg"),
            "http://files.test/storage/certificates/7/r1/qr.svg"
        );
    }

    #[tokio::test]
    async fn local_store_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path().to_path_buf(), "http://files.test".into());

        store.put("certificates/1/r1/certificate.pdf", "application/pdf", vec![0]).await.unwrap();
        store.delete("certificates/1/r1/certificate.pdf").await.expect("delete");
        store.delete("certificates/1/r1/certificate.pdf").await.expect("second delete");

        assert!(matches!(
            store.get("certificates/1/r1/certificate.pdf").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.list("certificates/").await.expect("list").is_empty());
    }
}
