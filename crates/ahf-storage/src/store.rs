//! Byte stores with atomic publish semantics: local disk and object storage.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahf_core::FileLocation;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::StorageError;

/// Staging files are hidden dot-files with this suffix, next to their target.
const STAGING_SUFFIX: &str = ".tmp";

/// Destination for snapshot files, addressed by `/`-separated relative paths.
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    fn location(&self, relative: &str) -> FileLocation;

    /// Publishes `bytes` at `relative` so that readers see either nothing or the full file.
    async fn put_atomic(&self, relative: &str, bytes: Vec<u8>) -> Result<FileLocation, StorageError>;

    async fn exists(&self, relative: &str) -> Result<bool, StorageError>;

    /// Published files under `prefix`, sorted. Staging artifacts are never listed.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Removes a published file. Missing files are not an error.
    async fn delete(&self, relative: &str) -> Result<(), StorageError>;
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(StorageError::InvalidPath(relative.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    pub fn staging_path_for(target: &Path, len: usize) -> PathBuf {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!(".{}.{}{}", Uuid::new_v4(), len, STAGING_SUFFIX))
    }

    /// Removes staging files left behind by interrupted writes.
    pub async fn sweep_staging(&self) -> Result<usize, StorageError> {
        let mut removed = 0usize;
        for path in walk_files(&self.root).await? {
            let staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_staging_name);
            if staging {
                fs::remove_file(&path).await.map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(root = %self.root.display(), removed, "removed leftover staging files");
        }
        Ok(removed)
    }
}

async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(StorageError::Io { path: dir, source }),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let file_type = entry.file_type().await.map_err(|source| StorageError::Io {
                path: entry.path(),
                source,
            })?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    fn location(&self, relative: &str) -> FileLocation {
        let uri = self
            .absolute(relative)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| relative.to_string());
        FileLocation {
            relative_path: relative.to_string(),
            uri,
        }
    }

    async fn put_atomic(&self, relative: &str, bytes: Vec<u8>) -> Result<FileLocation, StorageError> {
        let target = self.absolute(relative)?;
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(relative.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StorageError::Io {
                path: parent.clone(),
                source,
            })?;

        let tmp = Self::staging_path_for(&target, bytes.len());
        let staged = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(source) = staged {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::Io { path: target, source });
        }
        debug!(path = %target.display(), bytes = bytes.len(), "published snapshot file");
        Ok(self.location(relative))
    }

    async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let path = self.absolute(relative)?;
        match fs::try_exists(&path).await {
            Ok(found) => Ok(found),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let start = self.absolute(prefix)?;
        let mut out = Vec::new();
        for path in walk_files(&start).await? {
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let parts = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>();
            if parts.last().is_some_and(|name| is_staging_name(name)) {
                continue;
            }
            out.push(parts.join("/"));
        }
        out.sort();
        Ok(out)
    }

    async fn delete(&self, relative: &str) -> Result<(), StorageError> {
        let path = self.absolute(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

pub const DEFAULT_MULTIPART_THRESHOLD: usize = 32 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Object storage backed store. Small files go up in one PUT; large ones use
/// a multipart upload that is only completed after every part succeeded.
#[derive(Debug, Clone)]
pub struct ObjectSnapshotStore {
    store: Arc<dyn ObjectStore>,
    uri_prefix: String,
    multipart_threshold: usize,
    part_size: usize,
}

impl ObjectSnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, uri_prefix: impl Into<String>) -> Self {
        Self {
            store,
            uri_prefix: uri_prefix.into(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_multipart(mut self, threshold: usize, part_size: usize) -> Self {
        self.multipart_threshold = threshold;
        self.part_size = part_size.max(1);
        self
    }

    fn object_path(relative: &str) -> Result<ObjectPath, StorageError> {
        ObjectPath::parse(relative).map_err(|_| StorageError::InvalidPath(relative.to_string()))
    }

    async fn put_multipart(&self, path: &ObjectPath, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut upload = self.store.put_multipart(path).await?;
        for chunk in bytes.chunks(self.part_size) {
            if let Err(err) = upload.put_part(PutPayload::from(chunk.to_vec())).await {
                if let Err(abort_err) = upload.abort().await {
                    warn!(%path, error = %abort_err, "failed to abort multipart upload");
                }
                return Err(err.into());
            }
        }
        if let Err(err) = upload.complete().await {
            if let Err(abort_err) = upload.abort().await {
                warn!(%path, error = %abort_err, "failed to abort multipart upload");
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for ObjectSnapshotStore {
    fn location(&self, relative: &str) -> FileLocation {
        FileLocation {
            relative_path: relative.to_string(),
            uri: format!("{}/{}", self.uri_prefix.trim_end_matches('/'), relative),
        }
    }

    async fn put_atomic(&self, relative: &str, bytes: Vec<u8>) -> Result<FileLocation, StorageError> {
        let path = Self::object_path(relative)?;
        let len = bytes.len();
        if len > self.multipart_threshold {
            self.put_multipart(&path, bytes).await?;
        } else {
            self.store
                .put_opts(
                    &path,
                    PutPayload::from(bytes),
                    PutOptions {
                        mode: PutMode::Overwrite,
                        ..Default::default()
                    },
                )
                .await?;
        }
        debug!(%path, bytes = len, "published snapshot object");
        Ok(self.location(relative))
    }

    async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let path = Self::object_path(relative)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = Self::object_path(prefix)?;
        let objects = self
            .store
            .list(Some(&prefix))
            .try_collect::<Vec<_>>()
            .await?;
        let mut out = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }

    async fn delete(&self, relative: &str) -> Result<(), StorageError> {
        let path = Self::object_path(relative)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Where snapshot files are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
        allow_http: bool,
    },
}

impl StorageBackend {
    /// Builds the configured store. S3 credentials come from the standard AWS environment.
    pub fn open(&self) -> Result<Arc<dyn SnapshotStore>, StorageError> {
        match self {
            StorageBackend::Local { root } => Ok(Arc::new(LocalSnapshotStore::new(root.clone()))),
            StorageBackend::S3 {
                bucket,
                prefix,
                region,
                endpoint,
                allow_http,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_allow_http(*allow_http);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = builder.build()?;

                let mut uri = format!("s3://{bucket}");
                let store: Arc<dyn ObjectStore> = match prefix.as_deref().map(|p| p.trim_matches('/')) {
                    Some(prefix) if !prefix.is_empty() => {
                        uri = format!("{uri}/{prefix}");
                        Arc::new(PrefixStore::new(s3, prefix))
                    }
                    _ => Arc::new(s3),
                };
                Ok(Arc::new(ObjectSnapshotStore::new(store, uri)))
            }
        }
    }
}
