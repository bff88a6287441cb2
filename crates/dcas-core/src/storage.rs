//! Storage backend abstraction for pipeline artifacts.
//!
//! The pipeline reads registries and weather snapshots and writes parquet
//! partitions, error logs, and CSV exports through this contract. Backends
//! cover object stores and the local filesystem; the memory backend is for
//! tests.
//!
//! Paths are forward-slash object keys relative to the backend root. `put`
//! returns the backend's URI for the stored object so delivery stages can
//! report where an artifact landed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key) relative to the backend root.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Content type recorded at write time, when the backend tracks it.
    pub content_type: Option<String>,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for pipeline inputs and outputs.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object, replacing any existing content.
    ///
    /// Returns the backend URI of the stored object.
    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> Result<String>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Returns an empty vec if no objects match. Ordering is arbitrary;
    /// callers requiring deterministic order should sort the results.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Deletes every object under a prefix. Idempotent.
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for meta in self.list(prefix).await? {
            self.delete(&meta.path).await?;
        }
        Ok(())
    }
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> Result<String> {
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(format!("memory://{path}"))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                content_type: Some(obj.content_type.clone()),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            content_type: Some(obj.content_type.clone()),
            last_modified: Some(obj.last_modified),
        }))
    }
}

/// Local filesystem backend rooted at a directory.
///
/// Object keys map to paths under the root. Used for scratch space and for
/// runs that keep their products on disk instead of an object store.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily
    /// on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the backend's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Keys are relative forward-slash paths; reject traversal.
        if path.split('/').any(|seg| seg == "..") || path.starts_with('/') {
            return Err(Error::InvalidInput(format!("invalid object key: {path}")));
        }
        Ok(self.root.join(path))
    }

    fn relative_key(&self, full: &Path) -> Option<String> {
        full.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage(format!("read failed: {path}"), e)),
        }
    }

    async fn put(&self, path: &str, data: Bytes, _content_type: &str) -> Result<String> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("mkdir failed: {}", parent.display()), e))?;
        }
        tokio::fs::write(&full, &data)
            .await
            .map_err(|e| Error::storage(format!("write failed: {path}"), e))?;
        Ok(format!("file://{}", full.display()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("delete failed: {path}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Walk from the deepest existing directory implied by the prefix.
        let start = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::storage(format!("list failed: {}", dir.display()), e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage("list failed", e))?
            {
                let full = entry.path();
                if full.is_dir() {
                    stack.push(full);
                    continue;
                }
                let Some(key) = self.relative_key(&full) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::storage(format!("stat failed: {key}"), e))?;
                results.push(ObjectMeta {
                    path: key,
                    size: meta.len(),
                    content_type: None,
                    last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
        Ok(results)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: meta.len(),
                content_type: None,
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("stat failed: {path}"), e)),
        }
    }
}
