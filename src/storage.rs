//! Object storage adapters.
//!
//! [`FsObjectStore`] serves a local mirror of the Level 0 bucket, laid out
//! exactly like the bucket keys (`<root>/<object_key>`). The S3 adapter
//! lives in [`storage_s3`](crate::storage_s3). [`build_object_store`] picks
//! one from `[storage].backend`.
//!
//! A local mirror keeps no history, so every version token resolves to the
//! current file, except `etag:` tokens: those only match while the file's
//! content hash is unchanged.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use level0_core::error::ReadError;
use level0_core::event::ETAG_VERSION_PREFIX;
use level0_core::ports::{ObjectStore, StoredObject};

use crate::config::Config;
use crate::storage_s3::S3ObjectStore;

pub fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend.as_str() {
        "filesystem" => {
            let root = config
                .storage
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.root is not set"))?;
            Ok(Arc::new(FsObjectStore::new(root)))
        }
        "s3" => Ok(Arc::new(S3ObjectStore::from_config(&config.storage)?)),
        other => anyhow::bail!("Unknown storage backend: '{}'", other),
    }
}

/// Entity tag of a mirrored file: the first 32 hex chars of its SHA-256.
pub fn content_etag(bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    digest[..32].to_string()
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, refusing keys that escape it.
    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn read(&self, key: &str, version: &str) -> Result<Vec<u8>, ReadError> {
        let not_found = || ReadError::NotFound {
            key: key.to_string(),
            version: version.to_string(),
        };
        let path = self.path_for(key).ok_or_else(not_found)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(ReadError::Unavailable(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if let Some(expected) = version.strip_prefix(ETAG_VERSION_PREFIX) {
            if content_etag(&bytes) != expected {
                return Err(not_found());
            }
        }
        Ok(bytes)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ReadError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || scan_prefix(&root, &prefix))
            .await
            .map_err(|e| ReadError::Unavailable(format!("listing task failed: {}", e)))?
    }
}

fn scan_prefix(root: &Path, prefix: &str) -> Result<Vec<StoredObject>, ReadError> {
    let start = match prefix.rsplit_once('/') {
        Some((dir, _)) => root.join(dir),
        None => root.to_path_buf(),
    };
    if !start.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&start) {
        let entry = entry.map_err(|e| ReadError::Unavailable(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) {
            continue;
        }

        let bytes = std::fs::read(path).map_err(|e| ReadError::Unavailable(e.to_string()))?;
        let last_modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        objects.push(StoredObject {
            key,
            etag: Some(content_etag(&bytes)),
            size: bytes.len() as u64,
            last_modified,
        });
    }

    // Sort for deterministic ordering
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}
