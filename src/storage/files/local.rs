//! File store writing objects below a local root directory.

use crate::error::{StoreError, StoreResult};
use crate::storage::files::{object_path, FileStore, UploadOptions};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

// Domain separation so digests of uploads never collide with other hashed data.
const CONTENT_DOMAIN: &[u8] = b"RECORDFILE";

/// Hex SHA-256 digest of an upload's bytes.
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CONTENT_DOMAIN);
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Local directory store. Returned URIs carry a content version so that
/// re-uploads under the same name bust downstream caches.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    base_uri: String,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>, base_uri: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.is_empty() {
            return Err(StoreError::Invalid(format!("invalid object path '{}'", relative)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn upload(&self, name: &str, content: &[u8], options: &UploadOptions) -> StoreResult<String> {
        let relative = object_path(options.variant.as_deref(), name);
        let path = self.resolve(&relative)?;
        let digest = content_digest(content);

        if !options.overwrite {
            if let Ok(existing) = tokio::fs::read(&path).await {
                if content_digest(&existing) != digest {
                    return Err(StoreError::Duplicate(relative));
                }
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(format!("{}/{}?v={}", self.base_uri, relative, &digest[..16]))
    }
}
