//! Binary/file store used for declared file fields.

use crate::error::{StoreError, StoreResult};
use crate::storage::backend::Row;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub mod http;
pub mod local;

pub use http::HttpFileStore;
pub use local::{content_digest, LocalFileStore};

/// Options passed along with an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Storage variant (bucket/folder) declared by the field's file policy.
    pub variant: Option<String>,
    /// Public values of the owning record, available for URI templating.
    pub uri_values: Row,
    pub overwrite: bool,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Stores `content` under `name` and returns its reference URI.
    async fn upload(&self, name: &str, content: &[u8], options: &UploadOptions) -> StoreResult<String>;
}

/// Turns a file field's string value into bytes.
///
/// `data:<mime>;base64,<payload>` values are decoded, anything else is taken
/// as UTF-8 text.
pub fn decode_content(raw: &str) -> StoreResult<Vec<u8>> {
    if let Some(rest) = raw.strip_prefix("data:") {
        if let Some((_, payload)) = rest.split_once(";base64,") {
            return STANDARD
                .decode(payload.trim())
                .map_err(|e| StoreError::Decode(format!("invalid base64 payload: {}", e)));
        }
    }
    Ok(raw.as_bytes().to_vec())
}

/// Joins an optional variant and a name into an object path.
pub(crate) fn object_path(variant: Option<&str>, name: &str) -> String {
    match variant.filter(|v| !v.is_empty()) {
        Some(v) => format!("{}/{}", v.trim_matches('/'), name),
        None => name.to_string(),
    }
}

/// Keeps uploads in memory. Mostly useful for tests.
#[derive(Default)]
pub struct MemoryFileStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn upload(&self, name: &str, content: &[u8], options: &UploadOptions) -> StoreResult<String> {
        let path = object_path(options.variant.as_deref(), name);
        let mut objects = self.objects.write().await;
        if !options.overwrite && objects.get(&path).is_some_and(|existing| existing != content) {
            return Err(StoreError::Duplicate(path));
        }
        objects.insert(path.clone(), content.to_vec());
        Ok(format!("memory://{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content() {
        assert_eq!(decode_content("data:text/plain;base64,aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_content("plain text").unwrap(), b"plain text");
        assert!(decode_content("data:image/png;base64,@@@").is_err());
    }

    #[test]
    fn test_object_path() {
        assert_eq!(object_path(Some("/avatars/"), "a.png"), "avatars/a.png");
        assert_eq!(object_path(None, "a.png"), "a.png");
        assert_eq!(object_path(Some(""), "a.png"), "a.png");
    }

    #[tokio::test]
    async fn test_memory_store_rejects_conflicting_content_without_overwrite() {
        let store = MemoryFileStore::new();
        let opts = UploadOptions::default();
        assert_eq!(store.upload("a", b"1", &opts).await.unwrap(), "memory://a");
        assert!(store.upload("a", b"2", &opts).await.is_err());

        let overwrite = UploadOptions { overwrite: true, ..Default::default() };
        store.upload("a", b"2", &overwrite).await.unwrap();
        assert_eq!(store.object("a").await.unwrap(), b"2");
    }
}
