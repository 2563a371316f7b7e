//! Centralized configuration (environment variables + defaults).

use anyhow::Context;
use std::time::Duration;

/// Loads `.env` (if present) into the process environment.
pub fn load_env() {
    dotenv::dotenv().ok();
}

/// Database URL must be provided (no default) for safety.
pub fn database_url() -> anyhow::Result<String> {
    std::env::var("DATABASE_URL").context("DATABASE_URL must be set")
}

/// Maximum pooled Postgres connections (default 5).
pub fn database_max_connections() -> anyhow::Result<u32> {
    match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(v) => v
            .parse::<u32>()
            .map(|n| n.max(1))
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32"),
        Err(_) => Ok(5),
    }
}

/// Which cache store backs the read-through cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Postgres,
    Disabled,
}

/// `RECORD_CACHE` = memory | postgres | none (default memory).
pub fn cache_backend() -> anyhow::Result<CacheBackend> {
    let raw = std::env::var("RECORD_CACHE").unwrap_or_else(|_| "memory".to_string());
    match raw.to_lowercase().as_str() {
        "memory" => Ok(CacheBackend::Memory),
        "postgres" => Ok(CacheBackend::Postgres),
        "none" | "off" | "disabled" => Ok(CacheBackend::Disabled),
        other => Err(anyhow::anyhow!(
            "RECORD_CACHE must be one of memory, postgres, none (got '{}')",
            other
        )),
    }
}

/// Optional TTL applied to cache entries.
pub fn cache_ttl() -> anyhow::Result<Option<Duration>> {
    match std::env::var("RECORD_CACHE_TTL_SECS") {
        Ok(v) => {
            let secs = v
                .parse::<u64>()
                .context("RECORD_CACHE_TTL_SECS must be a valid u64")?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Root directory for the local file store (tilde-expanded).
pub fn file_store_root() -> String {
    let raw = std::env::var("FILE_STORE_ROOT").unwrap_or_else(|_| "~/.record-kernel/files".to_string());
    shellexpand::tilde(&raw).to_string()
}

/// Base URI returned for uploaded files (default `file://<root>`).
pub fn file_store_base_uri() -> String {
    std::env::var("FILE_STORE_BASE_URI").unwrap_or_else(|_| format!("file://{}", file_store_root()))
}

/// Remote upload endpoint. When set, uploads are sent over HTTP.
pub fn file_store_endpoint() -> Option<String> {
    std::env::var("FILE_STORE_ENDPOINT").ok().filter(|v| !v.trim().is_empty())
}

/// Whether relation misses surface as client faults by default.
pub fn strict_relations() -> bool {
    std::env::var("RECORD_STRICT_RELATIONS").unwrap_or_default() == "true"
}
