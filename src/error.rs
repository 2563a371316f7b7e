//! Faults returned by record operations and errors returned by collaborators.
//!
//! A [`Fault`] is a result value, not a panic: it names who is to blame
//! (`client` or `server`), carries a human message and a `data` payload with an
//! optional HTTP-style status code, the aggregated per-field validation errors
//! and the originating error, so a transport layer can map it to a response
//! without re-inspecting internals.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type for record operations.
pub type FaultResult<T> = Result<T, Fault>;

/// Result type for collaborator (backend, cache, file store) operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Who is responsible for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Client,
    Server,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Client => f.write_str("client"),
            FaultKind::Server => f.write_str("server"),
        }
    }
}

/// Structured payload attached to a [`Fault`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FaultData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// A structured client/server error result.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{fault} fault: {message}")]
pub struct Fault {
    pub fault: FaultKind,
    #[serde(rename = "msg")]
    pub message: String,
    pub data: FaultData,
}

impl Fault {
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            fault: FaultKind::Client,
            message: message.into(),
            data: FaultData::default(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            fault: FaultKind::Server,
            message: message.into(),
            data: FaultData::default(),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.data.code = Some(code);
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.data.cause = Some(cause.to_string());
        self
    }

    pub fn with_errors(mut self, errors: BTreeMap<String, String>) -> Self {
        self.data.errors = errors;
        self
    }

    pub fn is_client(&self) -> bool {
        self.fault == FaultKind::Client
    }

    pub fn is_server(&self) -> bool {
        self.fault == FaultKind::Server
    }

    /// HTTP-style status code for this fault.
    pub fn status_code(&self) -> u16 {
        match (self.data.code, self.fault) {
            (Some(code), _) => code,
            (None, FaultKind::Client) => 400,
            (None, FaultKind::Server) => 500,
        }
    }

    /// Maps a failed backend write to the fault surfaced to the caller.
    pub(crate) fn from_write_error(err: StoreError, message: &str) -> Self {
        match err {
            StoreError::Duplicate(_) => Fault::client("Duplicated entry")
                .with_code(409)
                .with_cause(err),
            other => Fault::server(message).with_cause(other),
        }
    }
}

/// Errors raised by the query backend, cache store and file store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Duplicate(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
