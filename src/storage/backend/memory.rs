//! In-process query backend.
//!
//! Tables are vectors of JSON rows behind a `tokio` lock. Used by the test
//! suite and by embedders that want the record engine without a database.

use crate::error::{StoreError, StoreResult};
use crate::storage::backend::{json_to_u64, InsertOutcome, Query, QueryBackend, Row, Where};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct Table {
    rows: Vec<Row>,
    next_id: u64,
}

#[derive(Debug, Clone)]
struct AuditColumns {
    created: String,
    updated: String,
}

/// Backend keeping every table in memory.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
    uniques: HashMap<String, HashSet<String>>,
    audit: HashMap<String, AuditColumns>,
    fail_next: Mutex<Option<StoreError>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a unique column; conflicting inserts/updates fail with `StoreError::Duplicate`.
    pub fn with_unique(mut self, table: &str, column: &str) -> Self {
        self.uniques
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
        self
    }

    /// Columns the backend stamps with the current time on insert/update.
    pub fn with_audit_columns(mut self, table: &str, created: &str, updated: &str) -> Self {
        self.audit.insert(
            table.to_string(),
            AuditColumns {
                created: created.to_string(),
                updated: updated.to_string(),
            },
        );
        self
    }

    /// Inserts rows verbatim (ids included) without touching the counters.
    pub async fn seed(&self, table: &str, id_column: &str, rows: Vec<Row>) {
        let mut tables = self.tables.write().await;
        let t = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.get(id_column).and_then(json_to_u64) {
                t.next_id = t.next_id.max(id);
            }
            t.rows.push(row);
        }
    }

    /// Snapshot of a table's rows.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.read().await;
        tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    /// Makes the next backend call fail with `err`.
    pub async fn fail_next(&self, err: StoreError) {
        *self.fail_next.lock().await = Some(err);
    }

    /// Number of `get`/`get_one` calls served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `insert`/`update` calls served.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn take_failure(&self) -> StoreResult<()> {
        match self.fail_next.lock().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_uniques(&self, table: &str, rows: &[Row], candidate: &Row, skip: Option<usize>) -> StoreResult<()> {
        let Some(columns) = self.uniques.get(table) else {
            return Ok(());
        };
        for column in columns {
            let Some(value) = candidate.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = rows
                .iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != skip)
                .any(|(_, row)| row.get(column).is_some_and(|v| loose_eq(v, value)));
            if clash {
                return Err(StoreError::Duplicate(format!("{}.{}", table, column)));
            }
        }
        Ok(())
    }
}

/// Equality that tolerates numbers stored as strings and vice versa.
fn loose_eq(a: &JsonValue, b: &JsonValue) -> bool {
    if a == b {
        return true;
    }
    match (scalar_text(a), scalar_text(b)) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(&y),
        _ => false,
    }
}

fn scalar_text(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn matches(row: &Row, wheres: &[Where]) -> bool {
    wheres.iter().all(|w| match row.get(&w.column) {
        Some(v) => loose_eq(v, &w.value),
        None => w.value.is_null(),
    })
}

fn project(row: &Row, query: &Query) -> Row {
    if query.fields.is_empty() {
        return row.clone();
    }
    query
        .fields
        .iter()
        .map(|p| {
            let value = row.get(&p.column).cloned().unwrap_or(JsonValue::Null);
            (p.output_name().to_string(), value)
        })
        .collect()
}

#[async_trait]
impl QueryBackend for MemoryBackend {
    async fn get(&self, query: &Query) -> StoreResult<Vec<Row>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let tables = self.tables.read().await;
        let Some(table) = tables.get(&query.table) else {
            return Ok(Vec::new());
        };
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(table
            .rows
            .iter()
            .filter(|row| matches(row, &query.wheres))
            .take(limit)
            .map(|row| project(row, query))
            .collect())
    }

    async fn insert(&self, table: &str, id_column: &str, data: &Row) -> StoreResult<InsertOutcome> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let mut tables = self.tables.write().await;
        let t = tables.entry(table.to_string()).or_default();
        self.check_uniques(table, &t.rows, data, None)?;

        let mut row = data.clone();
        let insert_id = match row.get(id_column).and_then(json_to_u64) {
            Some(id) => {
                t.next_id = t.next_id.max(id);
                id
            }
            None => {
                t.next_id += 1;
                row.insert(id_column.to_string(), JsonValue::from(t.next_id));
                t.next_id
            }
        };
        if let Some(audit) = self.audit.get(table) {
            let now = JsonValue::String(Utc::now().to_rfc3339());
            row.insert(audit.created.clone(), now.clone());
            row.insert(audit.updated.clone(), now);
        }
        t.rows.push(row);
        Ok(InsertOutcome { insert_id })
    }

    async fn update(&self, query: &Query, data: &Row) -> StoreResult<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let mut tables = self.tables.write().await;
        let Some(t) = tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let targets: Vec<usize> = t
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| matches(row, &query.wheres))
            .map(|(idx, _)| idx)
            .collect();

        for idx in &targets {
            let mut merged = t.rows[*idx].clone();
            for (k, v) in data {
                merged.insert(k.clone(), v.clone());
            }
            self.check_uniques(&query.table, &t.rows, &merged, Some(*idx))?;
            if let Some(audit) = self.audit.get(&query.table) {
                merged.insert(audit.updated.clone(), JsonValue::String(Utc::now().to_rfc3339()));
            }
            t.rows[*idx] = merged;
        }
        Ok(targets.len() as u64)
    }
}
