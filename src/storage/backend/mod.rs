//! Query backend contract consumed by records.
//!
//! The core never builds SQL itself. It describes *what* to fetch or write
//! with a [`Query`] and leaves the dialect to an implementation.

use crate::error::StoreResult;
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// A row as returned by (or sent to) a backend, keyed by column name.
pub type Row = Map<String, JsonValue>;

/// Equality predicate on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Where {
    pub column: String,
    pub value: JsonValue,
}

/// A column to return, optionally renamed.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub column: String,
    pub alias: Option<String>,
}

impl Projection {
    /// Name the column takes in the returned row.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }
}

/// A single backend query: table, accumulated predicates, projection, limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub wheres: Vec<Where>,
    pub fields: Vec<Projection>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            wheres: Vec::new(),
            fields: Vec::new(),
            limit: None,
        }
    }

    /// Adds a predicate; all predicates are AND-ed.
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.wheres.push(Where {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_wheres(mut self, wheres: impl IntoIterator<Item = Where>) -> Self {
        self.wheres.extend(wheres);
        self
    }

    pub fn select(mut self, column: impl Into<String>, alias: Option<&str>) -> Self {
        self.fields.push(Projection {
            column: column.into(),
            alias: alias.map(str::to_string),
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub insert_id: u64,
}

/// Relational store the records read from and write to.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Returns every row matching the query.
    async fn get(&self, query: &Query) -> StoreResult<Vec<Row>>;

    /// Returns the first row matching the query, if any.
    async fn get_one(&self, query: &Query) -> StoreResult<Option<Row>> {
        let query = query.clone().limit(1);
        Ok(self.get(&query).await?.into_iter().next())
    }

    /// Inserts a row and returns the backend-assigned numeric id read from `id_column`.
    async fn insert(&self, table: &str, id_column: &str, data: &Row) -> StoreResult<InsertOutcome>;

    /// Updates every row matching the query and returns the affected count.
    async fn update(&self, query: &Query, data: &Row) -> StoreResult<u64>;

    /// Resolves a uuid to the numeric row id of `table`.
    async fn stage_id_from_uuid(
        &self,
        uuid: &Uuid,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Option<u64>> {
        let id_column = format!("{}id", prefix);
        let query = Query::table(table)
            .where_eq(format!("{}uuid", prefix), uuid.to_string())
            .select(id_column.clone(), Some("id"));
        let row = self.get_one(&query).await?;
        Ok(row.as_ref().and_then(|r| r.get("id")).and_then(json_to_u64))
    }
}

/// Reads a non-negative integer from a JSON number or numeric string.
pub fn json_to_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_builder_accumulates_predicates() {
        let q = Query::table("topics")
            .where_eq("topic_id", 4)
            .where_eq("topic_uuid", "abc")
            .select("topic_uuid", Some("uuid"))
            .limit(3);
        assert_eq!(q.wheres.len(), 2);
        assert_eq!(q.wheres[0].value, json!(4));
        assert_eq!(q.fields[0].output_name(), "uuid");
        assert_eq!(q.limit, Some(3));
    }

    #[test]
    fn test_json_to_u64() {
        assert_eq!(json_to_u64(&json!(12)), Some(12));
        assert_eq!(json_to_u64(&json!("12")), Some(12));
        assert_eq!(json_to_u64(&json!(-1)), None);
        assert_eq!(json_to_u64(&json!("abc")), None);
        assert_eq!(json_to_u64(&json!(null)), None);
    }
}
