//! Postgres query backend built on a `sqlx` connection pool.
//!
//! Queries are assembled dynamically with `QueryBuilder`. Rows come back as
//! `row_to_json(...)` so the engine sees the same JSON shape whatever the
//! column types are. Bound values are cast to the column's declared type,
//! which is looked up once per table from `information_schema`.

use crate::error::{StoreError, StoreResult};
use crate::storage::backend::{json_to_u64, InsertOutcome, Query, QueryBackend, Row, Where};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Backend issuing SQL against Postgres.
pub struct PgBackend {
    pool: PgPool,
    column_types: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            column_types: RwLock::new(HashMap::new()),
        }
    }

    /// Connects a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cast suffix per column, loaded lazily from `information_schema.columns`.
    async fn casts_for(&self, table: &str) -> StoreResult<HashMap<String, String>> {
        if let Some(types) = self.column_types.read().await.get(table) {
            return Ok(types.clone());
        }

        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut types = HashMap::new();
        for r in rows {
            let column: String = r.try_get("column_name")?;
            let data_type: String = r.try_get("data_type")?;
            if let Some(cast) = sql_cast(&data_type) {
                types.insert(column, cast.to_string());
            }
        }

        self.column_types
            .write()
            .await
            .insert(table.to_string(), types.clone());
        Ok(types)
    }
}

/// Maps an `information_schema` data type to the cast used on bound values.
fn sql_cast(data_type: &str) -> Option<&'static str> {
    match data_type.to_lowercase().as_str() {
        "uuid" => Some("uuid"),
        "timestamp with time zone" => Some("timestamptz"),
        "timestamp without time zone" => Some("timestamp"),
        "date" => Some("date"),
        "jsonb" => Some("jsonb"),
        "json" => Some("json"),
        "smallint" => Some("int2"),
        "integer" => Some("int4"),
        "bigint" => Some("int8"),
        "numeric" => Some("numeric"),
        "double precision" => Some("float8"),
        "boolean" => Some("bool"),
        "text" | "character varying" | "character" => Some("text"),
        _ => None,
    }
}

pub(crate) fn validate_ident(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ident(name: &str) -> StoreResult<&str> {
    if validate_ident(name) {
        Ok(name)
    } else {
        Err(StoreError::Invalid(format!("invalid identifier '{}'", name)))
    }
}

/// Binds one JSON value, cast to the column type when it is known.
fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &JsonValue, cast: Option<&str>) {
    match value {
        JsonValue::Null => {
            qb.push("NULL");
            return;
        }
        JsonValue::Bool(b) => {
            qb.push_bind(*b);
        }
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i);
            } else if let Some(f) = n.as_f64() {
                qb.push_bind(f);
            } else {
                qb.push_bind(n.to_string());
            }
        }
        JsonValue::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            if matches!(cast, Some("jsonb") | Some("json")) {
                qb.push_bind(other.clone());
            } else {
                qb.push_bind(other.to_string());
            }
        }
    }
    if let Some(cast) = cast {
        qb.push("::").push(cast);
    }
}

fn push_wheres(
    qb: &mut QueryBuilder<'_, Postgres>,
    wheres: &[Where],
    casts: &HashMap<String, String>,
) -> StoreResult<()> {
    if wheres.is_empty() {
        return Ok(());
    }
    qb.push(" WHERE ");
    for (idx, w) in wheres.iter().enumerate() {
        if idx > 0 {
            qb.push(" AND ");
        }
        let column = ident(&w.column)?;
        if w.value.is_null() {
            qb.push(column).push(" IS NULL");
            continue;
        }
        match casts.get(column) {
            Some(cast) => {
                qb.push(column).push(" = ");
                push_value(qb, &w.value, Some(cast));
            }
            None => {
                qb.push(column).push("::text = ");
                let text = match &w.value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                qb.push_bind(text);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl QueryBackend for PgBackend {
    async fn get(&self, query: &Query) -> StoreResult<Vec<Row>> {
        let table = ident(&query.table)?;
        let casts = self.casts_for(table).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT row_to_json(sub.*) AS record FROM (SELECT ");
        if query.fields.is_empty() {
            qb.push("*");
        } else {
            for (idx, p) in query.fields.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                qb.push(ident(&p.column)?);
                if let Some(alias) = &p.alias {
                    qb.push(" AS ").push(ident(alias)?);
                }
            }
        }
        qb.push(" FROM ").push(table);
        push_wheres(&mut qb, &query.wheres, &casts)?;
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        qb.push(") sub");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record: JsonValue = row.try_get("record")?;
            match record {
                JsonValue::Object(map) => out.push(map),
                other => {
                    return Err(StoreError::Decode(format!(
                        "expected a JSON object row, got {}",
                        other
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn insert(&self, table: &str, id_column: &str, data: &Row) -> StoreResult<InsertOutcome> {
        let table = ident(table)?;
        let id_column = ident(id_column)?;
        let casts = self.casts_for(table).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO ");
        qb.push(table);
        if data.is_empty() {
            qb.push(" DEFAULT VALUES");
        } else {
            qb.push(" (");
            for (idx, column) in data.keys().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                qb.push(ident(column)?);
            }
            qb.push(") VALUES (");
            for (idx, (column, value)) in data.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                push_value(&mut qb, value, casts.get(column).map(String::as_str));
            }
            qb.push(")");
        }
        qb.push(" RETURNING ").push(id_column).push("::text AS insert_id");

        let row = qb.build().fetch_one(&self.pool).await?;
        let raw: String = row.try_get("insert_id")?;
        let insert_id = json_to_u64(&JsonValue::String(raw.clone()))
            .ok_or_else(|| StoreError::Decode(format!("non-numeric id '{}' returned by insert", raw)))?;
        Ok(InsertOutcome { insert_id })
    }

    async fn update(&self, query: &Query, data: &Row) -> StoreResult<u64> {
        if data.is_empty() {
            return Err(StoreError::Invalid("update requires at least one column".into()));
        }
        if query.wheres.is_empty() {
            return Err(StoreError::Invalid("update requires at least one predicate".into()));
        }
        let table = ident(&query.table)?;
        let casts = self.casts_for(table).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE ");
        qb.push(table).push(" SET ");
        for (idx, (column, value)) in data.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            qb.push(ident(column)?).push(" = ");
            push_value(&mut qb, value, casts.get(column).map(String::as_str));
        }
        push_wheres(&mut qb, &query.wheres, &casts)?;

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_ident() {
        assert!(validate_ident("notification_topic_id"));
        assert!(validate_ident("_hidden"));
        assert!(!validate_ident("1abc"));
        assert!(!validate_ident("name; DROP TABLE x"));
        assert!(!validate_ident(""));
    }

    #[test]
    fn test_sql_cast_mapping() {
        assert_eq!(sql_cast("uuid"), Some("uuid"));
        assert_eq!(sql_cast("timestamp with time zone"), Some("timestamptz"));
        assert_eq!(sql_cast("BIGINT"), Some("int8"));
        assert_eq!(sql_cast("tsvector"), None);
    }

    #[test]
    fn test_wheres_cast_known_columns_and_text_compare_unknown() {
        let mut casts = HashMap::new();
        casts.insert("topic_uuid".to_string(), "uuid".to_string());
        let wheres = vec![
            Where { column: "topic_uuid".into(), value: json!("5f0c") },
            Where { column: "topic_slug".into(), value: json!("news") },
            Where { column: "topic_parent".into(), value: JsonValue::Null },
        ];
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM topics");
        push_wheres(&mut qb, &wheres, &casts).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT * FROM topics WHERE topic_uuid = $1::uuid AND topic_slug::text = $2 AND topic_parent IS NULL"
        );
    }

    #[test]
    fn test_wheres_reject_unsafe_columns() {
        let wheres = vec![Where { column: "x = 1 OR 1".into(), value: json!(1) }];
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1");
        assert!(matches!(
            push_wheres(&mut qb, &wheres, &HashMap::new()),
            Err(StoreError::Invalid(_))
        ));
    }
}
