use super::{FieldValue, Record, SharedRecord};
use crate::domain::schema::SchemaDescriptor;
use crate::error::{Fault, FaultResult};
use crate::storage::backend::Row;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

const TYPED_FIELDS: [&str; 6] = ["id", "uuid", "status", "created", "updated", "creator"];

/// Detail list from a comma-separated string or an array of names.
pub(crate) fn parse_detail(value: &JsonValue) -> Vec<String> {
    let names: Vec<&str> = match value {
        JsonValue::String(s) => s.split(',').collect(),
        JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    };
    names
        .into_iter()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// Detail re-requested below `field` through dotted paths (`topic.owner`).
fn nested_detail(detail: &[String], field: &str) -> Vec<String> {
    detail
        .iter()
        .filter_map(|d| d.strip_prefix(field)?.strip_prefix('.'))
        .map(str::to_string)
        .collect()
}

fn looks_like_json(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with('{') || s.starts_with('[')
}

/// A relation as its uuid, or as a nested projection when detailed.
///
/// The lock is released before nested fields are projected. Each level only
/// follows the dotted remainder of its detail list.
fn serialize_relation(record: SharedRecord, detailed: bool, nested: Vec<String>) -> BoxFuture<'static, FaultResult<JsonValue>> {
    async move {
        let snapshot = {
            let mut record = record.lock().await;
            if detailed {
                if !record.is_hydrated() {
                    record.fill().await?;
                }
                record.snapshot()
            } else {
                if record.uuid().is_none() {
                    record.fill().await?;
                }
                return Ok(record
                    .uuid()
                    .map(|u| JsonValue::String(u.to_string()))
                    .unwrap_or(JsonValue::Null));
            }
        };
        Ok(JsonValue::Object(snapshot.project(nested).await?))
    }
    .boxed()
}

/// Owned copy of what a projection reads, detached from the record's lock.
struct Snapshot {
    schema: Arc<SchemaDescriptor>,
    typed: Row,
    fields: BTreeMap<String, FieldValue>,
}

impl Snapshot {
    /// Projects exactly the declared public fields.
    ///
    /// Relations collapse to their uuid unless named in `detail`. Fields are
    /// projected concurrently and one failing field becomes null without
    /// aborting the rest.
    fn project(self, detail: Vec<String>) -> BoxFuture<'static, FaultResult<Row>> {
        async move {
            let (this, detail) = (&self, &detail);
            let projections = this.schema.values.iter().map(|field| async move {
                let value = match this.project_field(field, detail).await {
                    Ok(value) => value,
                    Err(fault) => {
                        tracing::warn!(entity = %this.schema.entity, field = %field, error = %fault, "field projection failed");
                        JsonValue::Null
                    }
                };
                (field.clone(), value)
            });
            Ok(join_all(projections).await.into_iter().collect())
        }
        .boxed()
    }

    async fn project_field(&self, field: &str, detail: &[String]) -> FaultResult<JsonValue> {
        if TYPED_FIELDS.contains(&field) {
            return Ok(self.typed.get(field).cloned().unwrap_or(JsonValue::Null));
        }
        let detailed = detail.iter().any(|d| d == field);
        match self.fields.get(field) {
            None => Ok(JsonValue::Null),
            Some(FieldValue::Value(JsonValue::String(s))) if looks_like_json(s) => {
                Ok(serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone())))
            }
            Some(FieldValue::Value(value)) => Ok(value.clone()),
            Some(FieldValue::Relation(record)) => {
                serialize_relation(record.clone(), detailed, nested_detail(detail, field)).await
            }
            Some(FieldValue::Relations(records)) => {
                let nested = nested_detail(detail, field);
                let items = try_join_all(
                    records
                        .iter()
                        .map(|r| serialize_relation(r.clone(), detailed, nested.clone())),
                )
                .await?;
                Ok(JsonValue::Array(items))
            }
        }
    }
}

impl Record {
    /// Public values, using the record's or the descriptor's detail list.
    pub async fn values(&self) -> FaultResult<Row> {
        let detail = self
            .detailed_values
            .clone()
            .unwrap_or_else(|| self.schema.detailed_values.clone());
        self.values_with(detail).await
    }

    /// Projects exactly the declared public fields, expanding the relations
    /// named in `detail` (dotted paths reach deeper).
    pub fn values_with(&self, detail: Vec<String>) -> BoxFuture<'static, FaultResult<Row>> {
        self.snapshot().project(detail)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            schema: self.schema.clone(),
            typed: TYPED_FIELDS
                .iter()
                .filter_map(|f| self.get(f).map(|v| (f.to_string(), v)))
                .collect(),
            fields: self.fields.clone(),
        }
    }

    /// The JSON text of [`Record::values`].
    pub async fn to_json(&self) -> FaultResult<String> {
        let values = self.values().await?;
        serde_json::to_string(&values).map_err(|err| Fault::server("Unable to parse values").with_cause(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_detail() {
        assert_eq!(parse_detail(&json!("topic, owner ,")), vec!["topic", "owner"]);
        assert_eq!(parse_detail(&json!(["topic"])), vec!["topic"]);
        assert!(parse_detail(&json!(null)).is_empty());
    }

    #[test]
    fn test_nested_detail_follows_dotted_paths() {
        let detail = vec!["topic".to_string(), "topic.owner".to_string(), "topics.x".to_string()];
        assert_eq!(nested_detail(&detail, "topic"), vec!["owner"]);
        assert!(nested_detail(&detail, "owner").is_empty());
    }

    #[test]
    fn test_looks_like_json() {
        assert!(looks_like_json(" {\"a\":1}"));
        assert!(looks_like_json("[1]"));
        assert!(!looks_like_json("plain"));
    }
}
