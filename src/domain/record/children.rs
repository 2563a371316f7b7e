use super::{FieldValue, Record};
use crate::error::{Fault, FaultResult};
use crate::storage::backend::Query;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;

impl Record {
    /// Aggregates every declared child collection into its array field.
    ///
    /// Collections are fetched concurrently; uuids are merged without
    /// duplicates. One failing collection fails the whole aggregation.
    pub async fn childrens(&mut self) -> FaultResult<()> {
        if self.schema.childrens.is_empty() {
            return Ok(());
        }
        let id = self.id.ok_or_else(|| {
            Fault::client(format!("{} requires an id to aggregate children", self.schema.entity))
        })?;

        let mut queries = Vec::with_capacity(self.schema.childrens.len());
        for (field, child) in &self.schema.childrens {
            let target = self.service.schema(&child.entity)?;
            let query = Query::table(&target.table)
                .where_eq(&child.column, id)
                .select(target.column("uuid"), Some("uuid"));
            queries.push((field.clone(), query));
        }

        let backend = self.service.backend().clone();
        let fetched = try_join_all(queries.into_iter().map(|(field, query)| {
            let backend = backend.clone();
            async move {
                backend
                    .get(&query)
                    .await
                    .map(|rows| (field, rows))
                    .map_err(|err| Fault::server("Query error").with_cause(err))
            }
        }))
        .await?;

        for (field, rows) in fetched {
            let mut uuids = match self.fields.remove(&field) {
                Some(FieldValue::Value(JsonValue::Array(items))) => items,
                _ => Vec::new(),
            };
            for uuid in rows.into_iter().filter_map(|mut row| row.remove("uuid")) {
                if !uuid.is_null() && !uuids.contains(&uuid) {
                    uuids.push(uuid);
                }
            }
            self.fields.insert(field, FieldValue::Value(JsonValue::Array(uuids)));
        }
        Ok(())
    }
}
