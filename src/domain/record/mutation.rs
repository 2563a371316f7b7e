//! Insert, update and archive.

use super::{FieldValue, Record, Reference, ValidationErrors};
use crate::domain::schema::{FilePolicy, IDENTITY_FIELDS};
use crate::error::{Fault, FaultResult};
use crate::storage::backend::{Query, Row};
use crate::storage::files::{decode_content, UploadOptions};
use chrono::Utc;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use uuid::Uuid;

type Resolution<'a> = BoxFuture<'a, FaultResult<Option<JsonValue>>>;

/// `{field}` placeholders name the field whose value becomes the object name.
fn name_placeholder(template: &str) -> Option<&str> {
    let inner = template.strip_prefix('{')?.strip_suffix('}')?;
    let valid = !inner.is_empty() && inner.chars().all(|c| c.is_ascii_lowercase() || c == '_');
    valid.then_some(inner)
}

impl Record {
    /// Validates and writes the record, then re-fills it.
    ///
    /// On update, uniques and identity fields are not re-validated, fields in
    /// the update ignore set are not written and unresolved values are left
    /// out. Relation ids and file uploads resolve concurrently; one that fails
    /// is dropped from the write instead of aborting it.
    pub async fn save(&mut self, is_update: bool) -> FaultResult<()> {
        let schema = self.schema.clone();
        let ignore: Vec<&str> = if is_update {
            schema
                .uniques
                .iter()
                .map(String::as_str)
                .chain(IDENTITY_FIELDS)
                .collect()
        } else {
            Vec::new()
        };
        let bag = self.pending.clone();
        let validated = self
            .validate_data(&bag, &ignore, false)
            .map_err(|errors| Fault::client("Invalid data").with_errors(errors))?;
        self.apply_validated(validated);

        if !is_update && self.uuid.is_none() {
            self.uuid = Some(Uuid::new_v4());
        }

        let skipped: Vec<&str> = if is_update {
            schema.update_ignores()
        } else {
            schema.ignore_on_save.iter().map(String::as_str).collect()
        };

        let mut columns: Vec<String> = Vec::new();
        let mut resolutions: Vec<Resolution<'_>> = Vec::new();
        for field in schema.validations.keys() {
            if skipped.contains(&field.as_str()) || schema.is_child(field) {
                continue;
            }
            if let Some(relation) = schema.relation_for(field) {
                columns.push(relation.column_for(field));
                resolutions.push(self.relation_column_value(field, self.fields.get(field).cloned()).boxed());
            } else if let Some(policy) = schema.files.get(field) {
                let Some(content) = self.get(field).and_then(|v| v.as_str().map(str::to_string)) else {
                    continue;
                };
                if content.is_empty() {
                    continue;
                }
                columns.push(schema.column(field));
                resolutions.push(self.upload_field(policy, content, is_update).boxed());
            } else {
                columns.push(schema.column(field));
                let value = self.get(field);
                resolutions.push(async move { Ok(value) }.boxed());
            }
        }

        let results = join_all(resolutions).await;
        let mut row = Row::new();
        for (column, result) in columns.into_iter().zip(results) {
            match result {
                Ok(Some(value)) => {
                    row.insert(column, value);
                }
                Ok(None) if is_update => {}
                Ok(None) => {
                    row.insert(column, JsonValue::Null);
                }
                Err(fault) => {
                    tracing::warn!(entity = %schema.entity, column = %column, error = %fault, "value dropped from write");
                }
            }
        }

        if is_update {
            if row.is_empty() {
                return Err(Fault::client("No valid data provided"));
            }
            return self.write_update(row).await;
        }

        if let Some(uuid) = self.uuid {
            row.insert(schema.column("uuid"), JsonValue::String(uuid.to_string()));
        }
        let outcome = self
            .service
            .backend()
            .insert(&schema.table, &schema.id_column(), &row)
            .await
            .map_err(|err| Fault::from_write_error(err, "Insert error"))?;
        self.id = Some(outcome.insert_id);
        tracing::debug!(entity = %schema.entity, id = outcome.insert_id, "record inserted");
        self.fill().await
    }

    /// Writes the supplied public fields and re-fills the record.
    ///
    /// Keys outside the public values or in the update ignore set are dropped.
    /// Scalars run their declared validator, relations resolve to row ids and
    /// a null relation clears its column. Nothing reaches the backend when no
    /// valid key remains.
    pub async fn update(&mut self, data: Row) -> FaultResult<()> {
        let schema = self.schema.clone();
        let ignores = schema.update_ignores();
        let this: &Record = self;

        let mut row = Row::new();
        let mut errors = ValidationErrors::new();
        let mut columns: Vec<String> = Vec::new();
        let mut resolutions: Vec<Resolution<'_>> = Vec::new();

        for (key, value) in data {
            let field = schema.field_name(&key);
            if !schema.is_public(&field) || ignores.contains(&field.as_str()) {
                tracing::debug!(entity = %schema.entity, field = %field, "update key dropped");
                continue;
            }

            if let Some(policy) = schema.files.get(&field) {
                let content = value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Fault::server("Invalid image configuration").with_cause(&field))?;
                columns.push(schema.column(&field));
                resolutions.push(this.upload_field(policy, content, true).boxed());
            } else if let Some(relation) = schema.relation_for(&field) {
                let column = relation.column_for(&field);
                if value.is_null() || value.as_str() == Some("null") {
                    row.insert(column, JsonValue::Null);
                    continue;
                }
                columns.push(column);
                let field = field.clone();
                resolutions.push(
                    async move { this.relation_column_value(&field, Some(FieldValue::Value(value))).await }.boxed(),
                );
            } else {
                let column = schema.column(&field);
                let Some(validation) = schema.validations.get(&field) else {
                    row.insert(column, value);
                    continue;
                };
                let mut bag = Row::new();
                bag.insert(field.clone(), value);
                match this.validate_field(&field, &bag) {
                    Ok(FieldValue::Value(v)) => {
                        row.insert(column, v);
                    }
                    Ok(_) => {}
                    Err(reason) if validation.optional => {
                        tracing::debug!(entity = %schema.entity, field = %field, error = %reason, "optional update value dropped");
                    }
                    Err(reason) => {
                        errors.insert(field, reason);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(Fault::client("Invalid data").with_errors(errors));
        }

        let resolved = try_join_all(resolutions).await?;
        for (column, value) in columns.into_iter().zip(resolved) {
            if let Some(value) = value {
                row.insert(column, value);
            }
        }

        if row.is_empty() {
            return Err(Fault::client("No valid data provided"));
        }
        self.write_update(row).await
    }

    /// Soft-deletes the record: an [`Record::update`] of `status` to the
    /// archived key, under the same public-field and validation gates.
    pub async fn archive(&mut self) -> FaultResult<()> {
        let Some(key) = self.schema.archived_status().map(str::to_string) else {
            return Err(Fault::client(format!("{} can't be archived", self.schema.entity)).with_code(403));
        };
        let value = key
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::String(key));
        let mut data = Row::new();
        data.insert("status".to_string(), value);
        self.update(data).await
    }

    /// Writes NULL to the columns of the named relation fields.
    pub async fn nullify_relations(&mut self, fields: &[&str]) -> FaultResult<()> {
        let mut row = Row::new();
        for field in fields {
            if let Some(relation) = self.schema.relation_for(field) {
                row.insert(relation.column_for(field), JsonValue::Null);
            }
        }
        if row.is_empty() {
            return Err(Fault::client("No valid data provided"));
        }
        self.write_update(row).await
    }

    /// Updates only the relation fields present in `data`.
    pub async fn update_relations(&mut self, data: Row) -> FaultResult<()> {
        let relations: Row = data
            .into_iter()
            .filter(|(key, _)| self.schema.relation_for(&self.schema.field_name(key)).is_some())
            .collect();
        self.update(relations).await
    }

    async fn write_update(&mut self, row: Row) -> FaultResult<()> {
        let query = Query::table(&self.schema.table).with_wheres(self.locating_wheres()?);
        let affected = self
            .service
            .backend()
            .update(&query, &row)
            .await
            .map_err(|err| Fault::from_write_error(err, "Update query error"))?;
        tracing::debug!(entity = %self.schema.entity, affected, "record updated");
        self.flush_cache().await;
        self.fill().await
    }

    /// Backend value for a relation column: a row id, or comma-joined ids for
    /// array relations.
    async fn relation_column_value(&self, field: &str, value: Option<FieldValue>) -> FaultResult<Option<JsonValue>> {
        let Some(relation) = self.schema.relation_for(field) else {
            return Ok(None);
        };
        let value = match value {
            Some(FieldValue::Value(raw)) => self.relation_value(field, &raw)?,
            other => other,
        };
        match value {
            Some(FieldValue::Relation(record)) => Ok(self
                .resolve_row_id(&relation.entity, Reference::Resolved(record))
                .await?
                .map(JsonValue::from)),
            Some(FieldValue::Relations(records)) => {
                let ids = try_join_all(
                    records
                        .into_iter()
                        .map(|r| self.resolve_row_id(&relation.entity, Reference::Resolved(r))),
                )
                .await?;
                let ids: Vec<String> = ids.into_iter().flatten().map(|id| id.to_string()).collect();
                Ok(Some(JsonValue::String(ids.join(","))))
            }
            _ => Ok(None),
        }
    }

    fn file_name(&self, policy: &FilePolicy) -> String {
        let base = match policy.name.as_deref() {
            Some(template) => match name_placeholder(template) {
                Some(field) => self.get(field).and_then(|v| v.as_str().map(str::to_string)),
                None => Some(template.to_string()),
            },
            None => None,
        }
        .filter(|n| !n.is_empty())
        .or_else(|| self.uuid.map(|u| u.to_string()))
        .unwrap_or_else(|| self.schema.entity.to_lowercase());
        format!("{}_{}", base, Utc::now().timestamp_millis())
    }

    fn public_scalars(&self) -> Row {
        self.schema
            .values
            .iter()
            .filter_map(|field| self.get(field).map(|v| (field.clone(), v)))
            .collect()
    }

    async fn upload_field(&self, policy: &FilePolicy, content: String, overwrite: bool) -> FaultResult<Option<JsonValue>> {
        let bytes = decode_content(&content).map_err(|err| Fault::client("Invalid file content").with_cause(err))?;
        let options = UploadOptions {
            variant: policy.variant.clone(),
            uri_values: self.public_scalars(),
            overwrite,
        };
        let uri = self
            .service
            .files()
            .upload(&self.file_name(policy), &bytes, &options)
            .await
            .map_err(|err| Fault::server("Invalid image configuration").with_cause(err))?;
        Ok(Some(JsonValue::String(uri)))
    }
}
