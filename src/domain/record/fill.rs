//! Hydration through the read-through cache.

use super::Record;
use crate::domain::schema::{CacheOptions, AUDIT_FIELDS, IDENTITY_FIELDS};
use crate::error::{Fault, FaultResult};
use crate::storage::backend::{Query, Row};
use crate::storage::cache::CacheSaveOptions;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default)]
pub struct FillOptions {
    /// Aggregate child collections as part of the fill.
    pub childrens: bool,
    /// Overrides the descriptor's cache group and identifier.
    pub cache: Option<CacheOptions>,
}

impl FillOptions {
    pub fn with_childrens() -> Self {
        Self {
            childrens: true,
            ..Default::default()
        }
    }
}

/// Parses timestamps with a time component (RFC 3339, RFC 2822, SQL style).
pub(crate) fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl Record {
    /// Hydrates the record from the cache, else the backend.
    pub async fn fill(&mut self) -> FaultResult<()> {
        self.fill_with(FillOptions::default()).await
    }

    pub async fn fill_with(&mut self, options: FillOptions) -> FaultResult<()> {
        let wheres = self.locating_wheres()?;

        let overrides = options.cache.unwrap_or_default();
        let group = overrides.group.unwrap_or_else(|| self.schema.cache_group());
        let identifier = overrides
            .identifier
            .or_else(|| self.schema.cache_identifier().map(str::to_string));

        let cached = match self.cache_key(identifier.as_deref()) {
            Some(key) => self.cache_get(&group, &key).await.filter(|row| {
                let agrees = self.matches_identity(row);
                if !agrees {
                    tracing::warn!(group = %group, key = %key, "cached row contradicts record identity, reading backend");
                }
                agrees
            }),
            None => None,
        };

        let row = match cached {
            Some(row) => row,
            None => {
                let query = Query::table(&self.schema.table).with_wheres(wheres);
                let raw = match self.service.backend().get_one(&query).await {
                    Ok(Some(row)) if !row.is_empty() => row,
                    Ok(_) => return Err(Fault::client("Not found").with_code(404)),
                    Err(err) => return Err(Fault::server("Query error").with_cause(err)),
                };
                let row = self.schema.parse_row(raw);
                self.cache_save(&group, &row, identifier).await;
                row
            }
        };

        self.assign_row(row)?;
        self.hydrated = true;

        if options.childrens || self.schema.fill_childrens {
            self.childrens().await?;
        }
        Ok(())
    }

    /// Hydrates from a row the caller already fetched. File fields are ignored.
    pub fn fill_with_existing(&mut self, row: Row) -> FaultResult<()> {
        let row: Row = self
            .schema
            .parse_row(row)
            .into_iter()
            .filter(|(key, _)| !self.schema.is_file(key))
            .collect();
        self.assign_row(row)?;
        self.hydrated = true;
        Ok(())
    }

    fn has_value(&self, key: &str) -> bool {
        self.fields.contains_key(key) || self.get(key).is_some()
    }

    fn assign_row(&mut self, row: Row) -> FaultResult<()> {
        for (key, value) in row {
            if value.as_str() == Some("null") {
                continue;
            }
            if self.schema.fill_ignore_if_exists.contains(&key) && self.has_value(&key) {
                continue;
            }
            if value.is_null() {
                if !IDENTITY_FIELDS.contains(&key.as_str()) {
                    self.assign(&key, None);
                }
                continue;
            }

            if self.schema.relation_for(&key).is_some() {
                let resolved = self.relation_value(&key, &value)?;
                self.assign(&key, resolved);
                continue;
            }

            let value = match parse_timestamp(&value) {
                Some(ts) if !AUDIT_FIELDS.contains(&key.as_str()) => {
                    JsonValue::String(ts.format("%Y/%m/%d").to_string())
                }
                _ => value,
            };
            self.assign(&key, Some(super::FieldValue::Value(value)));
        }
        Ok(())
    }

    async fn cache_get(&self, group: &str, key: &str) -> Option<Row> {
        match self.service.cache().get(group, key).await {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(group = %group, key = %key, error = %err, "cache read failed");
                None
            }
        }
    }

    async fn cache_save(&self, group: &str, row: &Row, identifier: Option<String>) {
        let options = CacheSaveOptions {
            uniques: self.schema.uniques.clone(),
            identifier,
            ttl: self.service.cache_ttl(),
        };
        if let Err(err) = self.service.cache().save(group, row, &options).await {
            tracing::warn!(group = %group, entity = %self.schema.entity, error = %err, "cache write failed");
        }
    }

    /// Evicts this record's cache entry. Failures are logged, never surfaced.
    pub(crate) async fn flush_cache(&self) {
        let group = self.schema.cache_group();
        let Some(key) = self.cache_key(self.schema.cache_identifier()) else {
            return;
        };
        if let Err(err) = self.service.cache().flush(&group, &key).await {
            tracing::warn!(group = %group, key = %key, error = %err, "cache flush failed, entry may be stale");
        }
    }
}
