//! SchemaRegistry mapping entity tags to their descriptors.

use crate::domain::schema::SchemaDescriptor;
use anyhow::{bail, Context};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of entity descriptors, shared read-only by every record.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor under its entity tag, replacing any previous one.
    pub fn register(&mut self, mut descriptor: SchemaDescriptor) -> anyhow::Result<Arc<SchemaDescriptor>> {
        if descriptor.entity.is_empty() || descriptor.table.is_empty() {
            bail!("schema descriptors require an entity tag and a table");
        }
        descriptor
            .prepare()
            .with_context(|| format!("invalid parse_regex for {}", descriptor.entity))?;
        let descriptor = Arc::new(descriptor);
        self.schemas
            .insert(descriptor.entity.clone(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn get(&self, entity: &str) -> Option<Arc<SchemaDescriptor>> {
        self.schemas.get(entity).cloned()
    }

    pub fn list_entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Builds a registry from a JSON array of descriptors.
    pub fn from_json(value: serde_json::Value) -> anyhow::Result<Self> {
        let descriptors: Vec<SchemaDescriptor> =
            serde_json::from_value(value).context("invalid schema descriptor list")?;
        let mut reg = Self::new();
        for d in descriptors {
            reg.register(d)?;
        }
        Ok(reg)
    }

    /// Fails when a relation or child collection names an unregistered entity.
    pub fn check_references(&self) -> anyhow::Result<()> {
        let mut missing = Vec::new();
        for d in self.schemas.values() {
            for (field, rel) in &d.adapters {
                if !self.schemas.contains_key(&rel.entity) {
                    missing.push(format!("{}.{} -> {}", d.entity, field, rel.entity));
                }
            }
            for (field, child) in &d.childrens {
                if !self.schemas.contains_key(&child.entity) {
                    missing.push(format!("{}.{} -> {}", d.entity, field, child.entity));
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            bail!("unregistered entities referenced: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Creates the `record_schemas` table used for warm starts.
    pub async fn install_schema_table(pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS record_schemas (\
                entity TEXT PRIMARY KEY, \
                descriptor JSONB NOT NULL, \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Persists a descriptor so later processes can load it.
    pub async fn store(pool: &PgPool, descriptor: &SchemaDescriptor) -> anyhow::Result<()> {
        let json = serde_json::to_value(descriptor)?;
        sqlx::query(
            "INSERT INTO record_schemas (entity, descriptor) VALUES ($1, $2) \
             ON CONFLICT (entity) DO UPDATE SET descriptor = EXCLUDED.descriptor, updated_at = now()",
        )
        .bind(&descriptor.entity)
        .bind(json)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Loads every descriptor stored in `record_schemas`.
    ///
    /// A missing table yields an empty registry so a fresh database can still
    /// boot. Parsers are code and are not persisted.
    pub async fn load_from_db(pool: &PgPool) -> anyhow::Result<Self> {
        let rows = match sqlx::query("SELECT entity, descriptor FROM record_schemas")
            .fetch_all(pool)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "record_schemas unavailable, starting with an empty registry");
                return Ok(Self::new());
            }
        };

        let mut reg = Self::new();
        for r in rows {
            let entity: String = r.try_get("entity")?;
            let descriptor: serde_json::Value = r.try_get("descriptor")?;
            let descriptor: SchemaDescriptor = serde_json::from_value(descriptor)
                .with_context(|| format!("stored descriptor for {} is invalid", entity))?;
            reg.register(descriptor)?;
        }
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::RelationField;
    use serde_json::json;

    #[test]
    fn test_register_and_get() {
        let mut reg = SchemaRegistry::new();
        reg.register(SchemaDescriptor::new("Target", "targets", "target_")).unwrap();
        assert!(reg.get("Target").is_some());
        assert!(reg.get("Topic").is_none());
        assert_eq!(reg.list_entities(), vec!["Target".to_string()]);
    }

    #[test]
    fn test_register_rejects_bad_descriptors() {
        let mut reg = SchemaRegistry::new();
        assert!(reg.register(SchemaDescriptor::new("", "t", "")).is_err());
        let bad = SchemaDescriptor::new("X", "x", "x_").parse_regex(&["("]);
        assert!(reg.register(bad).is_err());
    }

    #[test]
    fn test_check_references() {
        let mut reg = SchemaRegistry::new();
        reg.register(
            SchemaDescriptor::new("Topic", "topics", "topic_").relation("owner", RelationField::to("Target")),
        )
        .unwrap();
        let err = reg.check_references().unwrap_err().to_string();
        assert!(err.contains("Topic.owner -> Target"));

        reg.register(SchemaDescriptor::new("Target", "targets", "target_")).unwrap();
        assert!(reg.check_references().is_ok());
    }

    #[test]
    fn test_from_json() {
        let reg = SchemaRegistry::from_json(json!([
            {
                "entity": "Target",
                "table": "targets",
                "prefix": "target_",
                "values": ["uuid", "email"],
                "validations": {"email": "email"},
                "uniques": ["id", "uuid", "email"]
            }
        ]))
        .unwrap();
        let target = reg.get("Target").unwrap();
        assert_eq!(target.validations["email"].validator, "email");
        assert_eq!(target.custom_uniques().collect::<Vec<_>>(), vec!["email"]);
    }
}
