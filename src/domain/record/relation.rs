//! Relation resolution and per-graph memoization.

use super::{FieldValue, Record, SharedRecord};
use crate::error::{Fault, FaultResult};
use crate::storage::backend::{json_to_u64, Row};
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// The identity a raw relation value designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Id(u64),
    Uuid(Uuid),
}

impl Identity {
    /// Numbers (or numeric strings) are ids, uuid strings are uuids.
    pub fn classify(value: &JsonValue) -> Option<Self> {
        if let Some(id) = json_to_u64(value) {
            return Some(Identity::Id(id));
        }
        value
            .as_str()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Identity::Uuid)
    }

    pub fn registry_key(&self, entity: &str) -> String {
        match self {
            Identity::Id(id) => format!("{}_{}", entity, id),
            Identity::Uuid(uuid) => format!("{}_{}", entity, uuid),
        }
    }

    pub(crate) fn to_bag(self) -> Row {
        let mut bag = Row::new();
        match self {
            Identity::Id(id) => bag.insert("id".to_string(), JsonValue::from(id)),
            Identity::Uuid(uuid) => bag.insert("uuid".to_string(), JsonValue::String(uuid.to_string())),
        };
        bag
    }
}

/// Outcome of upgrading a raw relation value.
#[derive(Debug, Clone)]
pub enum Reference {
    Resolved(SharedRecord),
    Raw(Identity),
    Unresolved,
}

impl Reference {
    pub fn classify(value: &JsonValue) -> Self {
        match Identity::classify(value) {
            Some(identity) => Reference::Raw(identity),
            None => Reference::Unresolved,
        }
    }
}

/// Memoized relation records keyed by `Entity_identity`.
///
/// Cloning shares the map; nested records inherit their parent's registry so
/// one resolution graph never fetches the same identity twice.
#[derive(Clone, Default)]
pub struct RelationRegistry {
    records: Arc<Mutex<HashMap<String, SharedRecord>>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SharedRecord> {
        self.records.lock().ok()?.get(key).cloned()
    }

    fn get_or_insert_with<F>(&self, key: String, make: F) -> FaultResult<SharedRecord>
    where
        F: FnOnce() -> FaultResult<SharedRecord>,
    {
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }
        let record = make()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| Fault::server("Relation registry poisoned"))?;
        Ok(records.entry(key).or_insert(record).clone())
    }

    pub fn records(&self) -> Vec<SharedRecord> {
        self.records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Record {
    /// The memoized record of `entity` with `identity`, created on first use.
    pub fn reference_record(&self, entity: &str, identity: Identity) -> FaultResult<SharedRecord> {
        let schema = self.service.schema(entity)?;
        let service = self.service.clone();
        let relations = self.relations.clone();
        self.relations.get_or_insert_with(identity.registry_key(entity), move || {
            Ok(Record::with_identity(service, schema, relations, &identity)?.into_shared())
        })
    }

    /// Upgrades a raw value into a reference to a record of `entity`.
    pub fn resolve_reference(&self, entity: &str, value: &JsonValue) -> FaultResult<Reference> {
        match Reference::classify(value) {
            Reference::Raw(identity) => Ok(Reference::Resolved(self.reference_record(entity, identity)?)),
            other => Ok(other),
        }
    }

    /// Resolves a relation field's raw value.
    ///
    /// Unresolvable values leave the field unset (array fields skip the
    /// element) unless strict relations are on.
    pub(crate) fn relation_value(&self, field: &str, value: &JsonValue) -> FaultResult<Option<FieldValue>> {
        let relation = self
            .schema
            .relation_for(field)
            .ok_or_else(|| Fault::server(format!("{} is not a relation of {}", field, self.schema.entity)))?;

        let elements: Option<Vec<&JsonValue>> = match value {
            JsonValue::Array(items) => Some(items.iter().collect()),
            _ if relation.many => Some(vec![value]),
            _ => None,
        };

        match elements {
            Some(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    match self.resolve_reference(&relation.entity, item)? {
                        Reference::Resolved(r) => records.push(r),
                        _ => self.relation_miss(field, item)?,
                    }
                }
                Ok(Some(FieldValue::Relations(records)))
            }
            None => match self.resolve_reference(&relation.entity, value)? {
                Reference::Resolved(r) => Ok(Some(FieldValue::Relation(r))),
                _ => {
                    self.relation_miss(field, value)?;
                    Ok(None)
                }
            },
        }
    }

    fn relation_miss(&self, field: &str, value: &JsonValue) -> FaultResult<()> {
        if self.strict_relations {
            return Err(Fault::client(format!("The provided {} isn't valid", field)).with_cause(value));
        }
        tracing::debug!(entity = %self.schema.entity, field = %field, value = %value, "unresolved relation left unset");
        Ok(())
    }

    /// Turns a reference into the numeric row id of a record of `entity`.
    ///
    /// Tries the id, then the uuid through the backend, then hydrates the
    /// record and retries. A miss yields `None`, or a client fault when strict
    /// relations are on.
    pub async fn resolve_row_id(&self, entity: &str, reference: Reference) -> FaultResult<Option<u64>> {
        let target = self.service.schema(entity)?;
        let found = match reference {
            Reference::Raw(Identity::Id(id)) => Some(id),
            Reference::Raw(Identity::Uuid(uuid)) => self.stage_id(&uuid, &target.table, &target.prefix).await,
            Reference::Resolved(shared) => {
                let mut record = shared.lock().await;
                match (record.id, record.uuid) {
                    (Some(id), _) => Some(id),
                    (None, uuid) => {
                        let staged = match uuid {
                            Some(uuid) => self.stage_id(&uuid, &target.table, &target.prefix).await,
                            None => None,
                        };
                        match staged {
                            Some(id) => Some(id),
                            None => match record.fill().await {
                                Ok(()) => record.id,
                                Err(fault) => {
                                    tracing::debug!(entity = %entity, error = %fault, "relation could not be hydrated");
                                    None
                                }
                            },
                        }
                    }
                }
            }
            Reference::Unresolved => None,
        };

        match found {
            Some(id) => Ok(Some(id)),
            None if self.strict_relations => Err(Fault::client("The provided column isn't valid")),
            None => Ok(None),
        }
    }

    async fn stage_id(&self, uuid: &Uuid, table: &str, prefix: &str) -> Option<u64> {
        match self.service.backend().stage_id_from_uuid(uuid, table, prefix).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(table = %table, uuid = %uuid, error = %err, "uuid staging failed");
                None
            }
        }
    }

    /// Hydrates every record memoized in this record's relation graph.
    pub async fn fill_relations(&self) -> FaultResult<()> {
        let records = self.relations.records();
        try_join_all(records.into_iter().map(|shared| async move {
            let mut record = shared.lock().await;
            if record.is_hydrated() {
                return Ok(());
            }
            record.fill().await
        }))
        .await?;
        Ok(())
    }
}
