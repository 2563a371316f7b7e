//! The record engine.
//!
//! A [`Record`] is one in-memory occurrence of a persisted entity, bound to its
//! [`SchemaDescriptor`]. It is built from a raw field bag, hydrated with
//! [`Record::fill`], mutated with [`Record::save`], [`Record::update`] and
//! [`Record::archive`], and projected with [`Record::values`].
//!
//! Identity (`id`, `uuid`), status, audit stamps and creator are typed fields;
//! everything else the schema declares lives in a [`FieldValue`] map. Relation
//! fields hold nested [`SharedRecord`]s that are memoized per resolution graph
//! in a [`RelationRegistry`].

use crate::app::record_service::RecordService;
use crate::domain::schema::{SchemaDescriptor, IDENTITY_FIELDS};
use crate::domain::validate::ValidatorOptions;
use crate::error::{Fault, FaultResult};
use crate::storage::backend::{json_to_u64, Row, Where};
use crate::storage::cache::field_cache_key;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

mod children;
mod fill;
mod mutation;
mod relation;
mod serialize;
mod validation;

pub use fill::FillOptions;
pub use relation::{Identity, Reference, RelationRegistry};
pub use validation::{Validated, ValidationErrors};

/// A record shared between the relation graph and its owners.
pub type SharedRecord = Arc<Mutex<Record>>;

/// Value of a schema-declared field.
#[derive(Clone)]
pub enum FieldValue {
    Value(JsonValue),
    Relation(SharedRecord),
    Relations(Vec<SharedRecord>),
}

impl FieldValue {
    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Value(v) => write!(f, "Value({})", v),
            FieldValue::Relation(_) => f.write_str("Relation(..)"),
            FieldValue::Relations(r) => write!(f, "Relations({})", r.len()),
        }
    }
}

pub struct Record {
    service: Arc<RecordService>,
    schema: Arc<SchemaDescriptor>,
    relations: RelationRegistry,

    id: Option<u64>,
    uuid: Option<Uuid>,
    status: Option<JsonValue>,
    created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    creator: Option<JsonValue>,

    fields: BTreeMap<String, FieldValue>,
    /// Caller-supplied data not yet validated.
    pending: Row,
    detailed_values: Option<Vec<String>>,
    strict_relations: bool,
    hydrated: bool,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entity", &self.schema.entity)
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("fields", &self.fields)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Record {
    /// Builds a record from a raw field bag.
    ///
    /// Keys may be bare or prefixed. `id` and `uuid` are validated eagerly,
    /// declared uniques are validated and assigned, audit stamps and `creator`
    /// are taken verbatim. Everything else is kept as pending data until it is
    /// validated explicitly.
    pub fn new(service: Arc<RecordService>, schema: Arc<SchemaDescriptor>, bag: Row) -> FaultResult<Self> {
        Self::build(service, schema, RelationRegistry::new(), bag)
    }

    pub(crate) fn build(
        service: Arc<RecordService>,
        schema: Arc<SchemaDescriptor>,
        relations: RelationRegistry,
        bag: Row,
    ) -> FaultResult<Self> {
        let strict_relations = service.strict_relations();
        let mut record = Record {
            service,
            schema,
            relations,
            id: None,
            uuid: None,
            status: None,
            created: None,
            updated: None,
            creator: None,
            fields: BTreeMap::new(),
            pending: Row::new(),
            detailed_values: None,
            strict_relations,
            hydrated: false,
        };

        let mut params: Row = bag
            .into_iter()
            .map(|(k, v)| (record.schema.field_name(&k), v))
            .filter(|(_, v)| !v.is_null())
            .collect();

        if let Some(raw) = params.remove("id") {
            record.id = Some(record.parse_id(&raw)?);
        }
        if let Some(raw) = params.remove("uuid") {
            record.uuid = Some(record.parse_uuid(&raw)?);
        }

        let uniques: Vec<String> = record.schema.custom_uniques().map(str::to_string).collect();
        for key in uniques {
            if !params.contains_key(&key) || !record.schema.validations.contains_key(&key) {
                continue;
            }
            match record.validate_field(&key, &params) {
                Ok(value) => {
                    params.remove(&key);
                    record.assign(&key, Some(value));
                }
                Err(reason) => {
                    tracing::warn!(
                        entity = %record.schema.entity,
                        field = %key,
                        error = %reason,
                        "unique field rejected at construction, kept as pending"
                    );
                }
            }
        }

        for key in ["created", "updated"] {
            if let Some(raw) = params.remove(key) {
                match fill::parse_timestamp(&raw) {
                    Some(ts) if key == "created" => record.created = Some(ts),
                    Some(ts) => record.updated = Some(ts),
                    None => tracing::warn!(entity = %record.schema.entity, field = key, "unparseable timestamp dropped"),
                }
            }
        }
        if let Some(creator) = params.remove("creator") {
            record.creator = Some(creator);
        }

        record.pending = params;
        Ok(record)
    }

    /// A record of `schema` addressed only by `identity`, sharing `relations`.
    pub(crate) fn with_identity(
        service: Arc<RecordService>,
        schema: Arc<SchemaDescriptor>,
        relations: RelationRegistry,
        identity: &Identity,
    ) -> FaultResult<Self> {
        Self::build(service, schema, relations, identity.to_bag())
    }

    fn parse_id(&self, raw: &JsonValue) -> FaultResult<u64> {
        self.service
            .validators()
            .validate("number", Some(raw), &ValidatorOptions::with_min(0.0))
            .ok()
            .as_ref()
            .and_then(json_to_u64)
            .ok_or_else(|| {
                Fault::client(format!("Invalid {} id", self.schema.entity)).with_cause(raw)
            })
    }

    fn parse_uuid(&self, raw: &JsonValue) -> FaultResult<Uuid> {
        self.service
            .validators()
            .validate("uuid", Some(raw), &ValidatorOptions::default())
            .ok()
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .ok_or_else(|| {
                Fault::client(format!("Invalid {} uuid", self.schema.entity)).with_cause(raw)
            })
    }

    pub fn into_shared(self) -> SharedRecord {
        Arc::new(Mutex::new(self))
    }

    pub fn entity(&self) -> &str {
        &self.schema.entity
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn service(&self) -> &Arc<RecordService> {
        &self.service
    }

    pub fn relations(&self) -> &RelationRegistry {
        &self.relations
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn status(&self) -> Option<&JsonValue> {
        self.status.as_ref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.updated
    }

    pub fn creator(&self) -> Option<&JsonValue> {
        self.creator.as_ref()
    }

    pub fn pending(&self) -> &Row {
        &self.pending
    }

    /// Whether the record has been hydrated from the cache or the backend.
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Current scalar value of a field, typed fields included.
    pub fn get(&self, name: &str) -> Option<JsonValue> {
        match name {
            "id" => self.id.map(JsonValue::from),
            "uuid" => self.uuid.map(|u| JsonValue::String(u.to_string())),
            "status" => self.status.clone(),
            "created" => self.created.map(|t| JsonValue::String(t.to_rfc3339())),
            "updated" => self.updated.map(|t| JsonValue::String(t.to_rfc3339())),
            "creator" => self.creator.clone(),
            _ => self.fields.get(name).and_then(|f| f.as_json().cloned()),
        }
    }

    /// The record a scalar relation field points to.
    pub fn relation(&self, name: &str) -> Option<SharedRecord> {
        match self.fields.get(name) {
            Some(FieldValue::Relation(r)) => Some(r.clone()),
            _ => None,
        }
    }

    /// Stages a caller value for the next validation or save.
    pub fn set(&mut self, name: &str, value: impl Into<JsonValue>) {
        let name = self.schema.field_name(name);
        self.pending.insert(name, value.into());
    }

    /// Surfaces relation misses as client faults instead of clearing the field.
    pub fn set_strict_relations(&mut self, strict: bool) {
        self.strict_relations = strict;
    }

    /// Fields serialized as nested objects; a comma-separated string is split.
    pub fn set_detailed_values(&mut self, detail: impl Into<JsonValue>) {
        self.detailed_values = Some(serialize::parse_detail(&detail.into()));
    }

    /// Assigns a field; `None` clears it. Identity fields are set only once.
    pub(crate) fn assign(&mut self, name: &str, value: Option<FieldValue>) {
        match name {
            "id" => {
                if self.id.is_none() {
                    self.id = value.as_ref().and_then(FieldValue::as_json).and_then(json_to_u64);
                }
            }
            "uuid" => {
                if self.uuid.is_none() {
                    self.uuid = value
                        .as_ref()
                        .and_then(FieldValue::as_json)
                        .and_then(JsonValue::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok());
                }
            }
            "status" => self.status = value.and_then(|v| v.as_json().cloned()),
            "creator" => self.creator = value.and_then(|v| v.as_json().cloned()),
            "created" | "updated" => {
                let ts = value.as_ref().and_then(FieldValue::as_json).and_then(fill::parse_timestamp);
                if name == "created" {
                    self.created = ts;
                } else {
                    self.updated = ts;
                }
            }
            _ => match value {
                Some(v) => {
                    self.fields.insert(name.to_string(), v);
                }
                None => {
                    self.fields.remove(name);
                }
            },
        }
    }

    /// Where-clauses that locate this record's row.
    ///
    /// Uses the numeric id and the uuid; declared uniques only when neither is
    /// known, so a unique changed by an update never strands the re-fill.
    pub fn locating_wheres(&self) -> FaultResult<Vec<Where>> {
        let mut wheres = Vec::new();
        if let Some(id) = self.id {
            wheres.push(Where {
                column: self.schema.id_column(),
                value: JsonValue::from(id),
            });
        }
        if let Some(uuid) = self.uuid {
            wheres.push(Where {
                column: self.schema.column("uuid"),
                value: JsonValue::String(uuid.to_string()),
            });
        }
        if wheres.is_empty() {
            for key in self.schema.custom_uniques() {
                if let Some(value) = self.get(key).filter(|v| !v.is_null()) {
                    wheres.push(Where {
                        column: self.schema.column(key),
                        value,
                    });
                }
            }
        }
        if wheres.is_empty() {
            return Err(Fault::client(format!(
                "The record requires an unique identifier [{}]",
                self.schema.uniques.join(", ")
            )));
        }
        Ok(wheres)
    }

    /// Cache key: the identifier override, else uuid, else id, namespaced
    /// by field the way rows are indexed on save.
    pub(crate) fn cache_key(&self, identifier: Option<&str>) -> Option<String> {
        identifier
            .filter(|f| !IDENTITY_FIELDS.contains(f))
            .and_then(|f| self.get(f).and_then(|v| field_cache_key(f, &v)))
            .or_else(|| self.uuid.map(|u| format!("uuid:{}", u)))
            .or_else(|| self.id.map(|i| format!("id:{}", i)))
    }

    /// A cached row is usable only when it agrees with the identity this
    /// record already carries.
    pub(crate) fn matches_identity(&self, row: &Row) -> bool {
        let id_agrees = match (self.id, row.get("id").and_then(json_to_u64)) {
            (Some(known), Some(cached)) => known == cached,
            (Some(_), None) => false,
            _ => true,
        };
        let uuid_agrees = match (self.uuid, row.get("uuid").and_then(|v| v.as_str())) {
            (Some(known), Some(cached)) => Uuid::parse_str(cached).map(|c| c == known).unwrap_or(false),
            (Some(_), None) => false,
            _ => true,
        };
        id_agrees && uuid_agrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::examples;
    use crate::domain::schema::SchemaRegistry;
    use crate::storage::backend::MemoryBackend;
    use serde_json::json;

    fn service() -> Arc<RecordService> {
        let mut reg = SchemaRegistry::new();
        reg.register(examples::topic()).unwrap();
        reg.register(examples::notification()).unwrap();
        RecordService::builder(reg)
            .backend(Arc::new(MemoryBackend::new()))
            .build()
    }

    fn bag(v: JsonValue) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_construction_extracts_identity_and_uniques() {
        let svc = service();
        let schema = svc.schemas().get("Topic").unwrap();
        let uuid = Uuid::new_v4();
        let rec = Record::new(
            svc,
            schema,
            bag(json!({"topic_id": "7", "uuid": uuid.to_string(), "slug": " news ", "status": 1})),
        )
        .unwrap();
        assert_eq!(rec.id(), Some(7));
        assert_eq!(rec.uuid(), Some(uuid));
        assert_eq!(rec.get("slug"), Some(json!("news")));
        assert_eq!(rec.pending().get("status"), Some(&json!(1)));
        assert!(!rec.pending().contains_key("slug"));
    }

    #[test]
    fn test_construction_rejects_invalid_identity() {
        let svc = service();
        let schema = svc.schemas().get("Topic").unwrap();
        let err = Record::new(svc.clone(), schema.clone(), bag(json!({"id": -3}))).unwrap_err();
        assert!(err.is_client());
        let err = Record::new(svc, schema, bag(json!({"uuid": "nope"}))).unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn test_locating_wheres_require_an_identifier() {
        let svc = service();
        let schema = svc.schemas().get("Notification").unwrap();
        let rec = Record::new(svc.clone(), schema.clone(), bag(json!({"message": "x"}))).unwrap();
        let err = rec.locating_wheres().unwrap_err();
        assert!(err.is_client());
        assert!(err.message.contains("unique identifier"));

        let rec = Record::new(svc, schema, bag(json!({"id": 3}))).unwrap();
        let wheres = rec.locating_wheres().unwrap();
        assert_eq!(wheres[0].column, "notification_id");
    }

    #[test]
    fn test_cache_key_prefers_identifier_then_uuid_then_id() {
        let svc = service();
        let schema = svc.schemas().get("Topic").unwrap();
        let rec = Record::new(svc.clone(), schema.clone(), bag(json!({"id": 4, "slug": "news"}))).unwrap();
        assert_eq!(rec.cache_key(Some("slug")).as_deref(), Some("slug:news"));
        assert_eq!(rec.cache_key(None).as_deref(), Some("id:4"));

        let uuid = Uuid::new_v4();
        let rec = Record::new(svc, schema, bag(json!({"id": 4, "uuid": uuid.to_string()}))).unwrap();
        assert_eq!(rec.cache_key(None), Some(format!("uuid:{}", uuid)));
        assert_eq!(rec.cache_key(Some("uuid")), Some(format!("uuid:{}", uuid)));
    }

    #[test]
    fn test_reference_record_is_memoized_per_identity() {
        let svc = service();
        let schema = svc.schemas().get("Notification").unwrap();
        let rec = Record::new(svc, schema, bag(json!({"id": 1}))).unwrap();

        let first = rec.reference_record("Topic", Identity::Id(4)).unwrap();
        let again = rec.reference_record("Topic", Identity::Id(4)).unwrap();
        let other = rec.reference_record("Topic", Identity::Id(5)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(rec.relations().len(), 2);

        let nested = first.try_lock().unwrap().reference_record("Topic", Identity::Id(5)).unwrap();
        assert!(Arc::ptr_eq(&nested, &other));
    }

    #[test]
    fn test_cached_row_must_agree_with_known_identity() {
        let svc = service();
        let schema = svc.schemas().get("Topic").unwrap();
        let uuid = Uuid::new_v4();
        let rec = Record::new(svc.clone(), schema.clone(), bag(json!({"id": 1}))).unwrap();
        assert!(rec.matches_identity(&bag(json!({"id": 1, "uuid": uuid.to_string()}))));
        assert!(!rec.matches_identity(&bag(json!({"id": 2, "slug": "1"}))));
        assert!(!rec.matches_identity(&bag(json!({"slug": "1"}))));

        let rec = Record::new(svc, schema, bag(json!({"uuid": uuid.to_string()}))).unwrap();
        assert!(rec.matches_identity(&bag(json!({"id": 9, "uuid": uuid.to_string()}))));
        assert!(!rec.matches_identity(&bag(json!({"id": 9, "uuid": Uuid::new_v4().to_string()}))));
    }
}
