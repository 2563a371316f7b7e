//! Shared fixtures: a record service wired to the in-memory collaborators.

#![allow(dead_code)]

use record_kernel::domain::schema::examples;
use record_kernel::storage::backend::{MemoryBackend, Row};
use record_kernel::storage::cache::MemoryCache;
use record_kernel::storage::files::MemoryFileStore;
use record_kernel::{FieldValidation, FilePolicy, Record, RecordService, RelationField, SchemaDescriptor};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

pub struct Harness {
    pub service: Arc<RecordService>,
    pub backend: Arc<MemoryBackend>,
    pub cache: Arc<MemoryCache>,
    pub files: Arc<MemoryFileStore>,
}

/// A user profile with an uploaded avatar.
pub fn profile() -> SchemaDescriptor {
    SchemaDescriptor::new("Profile", "profiles", "profile_")
        .values(&["uuid", "name", "avatar"])
        .validate("name", FieldValidation::new("string"))
        .validate("avatar", FieldValidation::new("string"))
        .file(
            "avatar",
            FilePolicy {
                name: Some("{name}".to_string()),
                variant: Some("avatars".to_string()),
            },
        )
}

/// A digest bundling several topics, stored as a comma-joined id column.
pub fn digest() -> SchemaDescriptor {
    SchemaDescriptor::new("Digest", "digests", "digest_")
        .values(&["uuid", "title", "topics"])
        .validate("title", FieldValidation::new("string"))
        .validate("topics", FieldValidation::new("string"))
        .relation("topics", RelationField::to("Topic").many().column("digest_topics"))
        .array_values(&["topics"])
}

pub fn harness() -> Harness {
    harness_with(false)
}

pub fn harness_with(strict_relations: bool) -> Harness {
    let mut schemas = examples::notification_registry().unwrap();
    schemas.register(profile()).unwrap();
    schemas.register(digest()).unwrap();

    let backend = Arc::new(
        MemoryBackend::new()
            .with_unique("topics", "topic_slug")
            .with_audit_columns("topics", "topic_created", "topic_updated"),
    );
    let cache = Arc::new(MemoryCache::new());
    let files = Arc::new(MemoryFileStore::new());
    let service = RecordService::builder(schemas)
        .backend(backend.clone())
        .cache(cache.clone())
        .files(files.clone())
        .strict_relations(strict_relations)
        .build();

    Harness {
        service,
        backend,
        cache,
        files,
    }
}

pub fn row(v: JsonValue) -> Row {
    v.as_object().cloned().unwrap()
}

pub async fn create_topic(service: &Arc<RecordService>, slug: &str) -> Record {
    let mut topic = service.record("Topic", json!({ "slug": slug })).unwrap();
    topic.save(false).await.unwrap();
    topic
}

pub async fn create_notification(service: &Arc<RecordService>, topic: &Record, slug: &str) -> Record {
    let mut notification = service
        .record(
            "Notification",
            json!({
                "owner": Uuid::new_v4().to_string(),
                "slug": slug,
                "message": "Hello",
                "topic": topic.uuid().unwrap().to_string(),
            }),
        )
        .unwrap();
    notification.save(false).await.unwrap();
    notification
}
