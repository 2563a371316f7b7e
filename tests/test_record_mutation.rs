//! Updates, archiving, relation writes and file uploads.

mod common;

use common::{create_notification, create_topic, harness, harness_with, row};
use record_kernel::storage::backend::MemoryBackend;
use record_kernel::{FaultKind, FieldValidation, RecordService, SchemaDescriptor, SchemaRegistry};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_update_without_valid_keys_never_writes() {
    let h = harness();
    let mut topic = create_topic(&h.service, "news").await;
    let writes = h.backend.write_count();

    let err = topic.update(row(json!({}))).await.unwrap_err();
    assert_eq!(err.fault, FaultKind::Client);
    assert_eq!(err.message, "No valid data provided");

    let err = topic.update(row(json!({ "unknownField": 1 }))).await.unwrap_err();
    assert_eq!(err.message, "No valid data provided");

    let err = topic.update(row(json!({ "uuid": Uuid::new_v4().to_string() }))).await.unwrap_err();
    assert_eq!(err.message, "No valid data provided");

    assert_eq!(h.backend.write_count(), writes);
}

#[tokio::test]
async fn test_update_drops_unknown_keys() {
    let h = harness();
    let mut topic = create_topic(&h.service, "news").await;

    topic
        .update(row(json!({ "slug": "renamed", "unknownField": "x" })))
        .await
        .unwrap();

    let stored = h.backend.rows("topics").await;
    assert_eq!(stored[0]["topic_slug"], json!("renamed"));
    assert!(!stored[0].contains_key("unknownField"));
    assert!(!stored[0].contains_key("topic_unknownField"));
    assert_eq!(topic.get("slug"), Some(json!("renamed")));
}

#[tokio::test]
async fn test_update_aggregates_validation_failures() {
    let h = harness();
    let mut target = h.service.record("Target", json!({ "id": 1 })).unwrap();

    let err = target
        .update(row(json!({ "method": "FAX", "identifier": { "nested": true } })))
        .await
        .unwrap_err();

    assert_eq!(err.message, "Invalid data");
    assert!(err.data.errors.contains_key("method"));
    assert!(err.data.errors.contains_key("identifier"));
    assert_eq!(h.backend.write_count(), 0);
}

#[tokio::test]
async fn test_update_drops_failing_optional_fields() {
    let h = harness();
    let topic = create_topic(&h.service, "news").await;
    let mut notification = create_notification(&h.service, &topic, "welcome").await;

    notification
        .update(row(json!({ "category": { "bad": 1 }, "message": "Updated" })))
        .await
        .unwrap();

    assert_eq!(notification.get("message"), Some(json!("Updated")));
    assert_eq!(notification.get("category"), None);
    let stored = h.backend.rows("notifications").await;
    assert_eq!(stored[0]["notification_category"], json!(null));
}

#[tokio::test]
async fn test_update_ignores_configured_fields() {
    let h = harness();
    let owner = Uuid::new_v4().to_string();
    let mut target = h
        .service
        .record(
            "Target",
            json!({ "method": "email", "identifier": "ops@example.com", "owner": owner }),
        )
        .unwrap();
    target.save(false).await.unwrap();
    assert_eq!(target.get("method"), Some(json!("EMAIL")));

    target
        .update(row(json!({ "owner": Uuid::new_v4().to_string(), "identifier": "dev@example.com" })))
        .await
        .unwrap();

    assert_eq!(target.get("owner"), Some(json!(owner)));
    assert_eq!(target.get("identifier"), Some(json!("dev@example.com")));
}

#[tokio::test]
async fn test_archive_sets_archived_status() {
    let h = harness();
    let mut topic = create_topic(&h.service, "news").await;

    topic.archive().await.unwrap();

    assert_eq!(topic.status(), Some(&json!(-1)));
    assert_eq!(h.backend.rows("topics").await[0]["topic_status"], json!(-1));
}

#[tokio::test]
async fn test_archive_without_archived_status_is_forbidden() {
    let h = harness();
    let topic = create_topic(&h.service, "news").await;
    let mut notification = create_notification(&h.service, &topic, "welcome").await;
    let writes = h.backend.write_count();

    let err = notification.archive().await.unwrap_err();
    assert!(err.is_client());
    assert_eq!(err.status_code(), 403);
    assert_eq!(err.message, "Notification can't be archived");
    assert_eq!(h.backend.write_count(), writes);
}

#[tokio::test]
async fn test_archive_goes_through_update_gates() {
    let mut schemas = SchemaRegistry::new();
    schemas
        .register(
            SchemaDescriptor::new("Ticket", "tickets", "ticket_")
                .values(&["uuid", "title"])
                .validate("title", FieldValidation::new("string"))
                .status(&[("-1", "ARCHIVED"), ("0", "OPEN")]),
        )
        .unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let service = RecordService::builder(schemas).backend(backend.clone()).build();

    let mut ticket = service.record("Ticket", json!({ "title": "Broken link" })).unwrap();
    ticket.save(false).await.unwrap();
    let writes = backend.write_count();

    let err = ticket.archive().await.unwrap_err();
    assert!(err.is_client());
    assert_eq!(err.message, "No valid data provided");
    assert_eq!(backend.write_count(), writes);
    assert!(!backend.rows("tickets").await[0].contains_key("ticket_status"));
}

#[tokio::test]
async fn test_relation_is_written_as_row_id() {
    let h = harness();
    let topic = create_topic(&h.service, "news").await;
    let notification = create_notification(&h.service, &topic, "welcome").await;

    let stored = h.backend.rows("notifications").await;
    assert_eq!(stored[0]["topic_id"], json!(topic.id().unwrap()));

    let related = notification.relation("topic").unwrap();
    assert_eq!(related.lock().await.id(), topic.id());
}

#[tokio::test]
async fn test_update_relations_and_nullify() {
    let h = harness();
    let news = create_topic(&h.service, "news").await;
    let sports = create_topic(&h.service, "sports").await;
    let mut notification = create_notification(&h.service, &news, "welcome").await;

    notification
        .update_relations(row(json!({
            "topic": sports.uuid().unwrap().to_string(),
            "message": "not a relation",
        })))
        .await
        .unwrap();
    let related = notification.relation("topic").unwrap();
    assert_eq!(related.lock().await.id(), sports.id());
    assert_eq!(notification.get("message"), Some(json!("Hello")));

    notification.nullify_relations(&["topic"]).await.unwrap();
    assert!(notification.relation("topic").is_none());
    assert_eq!(h.backend.rows("notifications").await[0]["topic_id"], json!(null));

    let err = notification.nullify_relations(&["message"]).await.unwrap_err();
    assert_eq!(err.message, "No valid data provided");
}

#[tokio::test]
async fn test_null_relation_clears_column() {
    let h = harness();
    let topic = create_topic(&h.service, "news").await;
    let mut notification = create_notification(&h.service, &topic, "welcome").await;

    notification.update(row(json!({ "topic": "null" }))).await.unwrap();
    assert!(notification.relation("topic").is_none());
}

#[tokio::test]
async fn test_unresolved_relation_is_dropped_when_lenient() {
    let h = harness();
    let topic = create_topic(&h.service, "news").await;
    let mut notification = create_notification(&h.service, &topic, "welcome").await;

    let err = notification
        .update(row(json!({ "topic": "no-such-topic" })))
        .await
        .unwrap_err();
    assert_eq!(err.message, "No valid data provided");
    assert_eq!(h.backend.rows("notifications").await[0]["topic_id"], json!(topic.id().unwrap()));
}

#[tokio::test]
async fn test_strict_relations_surface_misses() {
    let h = harness_with(true);
    let topic = create_topic(&h.service, "news").await;
    let mut notification = create_notification(&h.service, &topic, "welcome").await;

    let err = notification
        .update(row(json!({ "topic": "no-such-topic" })))
        .await
        .unwrap_err();
    assert!(err.is_client());
    assert_eq!(err.message, "The provided topic isn't valid");

    let err = notification
        .update(row(json!({ "topic": Uuid::new_v4().to_string() })))
        .await
        .unwrap_err();
    assert!(err.is_client());
    assert_eq!(err.message, "The provided column isn't valid");
}

#[tokio::test]
async fn test_file_fields_are_uploaded() {
    let h = harness();
    let mut profile = h
        .service
        .record(
            "Profile",
            json!({ "name": "alice", "avatar": "data:text/plain;base64,aGVsbG8=" }),
        )
        .unwrap();
    profile.save(false).await.unwrap();

    let uri = profile.get("avatar").and_then(|v| v.as_str().map(str::to_string)).unwrap();
    assert!(uri.starts_with("memory://avatars/alice_"));
    let path = uri.trim_start_matches("memory://");
    assert_eq!(h.files.object(path).await, Some(b"hello".to_vec()));
    assert_eq!(h.files.len().await, 1);

    profile
        .update(row(json!({ "avatar": "data:text/plain;base64,d29ybGQ=" })))
        .await
        .unwrap();
    let uri = profile.get("avatar").and_then(|v| v.as_str().map(str::to_string)).unwrap();
    assert!(uri.starts_with("memory://avatars/alice_"));
    assert_eq!(h.files.object(uri.trim_start_matches("memory://")).await, Some(b"world".to_vec()));

    let err = profile.update(row(json!({ "avatar": 42 }))).await.unwrap_err();
    assert!(err.is_server());
    assert_eq!(err.message, "Invalid image configuration");
}
