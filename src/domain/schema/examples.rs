//! Descriptors for the notification-dispatch entities (targets, topics,
//! notifications, per-user notification status) and their Postgres tables.

use super::{ChildCollection, FieldValidation, RelationField, SchemaDescriptor, SchemaRegistry};
use crate::domain::validate::{LengthBounds, ValidatorOptions};
use serde_json::json;

pub const TARGET_METHODS: [&str; 4] = ["PHONE", "EMAIL", "ANDROID_DEVICE", "IOS_DEVICE"];

/// A delivery endpoint owned by a user.
pub fn target() -> SchemaDescriptor {
    SchemaDescriptor::new("Target", "targets", "target_")
        .values(&["uuid", "method", "identifier", "owner", "status", "created", "updated"])
        .validate(
            "method",
            FieldValidation::new("enum").options(ValidatorOptions {
                values: TARGET_METHODS.iter().map(|m| json!(m)).collect(),
                ..Default::default()
            }),
        )
        .validate("identifier", FieldValidation::new("string"))
        .validate("owner", FieldValidation::new("uuid"))
        .validate("status", FieldValidation::new("number").default_value(0))
        .uniques(&["id", "uuid"])
        .status(&[("-1", "ARCHIVED"), ("0", "UNVERIFIED"), ("1", "VERIFIED")])
        .ignore_on_update(&["owner"])
}

pub fn topic() -> SchemaDescriptor {
    SchemaDescriptor::new("Topic", "topics", "topic_")
        .values(&["uuid", "slug", "status", "notifications", "created", "updated"])
        .validate("slug", FieldValidation::new("string").label("Slug"))
        .validate("status", FieldValidation::new("number").default_value(0))
        .child(
            "notifications",
            ChildCollection {
                entity: "Notification".to_string(),
                column: "topic_id".to_string(),
            },
        )
        .uniques(&["id", "uuid", "slug"])
        .status(&[("-1", "ARCHIVED"), ("0", "MARKETING"), ("1", "WATCHER")])
}

pub fn notification() -> SchemaDescriptor {
    SchemaDescriptor::new("Notification", "notifications", "notification_")
        .values(&[
            "uuid", "owner", "category", "topic", "slug", "message", "payload", "created", "updated",
        ])
        .validate("owner", FieldValidation::new("uuid"))
        .validate("category", FieldValidation::new("string").optional())
        .validate("topic", FieldValidation::new("string").optional())
        .validate(
            "slug",
            FieldValidation::new("string").options(ValidatorOptions {
                length: Some(LengthBounds { min: Some(1.0), max: Some(64.0) }),
                ..Default::default()
            }),
        )
        .validate("message", FieldValidation::new("string"))
        .validate("payload", FieldValidation::new("json").default_value(json!({})))
        .relation("topic", RelationField::to("Topic"))
        .detailed_values(&["topic"])
        .uniques(&["id", "uuid"])
}

pub fn notification_status() -> SchemaDescriptor {
    SchemaDescriptor::new("NotificationStatus", "notification_status", "status_")
        .values(&["uuid", "user", "notification", "status", "created", "updated"])
        .validate("user", FieldValidation::new("uuid"))
        .validate("notification", FieldValidation::new("string"))
        .validate("status", FieldValidation::new("number").default_value(0))
        .relation("notification", RelationField::to("Notification"))
        .uniques(&["id", "uuid"])
        .status(&[("-1", "ARCHIVED"), ("0", "SENT"), ("1", "READ"), ("2", "USED")])
        .ignore_on_update(&["user", "notification"])
}

/// Registry with all four notification entities.
pub fn notification_registry() -> anyhow::Result<SchemaRegistry> {
    let mut reg = SchemaRegistry::new();
    reg.register(target())?;
    reg.register(topic())?;
    reg.register(notification())?;
    reg.register(notification_status())?;
    reg.check_references()?;
    Ok(reg)
}

/// CREATE TABLE statements for the notification entities, in dependency order.
pub fn create_table_statements() -> [&'static str; 4] {
    [
        "CREATE TABLE IF NOT EXISTS targets (
            target_id BIGSERIAL PRIMARY KEY,
            target_uuid UUID NOT NULL UNIQUE,
            target_method TEXT NOT NULL,
            target_identifier TEXT NOT NULL,
            target_owner UUID NOT NULL,
            target_status SMALLINT NOT NULL DEFAULT 0,
            target_created TIMESTAMPTZ NOT NULL DEFAULT now(),
            target_updated TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS topics (
            topic_id BIGSERIAL PRIMARY KEY,
            topic_uuid UUID NOT NULL UNIQUE,
            topic_slug TEXT NOT NULL UNIQUE,
            topic_status SMALLINT NOT NULL DEFAULT 0,
            topic_created TIMESTAMPTZ NOT NULL DEFAULT now(),
            topic_updated TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS notifications (
            notification_id BIGSERIAL PRIMARY KEY,
            notification_uuid UUID NOT NULL UNIQUE,
            notification_owner UUID NOT NULL,
            notification_category TEXT,
            topic_id BIGINT REFERENCES topics(topic_id),
            notification_slug VARCHAR(64) NOT NULL,
            notification_message TEXT NOT NULL,
            notification_payload TEXT,
            notification_created TIMESTAMPTZ NOT NULL DEFAULT now(),
            notification_updated TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS notification_status (
            status_id BIGSERIAL PRIMARY KEY,
            status_uuid UUID NOT NULL UNIQUE,
            status_user UUID NOT NULL,
            notification_id BIGINT REFERENCES notifications(notification_id),
            status_status SMALLINT NOT NULL DEFAULT 0,
            status_created TIMESTAMPTZ NOT NULL DEFAULT now(),
            status_updated TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ]
}
