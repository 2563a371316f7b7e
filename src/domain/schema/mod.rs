//! Declarative per-entity schema descriptors.
//!
//! A [`SchemaDescriptor`] tells the record engine everything it knows about an
//! entity type: where rows live, which fields are public, how each field is
//! validated, which fields reference other entity types, which are uploaded
//! files, which are derived child collections, how rows are cached and which
//! status marks a row as archived. Descriptors are immutable once registered
//! and shared by every record of the type.

use crate::domain::validate::ValidatorOptions;
use crate::storage::backend::Row;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod examples;
pub mod registry;

pub use registry::SchemaRegistry;

/// Fields every record carries regardless of its schema.
pub const IDENTITY_FIELDS: [&str; 2] = ["id", "uuid"];

/// Fields never written by `update`.
pub const ALWAYS_IGNORED_ON_UPDATE: [&str; 5] = ["id", "uuid", "creator", "created", "updated"];

/// Audit timestamps keep datetime semantics on fill.
pub const AUDIT_FIELDS: [&str; 2] = ["created", "updated"];

/// In-process value transform applied before a field is validated.
#[derive(Clone)]
pub struct FieldParser(Arc<dyn Fn(Option<JsonValue>) -> Option<JsonValue> + Send + Sync>);

impl FieldParser {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<JsonValue>) -> Option<JsonValue> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, value: Option<JsonValue>) -> Option<JsonValue> {
        (self.0)(value)
    }
}

impl fmt::Debug for FieldParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldParser(..)")
    }
}

/// How one field is validated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldValidation {
    /// Name of the validator in the validator set.
    pub validator: String,
    pub options: ValidatorOptions,
    /// A failing optional field is cleared instead of rejected.
    pub optional: bool,
    /// The value is produced by `parser`; failures during a first validation are cleared.
    pub from_parser: bool,
    pub default: Option<JsonValue>,
    #[serde(skip)]
    pub parser: Option<FieldParser>,
}

impl FieldValidation {
    pub fn new(validator: &str) -> Self {
        Self {
            validator: validator.to_string(),
            ..Default::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn from_parser(mut self) -> Self {
        self.from_parser = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.options.label = Some(label.to_string());
        self
    }

    pub fn parser<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<JsonValue>) -> Option<JsonValue> + Send + Sync + 'static,
    {
        self.parser = Some(FieldParser::new(f));
        self
    }

    /// Label used in error messages ("Name" for field `name` when unset).
    pub fn display_label(&self, field: &str) -> String {
        if let Some(label) = &self.options.label {
            return label.clone();
        }
        let mut chars = field.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

#[derive(Deserialize)]
struct FieldValidationFields {
    #[serde(alias = "type")]
    validator: String,
    #[serde(default)]
    options: ValidatorOptions,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    from_parser: bool,
    #[serde(default)]
    default: Option<JsonValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldValidationRepr {
    Name(String),
    Detailed(FieldValidationFields),
}

// Accepts either a bare validator name or a full object.
impl<'de> Deserialize<'de> for FieldValidation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match FieldValidationRepr::deserialize(deserializer)? {
            FieldValidationRepr::Name(name) => FieldValidation::new(&name),
            FieldValidationRepr::Detailed(detailed) => FieldValidation {
                validator: detailed.validator,
                options: detailed.options,
                optional: detailed.optional,
                from_parser: detailed.from_parser,
                default: detailed.default,
                parser: None,
            },
        })
    }
}

/// A field referencing another entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationField {
    /// Entity tag of the referenced type.
    pub entity: String,
    /// Array-valued relation.
    #[serde(default)]
    pub many: bool,
    /// Foreign-key column override.
    #[serde(default)]
    pub column: Option<String>,
}

impl RelationField {
    pub fn to(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            many: false,
            column: None,
        }
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    /// `{field}_id` when the entity is named like the field, else `{entity}_{field}_id`.
    pub fn column_for(&self, field: &str) -> String {
        if let Some(column) = &self.column {
            return column.clone();
        }
        let entity = self.entity.to_lowercase();
        if entity == field {
            format!("{}_id", field)
        } else {
            format!("{}_{}_id", entity, field)
        }
    }
}

/// Upload policy for a file field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePolicy {
    /// Object name or a `{field}` placeholder; the record uuid when it resolves to nothing.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

/// A one-to-many aggregation of another entity's identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildCollection {
    pub entity: String,
    /// Column of the child table holding this record's numeric id.
    pub column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    #[serde(default)]
    pub group: Option<String>,
    /// Field whose value is the cache key instead of uuid/id.
    #[serde(default)]
    pub identifier: Option<String>,
}

/// Static configuration of one entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub entity: String,
    pub table: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub validations: BTreeMap<String, FieldValidation>,
    #[serde(default)]
    pub adapters: BTreeMap<String, RelationField>,
    #[serde(default)]
    pub files: BTreeMap<String, FilePolicy>,
    #[serde(default)]
    pub childrens: BTreeMap<String, ChildCollection>,
    #[serde(default)]
    pub uniques: Vec<String>,
    #[serde(default)]
    pub cache: Option<CacheOptions>,
    /// Status key -> label.
    #[serde(default)]
    pub status: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_on_update: Vec<String>,
    #[serde(default)]
    pub ignore_on_save: Vec<String>,
    #[serde(default)]
    pub fill_ignore_if_exists: Vec<String>,
    #[serde(default)]
    pub fill_childrens: bool,
    #[serde(default)]
    pub detailed_values: Vec<String>,
    /// Columns stored as comma-separated text and read back as arrays.
    #[serde(default)]
    pub array_values: Vec<String>,
    /// Patterns removed from column names (after the prefix) when parsing rows.
    #[serde(default)]
    pub parse_regex: Vec<String>,
    #[serde(skip)]
    parse_patterns: Vec<Regex>,
}

impl SchemaDescriptor {
    pub fn new(entity: &str, table: &str, prefix: &str) -> Self {
        Self {
            entity: entity.to_string(),
            table: table.to_string(),
            prefix: prefix.to_string(),
            uniques: vec!["id".to_string(), "uuid".to_string()],
            ..Default::default()
        }
    }

    pub fn values(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn validate(mut self, field: &str, validation: FieldValidation) -> Self {
        self.validations.insert(field.to_string(), validation);
        self
    }

    pub fn relation(mut self, field: &str, relation: RelationField) -> Self {
        self.adapters.insert(field.to_string(), relation);
        self
    }

    pub fn file(mut self, field: &str, policy: FilePolicy) -> Self {
        self.files.insert(field.to_string(), policy);
        self
    }

    pub fn child(mut self, field: &str, child: ChildCollection) -> Self {
        self.childrens.insert(field.to_string(), child);
        self
    }

    pub fn uniques(mut self, uniques: &[&str]) -> Self {
        self.uniques = uniques.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn status(mut self, status: &[(&str, &str)]) -> Self {
        self.status = status
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn ignore_on_update(mut self, fields: &[&str]) -> Self {
        self.ignore_on_update = fields.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn ignore_on_save(mut self, fields: &[&str]) -> Self {
        self.ignore_on_save = fields.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn fill_ignore_if_exists(mut self, fields: &[&str]) -> Self {
        self.fill_ignore_if_exists = fields.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn fill_childrens(mut self, enabled: bool) -> Self {
        self.fill_childrens = enabled;
        self
    }

    pub fn detailed_values(mut self, fields: &[&str]) -> Self {
        self.detailed_values = fields.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn array_values(mut self, fields: &[&str]) -> Self {
        self.array_values = fields.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn parse_regex(mut self, patterns: &[&str]) -> Self {
        self.parse_regex = patterns.iter().map(|v| v.to_string()).collect();
        self
    }

    /// Compiles `parse_regex`. Called by the registry before the descriptor is shared.
    pub(crate) fn prepare(&mut self) -> Result<(), regex::Error> {
        self.parse_patterns = self
            .parse_regex
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    /// Backend column for a field.
    pub fn column(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    pub fn id_column(&self) -> String {
        self.column("id")
    }

    /// Cache group: the explicit group, else the lower-cased entity tag.
    pub fn cache_group(&self) -> String {
        self.cache
            .as_ref()
            .and_then(|c| c.group.clone())
            .unwrap_or_else(|| self.entity.to_lowercase())
    }

    pub fn cache_identifier(&self) -> Option<&str> {
        self.cache.as_ref().and_then(|c| c.identifier.as_deref())
    }

    pub fn is_public(&self, field: &str) -> bool {
        self.values.iter().any(|v| v == field)
    }

    pub fn relation_for(&self, field: &str) -> Option<&RelationField> {
        self.adapters.get(field)
    }

    pub fn is_file(&self, field: &str) -> bool {
        self.files.contains_key(field)
    }

    pub fn is_child(&self, field: &str) -> bool {
        self.childrens.contains_key(field)
    }

    /// Non-identity unique fields usable to locate a row.
    pub fn custom_uniques(&self) -> impl Iterator<Item = &str> {
        self.uniques
            .iter()
            .map(String::as_str)
            .filter(|u| !IDENTITY_FIELDS.contains(u))
    }

    /// Key of the status whose label is "archived" (case-insensitive).
    pub fn archived_status(&self) -> Option<&str> {
        self.status
            .iter()
            .find(|(_, label)| label.eq_ignore_ascii_case("archived"))
            .map(|(key, _)| key.as_str())
    }

    /// Fields `update` never writes.
    pub fn update_ignores(&self) -> Vec<&str> {
        ALWAYS_IGNORED_ON_UPDATE
            .iter()
            .copied()
            .chain(self.ignore_on_update.iter().map(String::as_str))
            .collect()
    }

    /// Maps a backend column or caller key to a field name.
    ///
    /// Foreign-key columns are matched on the raw key first, so columns that
    /// carry the entity prefix (self relations, explicit columns) still map
    /// back. Otherwise strips the prefix and the parse patterns, then retries
    /// the relation mapping on the stripped name.
    pub fn field_name(&self, key: &str) -> String {
        if key != self.id_column() {
            if let Some(field) = self.relation_for_column(key) {
                return field;
            }
        }
        let mut name = key.strip_prefix(self.prefix.as_str()).unwrap_or(key).to_string();
        for re in &self.parse_patterns {
            name = re.replace(&name, "").into_owned();
        }
        self.relation_for_column(&name).unwrap_or(name)
    }

    fn relation_for_column(&self, column: &str) -> Option<String> {
        self.adapters
            .iter()
            .find(|(field, rel)| rel.column_for(field) == column && column != field.as_str())
            .map(|(field, _)| field.clone())
    }

    /// Normalizes a backend row: field names, and `array_values` split on commas.
    pub fn parse_row(&self, row: Row) -> Row {
        let mut parsed = Row::new();
        for (key, value) in row {
            let field = self.field_name(&key);
            let value = match value {
                JsonValue::String(s) if self.array_values.contains(&field) => JsonValue::Array(
                    s.split(',')
                        .filter(|p| !p.is_empty())
                        .map(|p| JsonValue::String(p.to_string()))
                        .collect(),
                ),
                other => other,
            };
            parsed.insert(field, value);
        }
        parsed
    }

    /// Projects a raw backend row to this type's public values, optionally
    /// restricted to `requested`.
    pub fn public_values(&self, row: Row, requested: Option<&[&str]>) -> Row {
        self.parse_row(row)
            .into_iter()
            .filter(|(field, _)| requested.map_or(true, |r| r.contains(&field.as_str())))
            .filter(|(field, _)| self.is_public(field))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic() -> SchemaDescriptor {
        let mut d = SchemaDescriptor::new("Topic", "topics", "topic_")
            .values(&["uuid", "slug", "owner", "tags"])
            .relation("owner", RelationField::to("Target"))
            .array_values(&["tags"])
            .parse_regex(&["_legacy$"])
            .status(&[("-1", "ARCHIVED"), ("0", "MARKETING")]);
        d.prepare().unwrap();
        d
    }

    #[test]
    fn test_relation_column_naming() {
        assert_eq!(RelationField::to("Topic").column_for("topic"), "topic_id");
        assert_eq!(RelationField::to("Target").column_for("owner"), "target_owner_id");
        assert_eq!(RelationField::to("Target").column("owner_ref").column_for("owner"), "owner_ref");
    }

    #[test]
    fn test_parse_row_strips_prefix_patterns_and_maps_relations() {
        let d = topic();
        let row = json!({
            "topic_id": 1,
            "topic_slug_legacy": "news",
            "target_owner_id": 4,
            "topic_tags": "a,b,,c"
        });
        let parsed = d.parse_row(row.as_object().cloned().unwrap());
        assert_eq!(parsed.get("id"), Some(&json!(1)));
        assert_eq!(parsed.get("slug"), Some(&json!("news")));
        assert_eq!(parsed.get("owner"), Some(&json!(4)));
        assert_eq!(parsed.get("tags"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn test_prefixed_relation_columns_map_back_to_their_field() {
        let mut d = SchemaDescriptor::new("Category", "categories", "category_")
            .values(&["uuid", "name", "parent", "mirror"])
            .relation("parent", RelationField::to("Category"))
            .relation("mirror", RelationField::to("Topic").column("category_mirror_ref"));
        d.prepare().unwrap();

        assert_eq!(d.relation_for("parent").unwrap().column_for("parent"), "category_parent_id");
        assert_eq!(d.field_name("category_parent_id"), "parent");
        assert_eq!(d.field_name("category_mirror_ref"), "mirror");
        assert_eq!(d.field_name("category_name"), "name");

        let row = json!({"category_id": 2, "category_parent_id": 1, "category_mirror_ref": 5});
        let parsed = d.parse_row(row.as_object().cloned().unwrap());
        assert_eq!(parsed.get("parent"), Some(&json!(1)));
        assert_eq!(parsed.get("mirror"), Some(&json!(5)));
        assert!(!parsed.contains_key("parent_id"));
    }

    #[test]
    fn test_public_values_only_projects_declared_fields() {
        let d = topic();
        let row = json!({"topic_id": 1, "topic_uuid": "u", "topic_slug": "news", "topic_secret": "x"});
        let values = d.public_values(row.as_object().cloned().unwrap(), None);
        assert_eq!(values.len(), 2);
        assert!(values.contains_key("uuid") && values.contains_key("slug"));

        let row = json!({"topic_uuid": "u", "topic_slug": "news"});
        let values = d.public_values(row.as_object().cloned().unwrap(), Some(&["slug"]));
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["slug"]);
    }

    #[test]
    fn test_archived_status_and_cache_group() {
        let d = topic();
        assert_eq!(d.archived_status(), Some("-1"));
        assert_eq!(d.cache_group(), "topic");
        let d = d.cache(CacheOptions { group: Some("topics_v2".into()), identifier: Some("slug".into()) });
        assert_eq!(d.cache_group(), "topics_v2");
        assert_eq!(d.cache_identifier(), Some("slug"));
        assert_eq!(SchemaDescriptor::new("X", "x", "x_").archived_status(), None);
    }

    #[test]
    fn test_field_validation_deserializes_from_name_or_object() {
        let v: BTreeMap<String, FieldValidation> = serde_json::from_value(json!({
            "name": "string",
            "age": {"type": "number", "optional": true, "options": {"length": {"min": 0}}}
        }))
        .unwrap();
        assert_eq!(v["name"].validator, "string");
        assert!(!v["name"].optional);
        assert_eq!(v["age"].validator, "number");
        assert!(v["age"].optional);
        assert_eq!(v["age"].display_label("age"), "Age");
    }
}
