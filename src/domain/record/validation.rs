use super::{FieldValue, Record};
use crate::error::{Fault, FaultResult};
use crate::storage::backend::Row;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-field validation failures, keyed by field name.
pub type ValidationErrors = BTreeMap<String, String>;

/// Sanitized fields; `None` means the field was cleared.
pub type Validated = BTreeMap<String, Option<FieldValue>>;

impl Record {
    /// Validates one declared field.
    ///
    /// The candidate is the bag value, else the current value, else the
    /// declared default, else a fresh uuid for `uuid` validators. Relation
    /// fields resolve to records instead of running a scalar validator.
    pub(crate) fn validate_field(&self, field: &str, bag: &Row) -> Result<FieldValue, String> {
        let validation = self
            .schema
            .validations
            .get(field)
            .ok_or_else(|| format!("{} has no validation", field))?;
        let label = validation.display_label(field);
        let supplied = bag.get(field).filter(|v| !v.is_null()).cloned();

        if let Some(relation) = self.schema.relation_for(field) {
            if supplied.is_none() {
                if let Some(existing @ (FieldValue::Relation(_) | FieldValue::Relations(_))) = self.fields.get(field) {
                    return Ok(existing.clone());
                }
            }
            let mut candidate = supplied
                .or_else(|| self.get(field))
                .or_else(|| validation.default.clone());
            if let Some(parser) = &validation.parser {
                candidate = parser.apply(candidate);
            }
            return candidate
                .and_then(|raw| self.relation_value(field, &raw).ok().flatten())
                .ok_or_else(|| format!("{} is not a valid {}", label, relation.entity));
        }

        let mut candidate = supplied
            .or_else(|| self.get(field))
            .or_else(|| validation.default.clone())
            .or_else(|| {
                (validation.validator == "uuid").then(|| JsonValue::String(Uuid::new_v4().to_string()))
            });
        if let Some(parser) = &validation.parser {
            candidate = parser.apply(candidate);
        }
        self.service
            .validators()
            .validate(&validation.validator, candidate.as_ref(), &validation.options)
            .map(FieldValue::Value)
            .map_err(|reason| format!("{} {}", label, reason))
    }

    /// Validates every declared field against `bag` and the current values.
    ///
    /// All fields are evaluated before failing. A failing file field, optional
    /// field, or parser-derived field on a first validation is cleared instead
    /// of rejected. Fields in `ignore` never contribute to the error set.
    pub fn validate_data(&self, bag: &Row, ignore: &[&str], first: bool) -> Result<Validated, ValidationErrors> {
        let bag: Row = bag
            .iter()
            .map(|(k, v)| (self.schema.field_name(k), v.clone()))
            .collect();

        let mut validated = Validated::new();
        let mut errors = ValidationErrors::new();
        for (field, validation) in &self.schema.validations {
            match self.validate_field(field, &bag) {
                Ok(value) => {
                    validated.insert(field.clone(), Some(value));
                }
                Err(reason) => {
                    let clears = self.schema.is_file(field)
                        || (validation.from_parser && first)
                        || validation.optional;
                    if clears {
                        tracing::debug!(entity = %self.schema.entity, field = %field, error = %reason, "field cleared at validation");
                        validated.insert(field.clone(), None);
                    } else if ignore.contains(&field.as_str()) {
                        tracing::debug!(entity = %self.schema.entity, field = %field, error = %reason, "ignored validation failure");
                    } else {
                        errors.insert(field.clone(), reason);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(validated)
        } else {
            Err(errors)
        }
    }

    /// Validates `bag` and assigns the sanitized fields to the record.
    pub fn validate_params(&mut self, bag: &Row, ignore: &[&str], first: bool) -> FaultResult<()> {
        let validated = self
            .validate_data(bag, ignore, first)
            .map_err(|errors| Fault::client("Data rejected at validation").with_errors(errors))?;
        self.apply_validated(validated);
        Ok(())
    }

    pub(crate) fn apply_validated(&mut self, validated: Validated) {
        for (field, value) in validated {
            self.pending.remove(&field);
            self.assign(&field, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::app::record_service::RecordService;
    use crate::domain::record::FieldValue;
    use crate::domain::schema::{examples, FieldValidation, SchemaDescriptor, SchemaRegistry};
    use crate::storage::backend::Row;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Arc;

    fn service() -> Arc<RecordService> {
        let mut reg = SchemaRegistry::new();
        reg.register(examples::topic()).unwrap();
        reg.register(examples::notification()).unwrap();
        reg.register(
            SchemaDescriptor::new("Profile", "profiles", "profile_")
                .values(&["uuid", "name", "age", "nickname", "token", "avatar"])
                .validate("name", FieldValidation::new("string"))
                .validate("age", FieldValidation::new("number"))
                .validate("nickname", FieldValidation::new("string").optional())
                .validate(
                    "token",
                    FieldValidation::new("string")
                        .from_parser()
                        .parser(|v: Option<JsonValue>| v.map(|s| json!(format!("tk-{}", s)))),
                )
                .validate("avatar", FieldValidation::new("string"))
                .file("avatar", Default::default()),
        )
        .unwrap();
        RecordService::builder(reg).build()
    }

    fn bag(v: JsonValue) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_failures_are_aggregated_across_fields() {
        let svc = service();
        let rec = svc.record("Profile", json!({})).unwrap();
        let errors = rec.validate_data(&bag(json!({"age": "old"})), &[], false).unwrap_err();
        assert!(errors.contains_key("name"));
        assert!(errors.contains_key("age"));
        assert!(!errors.contains_key("nickname"));
        assert!(!errors.contains_key("avatar"));
    }

    #[test]
    fn test_ignored_fields_do_not_fail_validation() {
        let svc = service();
        let rec = svc.record("Profile", json!({})).unwrap();
        let validated = rec
            .validate_data(&bag(json!({"age": 3, "token": "x"})), &["name"], false)
            .unwrap();
        assert!(!validated.contains_key("name"));
        assert!(matches!(validated.get("age"), Some(Some(FieldValue::Value(v))) if v == &json!(3)));
        assert!(matches!(validated.get("token"), Some(Some(FieldValue::Value(v))) if v == &json!("tk-x")));
    }

    #[test]
    fn test_parser_fields_clear_on_first_validation() {
        let svc = service();
        let rec = svc.record("Profile", json!({})).unwrap();
        let bag = bag(json!({"name": "n", "age": 1}));
        let errors = rec.validate_data(&bag, &[], false).unwrap_err();
        assert_eq!(errors.keys().collect::<Vec<_>>(), vec!["token"]);
        let validated = rec.validate_data(&bag, &[], true).unwrap();
        assert!(matches!(validated.get("token"), Some(None)));
    }

    #[test]
    fn test_validate_params_assigns_and_defaults() {
        let svc = service();
        let mut rec = svc.record("Notification", json!({"slug": "welcome"})).unwrap();
        let owner = uuid::Uuid::new_v4().to_string();
        let pending = rec.pending().clone();
        let mut params = pending;
        params.insert("owner".into(), json!(owner));
        params.insert("message".into(), json!("Hello"));
        rec.validate_params(&params, &[], true).unwrap();
        assert_eq!(rec.get("payload"), Some(json!("{}")));
        assert_eq!(rec.get("owner"), Some(json!(owner)));
        assert!(rec.pending().is_empty());

        let err = rec
            .validate_params(&bag(json!({"slug": "x".repeat(65)})), &[], false)
            .unwrap_err();
        assert_eq!(err.message, "Data rejected at validation");
        assert!(err.data.errors.contains_key("slug"));
    }

    #[test]
    fn test_relation_fields_resolve_or_fail() {
        let svc = service();
        let schema = svc.schemas().get("Notification").unwrap();
        let mut strict = (*schema).clone();
        strict.validations.insert("topic".into(), FieldValidation::new("string"));
        let mut reg = SchemaRegistry::new();
        reg.register(examples::topic()).unwrap();
        reg.register(strict).unwrap();
        let svc = RecordService::builder(reg).build();

        let rec = svc.record("Notification", json!({})).unwrap();
        let validated = rec.validate_data(&bag(json!({"topic": 5})), &["owner", "slug", "message"], false).unwrap();
        assert!(matches!(validated.get("topic"), Some(Some(FieldValue::Relation(_)))));

        let errors = rec
            .validate_data(&bag(json!({"topic": "bogus"})), &["owner", "slug", "message"], false)
            .unwrap_err();
        assert_eq!(errors["topic"], "Topic is not a valid Topic");
    }
}
