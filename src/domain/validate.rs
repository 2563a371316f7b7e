//! Named field validators.
//!
//! A validator either returns the sanitized value or a human-readable reason.
//! Records look validators up by the name a schema declares.

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Inclusive bounds. Numeric range for `number`, character count for `string`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LengthBounds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl LengthBounds {
    fn check(&self, n: f64, what: &str) -> Result<(), String> {
        if let Some(min) = self.min {
            if n < min {
                return Err(format!("{} must be at least {}", what, min));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(format!("{} must be at most {}", what, max));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorOptions {
    /// Display name used in error messages.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub length: Option<LengthBounds>,
    /// Allowed values for `enum`.
    #[serde(default)]
    pub values: Vec<JsonValue>,
    /// Regex a `string` must match.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl ValidatorOptions {
    pub fn with_min(min: f64) -> Self {
        Self {
            length: Some(LengthBounds { min: Some(min), max: None }),
            ..Default::default()
        }
    }
}

pub trait Validator: Send + Sync {
    /// Sanitizes `value` (absent when `None`) or explains why it is rejected.
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String>;
}

impl<F> Validator for F
where
    F: Fn(Option<&JsonValue>, &ValidatorOptions) -> Result<JsonValue, String> + Send + Sync,
{
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String> {
        self(value, options)
    }
}

fn present(value: Option<&JsonValue>) -> Result<&JsonValue, String> {
    match value {
        None | Some(JsonValue::Null) => Err("is required".to_string()),
        Some(v) => Ok(v),
    }
}

/// Non-negative and negative integers or floats, from numbers or numeric strings.
pub struct NumberValidator;

impl Validator for NumberValidator {
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String> {
        let n = match present(value)? {
            JsonValue::Number(n) => n.clone(),
            JsonValue::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    i.into()
                } else {
                    let f = s
                        .parse::<f64>()
                        .map_err(|_| format!("'{}' is not a number", s))?;
                    serde_json::Number::from_f64(f).ok_or_else(|| format!("'{}' is not a number", s))?
                }
            }
            other => return Err(format!("{} is not a number", other)),
        };
        let as_f64 = n.as_f64().ok_or_else(|| "is not a number".to_string())?;
        if let Some(bounds) = &options.length {
            bounds.check(as_f64, "value")?;
        }
        Ok(JsonValue::Number(n))
    }
}

pub struct UuidValidator;

impl Validator for UuidValidator {
    fn validate(&self, value: Option<&JsonValue>, _options: &ValidatorOptions) -> Result<JsonValue, String> {
        let raw = present(value)?
            .as_str()
            .ok_or_else(|| "is not a valid uuid".to_string())?;
        let parsed = Uuid::parse_str(raw.trim()).map_err(|_| format!("'{}' is not a valid uuid", raw))?;
        Ok(JsonValue::String(parsed.hyphenated().to_string()))
    }
}

pub struct StringValidator;

impl Validator for StringValidator {
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String> {
        let s = match present(value)? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            _ => return Err("is not a string".to_string()),
        };
        if let Some(bounds) = &options.length {
            bounds.check(s.chars().count() as f64, "length")?;
        }
        if let Some(pattern) = &options.pattern {
            let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            if !re.is_match(&s) {
                return Err(format!("'{}' has an invalid format", s));
            }
        }
        Ok(JsonValue::String(s))
    }
}

/// Coerces truthiness; never fails.
pub struct BooleanValidator;

impl Validator for BooleanValidator {
    fn validate(&self, value: Option<&JsonValue>, _options: &ValidatorOptions) -> Result<JsonValue, String> {
        let truthy = match value {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(JsonValue::String(s)) => {
                !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
            }
            Some(_) => true,
        };
        Ok(JsonValue::Bool(truthy))
    }
}

pub struct EmailValidator;

impl Validator for EmailValidator {
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String> {
        let s = StringValidator.validate(value, options)?;
        let text = s.as_str().unwrap_or_default().to_lowercase();
        let valid = match text.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
            }
            None => false,
        };
        if !valid {
            return Err(format!("'{}' is not a valid email", text));
        }
        Ok(JsonValue::String(text))
    }
}

/// Accepts RFC 3339 timestamps and `YYYY-MM-DD` / `YYYY/MM/DD` dates,
/// normalized to `YYYY-MM-DD`.
pub struct DateValidator;

impl Validator for DateValidator {
    fn validate(&self, value: Option<&JsonValue>, _options: &ValidatorOptions) -> Result<JsonValue, String> {
        let raw = present(value)?
            .as_str()
            .ok_or_else(|| "is not a date".to_string())?
            .trim();
        let date = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.date_naive())
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
            .map_err(|_| format!("'{}' is not a date", raw))?;
        Ok(JsonValue::String(date.format("%Y-%m-%d").to_string()))
    }
}

/// Structured data; stored as its JSON text.
pub struct JsonValidator;

impl Validator for JsonValidator {
    fn validate(&self, value: Option<&JsonValue>, _options: &ValidatorOptions) -> Result<JsonValue, String> {
        match present(value)? {
            JsonValue::String(s) => {
                let parsed: JsonValue = serde_json::from_str(s).map_err(|_| "is not valid JSON".to_string())?;
                Ok(JsonValue::String(parsed.to_string()))
            }
            v @ (JsonValue::Object(_) | JsonValue::Array(_)) => Ok(JsonValue::String(v.to_string())),
            _ => Err("must be an object or an array".to_string()),
        }
    }
}

pub struct EnumValidator;

impl Validator for EnumValidator {
    fn validate(&self, value: Option<&JsonValue>, options: &ValidatorOptions) -> Result<JsonValue, String> {
        let v = present(value)?;
        let hit = options.values.iter().find(|allowed| {
            *allowed == v || allowed.as_str().zip(v.as_str()).is_some_and(|(a, b)| a.eq_ignore_ascii_case(b))
        });
        match hit {
            Some(allowed) => Ok(allowed.clone()),
            None => Err(format!("{} is not one of the allowed values", v)),
        }
    }
}

/// Registry of validators by name.
#[derive(Clone)]
pub struct ValidatorSet {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidatorSet {
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// The built-in validators: number, uuid, string, boolean, email, date, json, enum.
    pub fn standard() -> Self {
        let mut set = Self::empty();
        set.register("number", NumberValidator);
        set.register("uuid", UuidValidator);
        set.register("string", StringValidator);
        set.register("boolean", BooleanValidator);
        set.register("email", EmailValidator);
        set.register("date", DateValidator);
        set.register("json", JsonValidator);
        set.register("enum", EnumValidator);
        set
    }

    pub fn register<V: Validator + 'static>(&mut self, name: &str, validator: V) {
        self.validators.insert(name.to_string(), Arc::new(validator));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Runs the validator called `name`; unknown names fall back to `string`.
    pub fn validate(
        &self,
        name: &str,
        value: Option<&JsonValue>,
        options: &ValidatorOptions,
    ) -> Result<JsonValue, String> {
        match self.validators.get(name) {
            Some(v) => v.validate(value, options),
            None => {
                tracing::debug!(validator = name, "unknown validator, falling back to string");
                StringValidator.validate(value, options)
            }
        }
    }
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self::standard()
    }
}
