//! Schema validation for raw extracted values.
//!
//! Extractors are untrusted. Every value they return passes through
//! [`validate_value`] before it reaches a session, whichever strategy
//! produced it.

use serde_json::Value;
use thiserror::Error;

use crate::domain::field::FieldValue;
use crate::schema::{FieldSpec, FieldType};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationRejected {
    #[error("field `{field}` expects {expected}, got {found}")]
    WrongType { field: String, expected: &'static str, found: &'static str },
    #[error("field `{field}` value `{value}` is not one of the allowed values")]
    NotAllowed { field: String, value: String },
    #[error("field `{field}` value {value} is outside the permitted range")]
    OutOfRange { field: String, value: i64 },
    #[error("field `{field}` value is blank or unusable")]
    Blank { field: String },
}

impl ValidationRejected {
    pub fn field(&self) -> &str {
        match self {
            Self::WrongType { field, .. }
            | Self::NotAllowed { field, .. }
            | Self::OutOfRange { field, .. }
            | Self::Blank { field } => field,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::WrongType { .. } => "wrong_type",
            Self::NotAllowed { .. } => "not_allowed",
            Self::OutOfRange { .. } => "out_of_range",
            Self::Blank { .. } => "blank",
        }
    }
}

pub fn validate_value(spec: &FieldSpec, raw: &Value) -> Result<FieldValue, ValidationRejected> {
    match spec.field_type {
        FieldType::String => text(spec, raw).map(FieldValue::Text),
        FieldType::Address => address(spec, raw).map(FieldValue::Text),
        FieldType::Integer => integer(spec, raw).map(FieldValue::Integer),
        FieldType::Boolean => boolean(spec, raw).map(FieldValue::Boolean),
        FieldType::Categorical => categorical(spec, raw).map(FieldValue::Text),
    }
}

/// Canonical form of a categorical value: `"Baby Grand"` -> `baby_grand`.
pub fn normalize_category(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn wrong_type(spec: &FieldSpec, expected: &'static str, raw: &Value) -> ValidationRejected {
    ValidationRejected::WrongType { field: spec.name.clone(), expected, found: kind(raw) }
}

fn text(spec: &FieldSpec, raw: &Value) -> Result<String, ValidationRejected> {
    let value = match raw {
        Value::String(value) => value.trim(),
        other => return Err(wrong_type(spec, "string", other)),
    };
    if value.is_empty() {
        return Err(ValidationRejected::Blank { field: spec.name.clone() });
    }
    Ok(value.to_string())
}

fn address(spec: &FieldSpec, raw: &Value) -> Result<String, ValidationRejected> {
    let value = text(spec, raw)?;
    let usable = value.chars().count() >= 3 && value.chars().any(char::is_alphanumeric);
    if !usable {
        return Err(ValidationRejected::Blank { field: spec.name.clone() });
    }
    Ok(value)
}

fn integer(spec: &FieldSpec, raw: &Value) -> Result<i64, ValidationRejected> {
    let value = match raw {
        Value::Number(number) => match number.as_i64() {
            Some(value) => value,
            None => match number.as_f64() {
                Some(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
                    value as i64
                }
                _ => return Err(wrong_type(spec, "integer", raw)),
            },
        },
        Value::String(value) => value.trim().parse::<i64>().map_err(|_| {
            ValidationRejected::WrongType {
                field: spec.name.clone(),
                expected: "integer",
                found: "string",
            }
        })?,
        other => return Err(wrong_type(spec, "integer", other)),
    };

    let below = spec.min.map(|min| value < min).unwrap_or(false);
    let above = spec.max.map(|max| value > max).unwrap_or(false);
    if below || above {
        return Err(ValidationRejected::OutOfRange { field: spec.name.clone(), value });
    }
    Ok(value)
}

fn boolean(spec: &FieldSpec, raw: &Value) -> Result<bool, ValidationRejected> {
    match raw {
        Value::Bool(value) => Ok(*value),
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            _ => Err(wrong_type(spec, "boolean", raw)),
        },
        other => Err(wrong_type(spec, "boolean", other)),
    }
}

fn categorical(spec: &FieldSpec, raw: &Value) -> Result<String, ValidationRejected> {
    let value = match raw {
        Value::String(value) => normalize_category(value),
        other => return Err(wrong_type(spec, "categorical string", other)),
    };

    let allowed = spec.allowed_values.as_ref().map(|allowed| allowed.contains(&value));
    if allowed == Some(true) {
        return Ok(value);
    }
    Err(ValidationRejected::NotAllowed { field: spec.name.clone(), value })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::field::FieldValue;
    use crate::schema::{FieldSpec, FieldType};

    use super::{normalize_category, validate_value, ValidationRejected};

    fn piano_type() -> FieldSpec {
        FieldSpec::categorical("piano_type", ["upright", "baby_grand", "grand"])
    }

    #[test]
    fn categorical_outside_allowed_values_is_rejected() {
        let error = validate_value(&piano_type(), &json!("spinet")).expect_err("spinet");
        assert_eq!(
            error,
            ValidationRejected::NotAllowed {
                field: "piano_type".to_string(),
                value: "spinet".to_string()
            }
        );
    }

    #[test]
    fn categorical_values_are_normalized_before_membership_check() {
        assert_eq!(normalize_category("  Baby Grand "), "baby_grand");
        assert_eq!(normalize_category("baby-grand"), "baby_grand");
        assert_eq!(
            validate_value(&piano_type(), &json!("Baby Grand")).expect("valid"),
            FieldValue::Text("baby_grand".to_string())
        );
    }

    #[test]
    fn integers_accept_numbers_and_digit_strings_within_bounds() {
        let stairs = FieldSpec::new("stairs_count", FieldType::Integer).with_bounds(Some(0), None);

        assert_eq!(validate_value(&stairs, &json!(4)).expect("4"), FieldValue::Integer(4));
        assert_eq!(validate_value(&stairs, &json!("12")).expect("12"), FieldValue::Integer(12));
        assert_eq!(validate_value(&stairs, &json!(3.0)).expect("3.0"), FieldValue::Integer(3));
        assert!(matches!(
            validate_value(&stairs, &json!(-2)),
            Err(ValidationRejected::OutOfRange { value: -2, .. })
        ));
        assert!(matches!(
            validate_value(&stairs, &json!(2.5)),
            Err(ValidationRejected::WrongType { .. })
        ));
        assert!(validate_value(&stairs, &json!("a few")).is_err());
    }

    #[test]
    fn booleans_accept_yes_no_strings_only() {
        let insurance = FieldSpec::new("needs_insurance", FieldType::Boolean);

        assert_eq!(
            validate_value(&insurance, &json!(true)).expect("bool"),
            FieldValue::Boolean(true)
        );
        assert_eq!(
            validate_value(&insurance, &json!("No")).expect("no"),
            FieldValue::Boolean(false)
        );
        assert!(validate_value(&insurance, &json!("maybe")).is_err());
        assert!(validate_value(&insurance, &json!(1)).is_err());
    }

    #[test]
    fn addresses_must_be_non_blank_text() {
        let address = FieldSpec::new("pickup_address", FieldType::Address);

        assert_eq!(
            validate_value(&address, &json!(" 12 Grand Ave, Tifton ")).expect("address"),
            FieldValue::Text("12 Grand Ave, Tifton".to_string())
        );
        assert!(matches!(
            validate_value(&address, &json!("  ")),
            Err(ValidationRejected::Blank { .. })
        ));
        assert!(validate_value(&address, &json!("..")).is_err());
        assert!(validate_value(&address, &json!({"street": "x"})).is_err());
    }
}
