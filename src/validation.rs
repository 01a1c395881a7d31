//! Schema validation helpers.
//!
//! Validates a JSON property map against a [`Schema`], reporting every
//! problem with a dotted property path, and fills in schema defaults.
//!
//! # Example
//!
//! ```
//! use lifecycle_provider::schema::{Attribute, AttributeType, Schema};
//! use lifecycle_provider::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::required(AttributeType::String))
//!     .with_attribute("count", Attribute::optional(AttributeType::Int64));
//!
//! assert!(validate(&schema, &json!({"name": "test", "count": 42})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"name": "test", "count": "many"}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("count".to_string()));
//! ```

use serde_json::Value;

use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeType, Diagnostic, Schema};
use crate::types::PropertyMap;

/// Validate a JSON value against a schema.
///
/// Returns one diagnostic per problem; an empty list means the value is valid.
///
/// - The value must be an object
/// - Required attributes must be present and non-null
/// - Computed-only attributes are skipped
/// - Attribute types must match the schema
/// - Properties the schema does not know are rejected
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let Value::Object(obj) = value else {
        diagnostics.push(
            Diagnostic::error("Expected object").with_detail(format!("Got {}", value_type_name(value))),
        );
        return diagnostics;
    };

    for (name, attr) in &schema.attributes {
        validate_attribute(attr, obj.get(name), name, &mut diagnostics);
    }

    for name in obj.keys() {
        if !schema.attributes.contains_key(name) {
            diagnostics.push(
                Diagnostic::error(format!("Unknown attribute '{}'", name))
                    .with_detail("The schema does not declare this attribute")
                    .with_attribute(name.as_str()),
            );
        }
    }

    diagnostics
}

/// Validate a JSON value against a schema, returning Ok if valid or Err with diagnostics.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics: Vec<_> = validate(schema, value)
        .into_iter()
        .filter(Diagnostic::is_error)
        .collect();
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Check if a JSON value is valid against a schema.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate_result(schema, value).is_ok()
}

/// Fill every unset optional attribute that has a default.
pub fn apply_defaults(schema: &Schema, properties: &mut PropertyMap) {
    for (name, attr) in &schema.attributes {
        let Some(default) = &attr.default else {
            continue;
        };
        let unset = properties.get(name).map_or(true, Value::is_null);
        if unset {
            properties.insert(name.clone(), default.clone());
        }
    }
}

/// Rewrite whole-number floats such as `24.0` as integers wherever the
/// schema declares an `int64`, so later checks and comparisons see `24`.
pub fn normalize_integers(schema: &Schema, properties: &mut PropertyMap) {
    for (name, attr) in &schema.attributes {
        if let Some(value) = properties.get_mut(name) {
            normalize_value(&attr.attr_type, value);
        }
    }
}

/// Collapse a list of error diagnostics into one validation error.
pub fn into_validation_error(diagnostics: Vec<Diagnostic>) -> ProviderError {
    let property_path = diagnostics.iter().find_map(|d| d.attribute.clone());
    let message = diagnostics
        .iter()
        .map(Diagnostic::message)
        .collect::<Vec<_>>()
        .join("; ");
    ProviderError::Validation {
        message,
        property_path,
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => validate_attribute_type(&attr.attr_type, v, path, diagnostics),
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !value.is_number() {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) => match value.as_array() {
            Some(arr) => {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "list", value)),
        },
        AttributeType::Map(value_type) => match value.as_object() {
            Some(obj) => {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "map", value)),
        },
        AttributeType::Dynamic => {},
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    matches!(value, Value::Number(n) if n.is_i64())
}

fn whole_float(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    if n.is_i64() || n.is_u64() {
        return None;
    }
    n.as_f64()
        .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
        .map(|f| f as i64)
}

fn normalize_value(attr_type: &AttributeType, value: &mut Value) {
    match attr_type {
        AttributeType::Int64 => {
            if let Some(i) = whole_float(value) {
                *value = Value::from(i);
            }
        },
        AttributeType::List(element_type) => {
            if let Value::Array(arr) = value {
                arr.iter_mut().for_each(|v| normalize_value(element_type, v));
            }
        },
        AttributeType::Map(value_type) => {
            if let Value::Object(obj) = value {
                obj.values_mut().for_each(|v| normalize_value(value_type, v));
            }
        },
        _ => {},
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeType, Schema};
    use serde_json::json;

    fn object(value: Value) -> PropertyMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_validate_required_string() {
        let schema = Schema::v0().with_attribute("name", Attribute::required(AttributeType::String));

        assert!(validate(&schema, &json!({"name": "test"})).is_empty());

        let diagnostics = validate(&schema, &json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("name".to_string()));

        let diagnostics = validate(&schema, &json!({"name": null}));
        assert_eq!(diagnostics.len(), 1);

        let diagnostics = validate(&schema, &json!({"name": 123}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Invalid type"));
    }

    #[test]
    fn test_validate_optional_attribute() {
        let schema = Schema::v0().with_attribute("count", Attribute::optional(AttributeType::Int64));

        assert!(validate(&schema, &json!({"count": 42})).is_empty());
        assert!(validate(&schema, &json!({})).is_empty());
        assert!(validate(&schema, &json!({"count": null})).is_empty());
        assert_eq!(validate(&schema, &json!({"count": "nope"})).len(), 1);
    }

    #[test]
    fn test_validate_computed_attribute_skipped() {
        let schema = Schema::v0().with_attribute("id", Attribute::computed(AttributeType::String));

        assert!(validate(&schema, &json!({})).is_empty());
        assert!(validate(&schema, &json!({"id": 123})).is_empty());
    }

    #[test]
    fn test_validate_int64() {
        let schema = Schema::v0().with_attribute("length", Attribute::required(AttributeType::Int64));

        assert!(validate(&schema, &json!({"length": 24})).is_empty());
        assert_eq!(validate(&schema, &json!({"length": 24.0})).len(), 1);
        assert_eq!(validate(&schema, &json!({"length": 24.5})).len(), 1);
        assert_eq!(validate(&schema, &json!({"length": "24"})).len(), 1);
    }

    #[test]
    fn test_validate_map_paths() {
        let schema = Schema::v0().with_attribute(
            "labels",
            Attribute::optional(AttributeType::map(AttributeType::String)),
        );

        assert!(validate(&schema, &json!({"labels": {"env": "prod"}})).is_empty());

        let diagnostics = validate(&schema, &json!({"labels": {"env": "prod", "count": 42}}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("labels.count".to_string()));
    }

    #[test]
    fn test_validate_list_paths() {
        let schema = Schema::v0().with_attribute(
            "tags",
            Attribute::required(AttributeType::list(AttributeType::String)),
        );

        let diagnostics = validate(&schema, &json!({"tags": ["a", 1, "c"]}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("tags.1".to_string()));
    }

    #[test]
    fn test_validate_unknown_attribute() {
        let schema = Schema::v0().with_attribute("name", Attribute::required(AttributeType::String));

        let diagnostics = validate(&schema, &json!({"name": "x", "nmae": "typo"}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("nmae".to_string()));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required(AttributeType::String))
            .with_attribute("count", Attribute::required(AttributeType::Int64))
            .with_attribute("enabled", Attribute::required(AttributeType::Bool));

        let diagnostics = validate(&schema, &json!({"name": 123, "enabled": "yes"}));
        assert_eq!(diagnostics.len(), 3);
    }

    #[test]
    fn test_validate_root_not_object() {
        let schema = Schema::v0().with_attribute("name", Attribute::required(AttributeType::String));

        let diagnostics = validate(&schema, &json!("not an object"));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Expected object"));
    }

    #[test]
    fn test_apply_defaults() {
        let schema = Schema::v0()
            .with_attribute(
                "charset",
                Attribute::optional(AttributeType::String).with_default(json!("alphanumeric")),
            )
            .with_attribute("note", Attribute::optional(AttributeType::String));

        let mut props = object(json!({"note": null}));
        apply_defaults(&schema, &mut props);
        assert_eq!(props["charset"], "alphanumeric");
        assert!(props["note"].is_null());

        let mut props = object(json!({"charset": "hex"}));
        apply_defaults(&schema, &mut props);
        assert_eq!(props["charset"], "hex");
    }

    #[test]
    fn test_normalize_integers() {
        let schema = Schema::v0()
            .with_attribute("length", Attribute::required(AttributeType::Int64))
            .with_attribute("sizes", Attribute::optional(AttributeType::list(AttributeType::Int64)))
            .with_attribute("ratio", Attribute::optional(AttributeType::Float64));

        let mut props = object(json!({"length": 24.0, "sizes": [1.0, 2.5], "ratio": 2.0}));
        normalize_integers(&schema, &mut props);
        assert_eq!(props["length"], json!(24));
        assert!(props["length"].is_i64());
        assert_eq!(props["sizes"], json!([1, 2.5]));
        assert!(props["ratio"].is_f64());

        // Only whole numbers become integers; the rest still fails validation.
        assert_eq!(validate(&schema, &Value::Object(props)).len(), 1);
    }

    #[test]
    fn test_into_validation_error_points_at_first_problem() {
        let schema = Schema::v0()
            .with_attribute("a", Attribute::required(AttributeType::String))
            .with_attribute("b", Attribute::required(AttributeType::String));

        let err = into_validation_error(validate(&schema, &json!({"b": 1})));
        assert_eq!(err.property_path(), Some("a"));
        let message = err.to_string();
        assert!(message.contains("'a'"));
        assert!(message.contains("'b'"));
    }

    #[test]
    fn test_is_valid_helper() {
        let schema = Schema::v0().with_attribute("name", Attribute::required(AttributeType::String));

        assert!(is_valid(&schema, &json!({"name": "test"})));
        assert!(!is_valid(&schema, &json!({})));
    }
}
