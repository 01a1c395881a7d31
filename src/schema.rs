//! Schema types for describing provider configuration and resource types.
//!
//! A [`ResourceType`] pairs an input [`Schema`] with an output [`Schema`].
//! Input attributes additionally carry a [`ChangePolicy`], which is the
//! policy table the diff engine consults when inputs change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The semantic type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// A list of values of a single type.
    List(Box<AttributeType>),
    /// A map from string keys to values of a single type.
    Map(Box<AttributeType>),
    /// Any JSON value.
    Dynamic,
}

impl AttributeType {
    /// Create a list type.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute must be set.
    pub required: bool,
    /// The attribute may be omitted.
    pub optional: bool,
    /// The attribute is produced by the provider.
    pub computed: bool,
    /// The value must not appear in logs or plans.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Flags for a computed attribute.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }
}

/// What a change to an input attribute means for the live resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// The resource must be destroyed and recreated.
    Immutable,
    /// The resource can be updated in place.
    #[default]
    Mutable,
    /// The change never reaches the resource.
    Ignored,
}

/// Describes a single attribute in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How changes to this attribute are applied.
    #[serde(default)]
    pub policy: ChangePolicy,
    /// Value used when the attribute is not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            policy: ChangePolicy::default(),
            default: None,
        }
    }

    /// A required attribute of the given type.
    pub fn required(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::required())
    }

    /// An optional attribute of the given type.
    pub fn optional(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::optional())
    }

    /// A provider-computed attribute of the given type.
    pub fn computed(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::computed())
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Changing this attribute forces replacement.
    pub fn immutable(mut self) -> Self {
        self.policy = ChangePolicy::Immutable;
        self
    }

    /// Changes to this attribute are not applied to the resource.
    pub fn ignored(mut self) -> Self {
        self.policy = ChangePolicy::Ignored;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }
}

/// An ordered set of named attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Schema {
    /// The version of this schema.
    #[serde(default)]
    pub version: u64,
    /// Attributes keyed by property name.
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Schema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }
}

/// The static description of one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    /// Type identifier, unique within the registry.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Properties the caller provides.
    pub inputs: Schema,
    /// Properties the provider returns.
    pub outputs: Schema,
    /// Replacement must delete the old resource before creating the new one.
    #[serde(default)]
    pub delete_before_replace: bool,
}

impl ResourceType {
    /// Create a resource type with empty schemas.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Schema::v0(),
            outputs: Schema::v0(),
            delete_before_replace: false,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an input attribute.
    pub fn with_input(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.inputs.attributes.insert(name.into(), attr);
        self
    }

    /// Add an output attribute.
    pub fn with_output(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.outputs.attributes.insert(name.into(), attr);
        self
    }

    /// Require delete-before-create on replacement.
    pub fn with_delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }
}

/// Everything the provider describes about itself, as served by `GetSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Schema for provider configuration.
    pub provider: Schema,
    /// Every registered resource type.
    pub resources: Vec<ResourceType>,
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// The value is unusable.
    Error,
    /// The value is usable but suspicious.
    Warning,
}

/// A validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }

    /// Summary and detail in one line.
    pub fn message(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}: {}", self.summary, detail),
            None => self.summary.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_type_constructors() {
        let list = AttributeType::list(AttributeType::String);
        assert!(matches!(list, AttributeType::List(_)));

        let map = AttributeType::map(AttributeType::Int64);
        assert!(matches!(map, AttributeType::Map(_)));
    }

    #[test]
    fn test_attribute_builders() {
        let attr = Attribute::required(AttributeType::Int64)
            .with_description("Number of characters")
            .immutable();

        assert_eq!(attr.attr_type, AttributeType::Int64);
        assert!(attr.flags.required);
        assert_eq!(attr.policy, ChangePolicy::Immutable);

        let attr = Attribute::optional(AttributeType::String)
            .with_default(json!("utf8"))
            .ignored();
        assert!(attr.flags.optional);
        assert_eq!(attr.default, Some(json!("utf8")));
        assert_eq!(attr.policy, ChangePolicy::Ignored);
    }

    #[test]
    fn test_default_policy_is_mutable() {
        let attr = Attribute::optional(AttributeType::String);
        assert_eq!(attr.policy, ChangePolicy::Mutable);
    }

    #[test]
    fn test_resource_type_builder() {
        let ty = ResourceType::new("Example")
            .with_input("name", Attribute::required(AttributeType::String).immutable())
            .with_output("id", Attribute::computed(AttributeType::String))
            .with_delete_before_replace();

        assert_eq!(ty.name, "Example");
        assert!(ty.inputs.attribute("name").is_some());
        assert!(ty.outputs.attribute("id").is_some());
        assert!(ty.delete_before_replace);
    }

    #[test]
    fn test_schema_serializes_policy() {
        let schema = Schema::v0().with_attribute(
            "length",
            Attribute::required(AttributeType::Int64).immutable(),
        );
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["attributes"]["length"]["policy"], "immutable");
        assert_eq!(value["attributes"]["length"]["type"], "int64");
        assert_eq!(value["attributes"]["length"]["required"], true);
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid value")
            .with_detail("must be positive")
            .with_attribute("length");

        assert!(err.is_error());
        assert_eq!(err.message(), "Invalid value: must be positive");
        assert_eq!(err.attribute, Some("length".to_string()));
        assert!(!Diagnostic::warning("hmm").is_error());
    }
}
