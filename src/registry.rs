//! The schema registry: every resource type this provider serves.
//!
//! Built once at startup and shared read-only behind an [`Arc`](std::sync::Arc).

use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::schema::{ProviderSchema, ResourceType, Schema};

/// Static descriptions of the provider configuration and resource types.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, ResourceType>,
    provider_config: Schema,
}

impl SchemaRegistry {
    /// Create an empty registry with the given provider configuration schema.
    pub fn new(provider_config: Schema) -> Self {
        Self {
            types: BTreeMap::new(),
            provider_config,
        }
    }

    /// The registry holding every built-in resource type.
    pub fn builtin() -> Result<Self, ProviderError> {
        let mut registry = Self::new(crate::config::provider_config_schema());
        for kind in crate::engine::ResourceKind::ALL {
            registry.register(kind.resource_type())?;
        }
        Ok(registry)
    }

    /// Register a resource type. Names are unique.
    pub fn register(&mut self, ty: ResourceType) -> Result<(), ProviderError> {
        if self.types.contains_key(&ty.name) {
            return Err(ProviderError::DuplicateType(ty.name));
        }
        self.types.insert(ty.name.clone(), ty);
        Ok(())
    }

    /// Look up a resource type by name.
    pub fn lookup(&self, name: &str) -> Result<&ResourceType, ProviderError> {
        self.types
            .get(name)
            .ok_or_else(|| ProviderError::UnknownType(name.to_string()))
    }

    /// Every registered type, ordered by name.
    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.types.values()
    }

    /// Names of every registered type, ordered.
    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// The provider configuration schema.
    pub fn provider_config(&self) -> &Schema {
        &self.provider_config
    }

    /// The full description served by `GetSchema`.
    pub fn provider_schema(&self) -> ProviderSchema {
        ProviderSchema {
            provider: self.provider_config.clone(),
            resources: self.types.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeType};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SchemaRegistry::default();
        registry
            .register(
                ResourceType::new("Example")
                    .with_input("name", Attribute::required(AttributeType::String)),
            )
            .unwrap();

        let ty = registry.lookup("Example").unwrap();
        assert!(ty.inputs.attribute("name").is_some());
        assert_eq!(registry.type_names(), vec!["Example".to_string()]);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = SchemaRegistry::default();
        registry.register(ResourceType::new("Example")).unwrap();

        let err = registry.register(ResourceType::new("Example")).unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateType(name) if name == "Example"));
    }

    #[test]
    fn test_unknown_type() {
        let registry = SchemaRegistry::default();
        let err = registry.lookup("Missing").unwrap_err();
        assert!(matches!(err, ProviderError::UnknownType(name) if name == "Missing"));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = SchemaRegistry::builtin().unwrap();
        assert!(registry.lookup("Random").is_ok());
        assert!(registry.lookup("LocalFile").is_ok());
        assert!(registry.provider_config().attribute("region").is_some());

        let schema = registry.provider_schema();
        assert_eq!(schema.resources.len(), 2);
    }
}
