//! The provider this crate ships: the built-in resource types behind the
//! [`ProviderService`] trait.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ConfigNegotiator, ProviderContext};
use crate::diff::DiffResult;
use crate::engine::{LifecycleEngine, ResourceKind};
use crate::error::ProviderError;
use crate::registry::SchemaRegistry;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{CheckResult, Operation, PropertyMap, ResourceOutcome};

/// Serves `Random` and `LocalFile`.
#[derive(Debug)]
pub struct LifecycleProvider {
    registry: Arc<SchemaRegistry>,
    negotiator: ConfigNegotiator,
    engine: LifecycleEngine,
}

impl LifecycleProvider {
    /// Create an unconfigured provider with every built-in type registered.
    pub fn new() -> Result<Self, ProviderError> {
        let registry = Arc::new(SchemaRegistry::builtin()?);
        debug!(types = ?registry.type_names(), "Schema registry built");
        Ok(Self {
            engine: LifecycleEngine::new(Arc::clone(&registry)),
            negotiator: ConfigNegotiator::new(),
            registry,
        })
    }

    /// Configure from a value obtained outside the RPC surface, such as the
    /// environment. Returns the warnings.
    pub fn preconfigure(&self, raw: &Value) -> Result<Vec<String>, ProviderError> {
        self.negotiator.configure(raw).map(|(_, warnings)| warnings)
    }

    /// The registry this provider serves.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    fn kind(&self, resource_type: &str) -> Result<ResourceKind, ProviderError> {
        self.registry.lookup(resource_type)?;
        resource_type.parse()
    }

    fn context(&self) -> Result<ProviderContext, ProviderError> {
        self.negotiator.context()
    }
}

#[async_trait::async_trait]
impl ProviderService for LifecycleProvider {
    fn schema(&self) -> ProviderSchema {
        self.registry.provider_schema()
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let (config, warnings) = self.negotiator.configure(&config)?;
        info!(region = %config.region, warnings = warnings.len(), "Configuration accepted");
        Ok(warnings.into_iter().map(Diagnostic::warning).collect())
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        info!("Provider stopping");
        Ok(())
    }

    async fn check(&self, resource_type: &str, inputs: PropertyMap) -> Result<CheckResult, ProviderError> {
        let kind = self.kind(resource_type)?;
        self.engine.check(kind, inputs)
    }

    async fn diff(
        &self,
        resource_type: &str,
        old_inputs: PropertyMap,
        new_inputs: PropertyMap,
    ) -> Result<DiffResult, ProviderError> {
        let kind = self.kind(resource_type)?;
        self.engine.diff(kind, &old_inputs, &new_inputs)
    }

    async fn create(
        &self,
        op: &Operation,
        resource_type: &str,
        inputs: PropertyMap,
        preview: bool,
    ) -> Result<ResourceOutcome, ProviderError> {
        let kind = self.kind(resource_type)?;
        let ctx = self.context()?;
        self.engine.create(&ctx, op, kind, inputs, preview).await
    }

    async fn read(&self, op: &Operation, resource_type: &str, state: &[u8]) -> Result<PropertyMap, ProviderError> {
        let kind = self.kind(resource_type)?;
        let ctx = self.context()?;
        self.engine.read(&ctx, op, kind, state).await
    }

    async fn update(
        &self,
        op: &Operation,
        resource_type: &str,
        old_state: &[u8],
        new_inputs: PropertyMap,
    ) -> Result<ResourceOutcome, ProviderError> {
        let kind = self.kind(resource_type)?;
        let ctx = self.context()?;
        self.engine.update(&ctx, op, kind, old_state, new_inputs).await
    }

    async fn delete(&self, op: &Operation, resource_type: &str, state: &[u8]) -> Result<(), ProviderError> {
        let kind = self.kind(resource_type)?;
        let ctx = self.context()?;
        self.engine.delete(&ctx, op, kind, state).await
    }
}
