//! The resource lifecycle engine.
//!
//! Each resource type implements [`ResourceLifecycle`]. The
//! [`LifecycleEngine`] wraps those handlers with everything that is the same
//! for every type: input validation and defaults, the diff decision before an
//! update, output completeness, and the state blob codec.
//!
//! A resource moves through `Unknown → Creating → Live → (Updating → Live)* →
//! Deleting → Gone`. Only `Live` ever reaches a state blob.

pub mod local_file;
pub mod random;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProviderContext;
use crate::diff::{diff, DiffDecision, DiffResult};
use crate::error::ProviderError;
use crate::registry::SchemaRegistry;
use crate::schema::{Diagnostic, ResourceType};
use crate::state::{self, ResourceState};
use crate::types::{CheckResult, Operation, PropertyMap, ResourceOutcome};
use crate::validation::{apply_defaults, into_validation_error, normalize_integers, validate};

use self::local_file::LocalFileResource;
use self::random::RandomResource;

/// Every resource type this provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A generated random string.
    Random,
    /// A file under the configured root directory.
    LocalFile,
}

impl ResourceKind {
    /// All kinds, in registration order.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Random, ResourceKind::LocalFile];

    /// The registered type name.
    pub fn type_name(self) -> &'static str {
        match self {
            ResourceKind::Random => "Random",
            ResourceKind::LocalFile => "LocalFile",
        }
    }

    /// The static description of this kind.
    pub fn resource_type(self) -> ResourceType {
        match self {
            ResourceKind::Random => RandomResource.resource_type(),
            ResourceKind::LocalFile => LocalFileResource.resource_type(),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.type_name() == s)
            .ok_or_else(|| ProviderError::UnknownType(s.to_string()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Everything a handler call can see.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext<'a> {
    /// Accepted provider configuration.
    pub provider: &'a ProviderContext,
    /// Engine-assigned resource identifier.
    pub urn: &'a str,
    /// Cancelled when the caller gives up.
    pub cancel: &'a CancellationToken,
}

impl<'a> OperationContext<'a> {
    /// Build a context for one operation.
    pub fn new(provider: &'a ProviderContext, op: &'a Operation) -> Self {
        Self {
            provider,
            urn: &op.urn,
            cancel: &op.cancel,
        }
    }

    /// Run one step of external I/O, giving up as soon as the operation is
    /// cancelled. A cancelled step may or may not have taken effect.
    pub async fn guard<F, T>(&self, step: &str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled(format!("{} ({})", step, self.urn))),
            out = fut => Ok(out),
        }
    }
}

/// What a handler produced for a live resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Produced {
    /// Outputs reported to the caller.
    pub outputs: PropertyMap,
    /// Data kept in the blob and hidden from the caller.
    pub private: Value,
}

/// CRUD for one resource type.
///
/// Inputs reaching these methods have been validated and defaulted.
#[async_trait]
pub trait ResourceLifecycle: Send + Sync {
    /// Static description of the type.
    fn resource_type(&self) -> ResourceType;

    /// Checks beyond what the schema can express.
    fn validate(&self, inputs: &PropertyMap) -> Vec<Diagnostic> {
        let _ = inputs;
        Vec::new()
    }

    /// Outputs known before the resource exists. No side effects.
    fn preview(&self, ctx: &OperationContext<'_>, inputs: &PropertyMap) -> PropertyMap;

    /// Create the resource.
    async fn create(
        &self,
        ctx: &OperationContext<'_>,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError>;

    /// Rebuild outputs from the blob and live state.
    async fn read(
        &self,
        ctx: &OperationContext<'_>,
        state: &ResourceState,
    ) -> Result<PropertyMap, ProviderError>;

    /// Apply in-place changes.
    async fn update(
        &self,
        ctx: &OperationContext<'_>,
        state: &ResourceState,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError>;

    /// Delete the resource. Returning [`ProviderError::NotFound`] counts as success.
    async fn delete(&self, ctx: &OperationContext<'_>, state: &ResourceState) -> Result<(), ProviderError>;
}

/// Runs resource operations against the registered types.
#[derive(Debug, Clone)]
pub struct LifecycleEngine {
    registry: Arc<SchemaRegistry>,
    random: RandomResource,
    local_file: LocalFileResource,
}

impl LifecycleEngine {
    /// Create an engine over `registry`.
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            random: RandomResource,
            local_file: LocalFileResource,
        }
    }

    fn handler(&self, kind: ResourceKind) -> &dyn ResourceLifecycle {
        match kind {
            ResourceKind::Random => &self.random,
            ResourceKind::LocalFile => &self.local_file,
        }
    }

    fn resource_type(&self, kind: ResourceKind) -> Result<&ResourceType, ProviderError> {
        self.registry.lookup(kind.type_name())
    }

    /// Validate inputs and apply defaults without touching anything.
    pub fn check(&self, kind: ResourceKind, mut inputs: PropertyMap) -> Result<CheckResult, ProviderError> {
        let ty = self.resource_type(kind)?;
        normalize_integers(&ty.inputs, &mut inputs);
        apply_defaults(&ty.inputs, &mut inputs);
        let mut failures = validate(&ty.inputs, &Value::Object(inputs.clone()));
        if !failures.iter().any(Diagnostic::is_error) {
            failures.extend(self.handler(kind).validate(&inputs));
        }
        Ok(CheckResult { inputs, failures })
    }

    fn checked_inputs(&self, kind: ResourceKind, inputs: PropertyMap) -> Result<PropertyMap, ProviderError> {
        let result = self.check(kind, inputs)?;
        if result.is_valid() {
            Ok(result.inputs)
        } else {
            Err(into_validation_error(
                result.failures.into_iter().filter(Diagnostic::is_error).collect(),
            ))
        }
    }

    /// Diff two input maps. Pure.
    pub fn diff(&self, kind: ResourceKind, old: &PropertyMap, new: &PropertyMap) -> Result<DiffResult, ProviderError> {
        let ty = self.resource_type(kind)?;
        let result = diff(ty, old, new);
        debug!(
            resource_type = %kind,
            decision = ?result.decision,
            changes = result.changes.len(),
            "Diff computed"
        );
        Ok(result)
    }

    /// Create a resource, or with `preview` only report the outputs known ahead.
    pub async fn create(
        &self,
        ctx: &ProviderContext,
        op: &Operation,
        kind: ResourceKind,
        inputs: PropertyMap,
        preview: bool,
    ) -> Result<ResourceOutcome, ProviderError> {
        let ty = self.resource_type(kind)?;
        let inputs = self.checked_inputs(kind, inputs)?;
        let octx = OperationContext::new(ctx, op);
        let handler = self.handler(kind);

        if preview {
            debug!(resource_type = %kind, urn = %op.urn, "Create preview");
            return Ok(ResourceOutcome::new(handler.preview(&octx, &inputs), Vec::new()));
        }

        let produced = log_cancelled(op, "create", handler.create(&octx, &inputs).await)?;
        ensure_outputs(ty, &produced.outputs)?;

        let state = ResourceState::new(ty.name.clone(), inputs, produced.outputs.clone())
            .with_private(produced.private);
        let blob = state::encode(&state)?;
        info!(resource_type = %kind, urn = %op.urn, "Resource created");
        Ok(ResourceOutcome::new(produced.outputs, blob))
    }

    /// Read current outputs. [`ProviderError::NotFound`] means the resource is gone.
    pub async fn read(
        &self,
        ctx: &ProviderContext,
        op: &Operation,
        kind: ResourceKind,
        blob: &[u8],
    ) -> Result<PropertyMap, ProviderError> {
        let ty = self.resource_type(kind)?;
        let state = decode_for(kind, blob)?;
        let octx = OperationContext::new(ctx, op);

        let outputs = log_cancelled(op, "read", self.handler(kind).read(&octx, &state).await)?;
        ensure_outputs(ty, &outputs)?;
        Ok(outputs)
    }

    /// Update a resource in place.
    ///
    /// Inputs that would force replacement are refused; inputs that change
    /// nothing observable are recorded without calling out.
    pub async fn update(
        &self,
        ctx: &ProviderContext,
        op: &Operation,
        kind: ResourceKind,
        blob: &[u8],
        new_inputs: PropertyMap,
    ) -> Result<ResourceOutcome, ProviderError> {
        let ty = self.resource_type(kind)?;
        let mut state = decode_for(kind, blob)?;
        let new_inputs = self.checked_inputs(kind, new_inputs)?;

        let plan = diff(ty, &state.inputs, &new_inputs);
        match plan.decision {
            DiffDecision::Replace => {
                let property = plan
                    .first_replacement()
                    .map(|c| c.property.clone())
                    .unwrap_or_default();
                Err(ProviderError::validation_at(
                    property.clone(),
                    format!("changing '{}' requires replacing the resource", property),
                ))
            },
            DiffDecision::None => {
                debug!(resource_type = %kind, urn = %op.urn, "Update has no effect on the resource");
                state.inputs = new_inputs;
                let blob = state::encode(&state)?;
                Ok(ResourceOutcome::new(state.outputs, blob))
            },
            DiffDecision::Update => {
                let octx = OperationContext::new(ctx, op);
                let produced = log_cancelled(
                    op,
                    "update",
                    self.handler(kind).update(&octx, &state, &new_inputs).await,
                )?;
                ensure_outputs(ty, &produced.outputs)?;

                state.inputs = new_inputs;
                state.outputs = produced.outputs.clone();
                state.private = produced.private;
                let blob = state::encode(&state)?;
                info!(
                    resource_type = %kind,
                    urn = %op.urn,
                    changed = ?plan.changed_properties(),
                    "Resource updated"
                );
                Ok(ResourceOutcome::new(produced.outputs, blob))
            },
        }
    }

    /// Delete a resource. An already absent resource is a success.
    pub async fn delete(
        &self,
        ctx: &ProviderContext,
        op: &Operation,
        kind: ResourceKind,
        blob: &[u8],
    ) -> Result<(), ProviderError> {
        let state = decode_for(kind, blob)?;
        let octx = OperationContext::new(ctx, op);

        match log_cancelled(op, "delete", self.handler(kind).delete(&octx, &state).await) {
            Ok(()) => {
                info!(resource_type = %kind, urn = %op.urn, "Resource deleted");
                Ok(())
            },
            Err(ProviderError::NotFound(_)) => {
                info!(resource_type = %kind, urn = %op.urn, "Resource already gone");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }
}

fn decode_for(kind: ResourceKind, blob: &[u8]) -> Result<ResourceState, ProviderError> {
    let state = state::decode(blob)?;
    if state.resource_type != kind.type_name() {
        return Err(ProviderError::CorruptState(format!(
            "state blob holds a '{}', not a '{}'",
            state.resource_type, kind
        )));
    }
    Ok(state)
}

fn ensure_outputs(ty: &ResourceType, outputs: &PropertyMap) -> Result<(), ProviderError> {
    for (name, attr) in &ty.outputs.attributes {
        if attr.flags.optional {
            continue;
        }
        if outputs.get(name).map_or(true, Value::is_null) {
            return Err(ProviderError::Internal(format!(
                "{} produced no value for output '{}'",
                ty.name, name
            )));
        }
    }
    Ok(())
}

fn log_cancelled<T>(op: &Operation, step: &str, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
    if let Err(ProviderError::Cancelled(_)) = &result {
        warn!(urn = %op.urn, step, "Operation cancelled, outcome unknown");
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use serde_json::json;

    pub(crate) fn context(dir: &std::path::Path, seed: Option<u64>) -> ProviderContext {
        ProviderContext::new(Arc::new(ProviderConfig {
            region: "us-east-1".into(),
            root_dir: dir.to_path_buf(),
            seed,
        }))
    }

    pub(crate) fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> LifecycleEngine {
        LifecycleEngine::new(Arc::new(SchemaRegistry::builtin().unwrap()))
    }

    #[test]
    fn test_resource_kind_parse() {
        assert_eq!("Random".parse::<ResourceKind>().unwrap(), ResourceKind::Random);
        assert_eq!(
            "LocalFile".parse::<ResourceKind>().unwrap(),
            ResourceKind::LocalFile
        );
        assert!(matches!(
            "random".parse::<ResourceKind>(),
            Err(ProviderError::UnknownType(_))
        ));
    }

    #[test]
    fn test_check_applies_defaults() {
        let result = engine()
            .check(ResourceKind::Random, props(json!({"length": 8})))
            .unwrap();
        assert!(result.is_valid());
        assert_eq!(result.inputs["charset"], "alphanumeric");
    }

    #[tokio::test]
    async fn test_whole_float_length_checks_and_creates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some(3));
        let engine = engine();

        let checked = engine
            .check(ResourceKind::Random, props(json!({"length": 24.0})))
            .unwrap();
        assert!(checked.is_valid());
        assert_eq!(checked.inputs["length"], json!(24));

        let created = engine
            .create(
                &ctx,
                &Operation::detached("urn:random:float"),
                ResourceKind::Random,
                props(json!({"length": 24.0})),
                false,
            )
            .await
            .unwrap();
        assert_eq!(created.outputs["result"].as_str().unwrap().len(), 24);
        assert_eq!(created.outputs["length"], json!(24));
    }

    #[test]
    fn test_fractional_length_fails_check() {
        let result = engine()
            .check(ResourceKind::Random, props(json!({"length": 24.5})))
            .unwrap();
        assert!(!result.is_valid());
        assert_eq!(result.failures[0].attribute.as_deref(), Some("length"));
    }

    #[test]
    fn test_check_reports_type_specific_failures() {
        let result = engine()
            .check(ResourceKind::Random, props(json!({"length": 0})))
            .unwrap();
        assert!(!result.is_valid());
        assert_eq!(result.failures[0].attribute.as_deref(), Some("length"));
    }

    #[tokio::test]
    async fn test_random_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let engine = engine();
        let op = Operation::detached("urn:random:a");

        let created = engine
            .create(&ctx, &op, ResourceKind::Random, props(json!({"length": 24})), false)
            .await
            .unwrap();
        let result = created.outputs["result"].as_str().unwrap().to_string();
        assert_eq!(result.len(), 24);
        assert!(!created.state.is_empty());

        let read = engine
            .read(&ctx, &op, ResourceKind::Random, &created.state)
            .await
            .unwrap();
        assert_eq!(read, created.outputs);
        assert_eq!(read["result"], result.as_str());

        let decision = engine
            .diff(
                ResourceKind::Random,
                &props(json!({"length": 24})),
                &props(json!({"length": 32})),
            )
            .unwrap();
        assert_eq!(decision.decision, DiffDecision::Replace);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let err = engine()
            .create(
                &ctx,
                &Operation::detached("urn:x"),
                ResourceKind::Random,
                props(json!({"length": "long"})),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.property_path(), Some("length"));
    }

    #[tokio::test]
    async fn test_preview_has_no_blob() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let outcome = engine()
            .create(
                &ctx,
                &Operation::detached("urn:x"),
                ResourceKind::LocalFile,
                props(json!({"path": "a.txt", "content": "hi"})),
                true,
            )
            .await
            .unwrap();
        assert!(outcome.state.is_empty());
        assert_eq!(outcome.outputs["size"], 2);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_update_refuses_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let engine = engine();
        let op = Operation::detached("urn:random:b");
        let created = engine
            .create(&ctx, &op, ResourceKind::Random, props(json!({"length": 4})), false)
            .await
            .unwrap();

        let err = engine
            .update(
                &ctx,
                &op,
                ResourceKind::Random,
                &created.state,
                props(json!({"length": 5})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.property_path(), Some("length"));
    }

    #[tokio::test]
    async fn test_update_without_effect_keeps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let engine = engine();
        let op = Operation::detached("urn:random:c");
        let created = engine
            .create(&ctx, &op, ResourceKind::Random, props(json!({"length": 4})), false)
            .await
            .unwrap();

        let updated = engine
            .update(
                &ctx,
                &op,
                ResourceKind::Random,
                &created.state,
                props(json!({"length": 4, "note": "just a note"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.outputs, created.outputs);

        let state = state::decode(&updated.state).unwrap();
        assert_eq!(state.inputs["note"], "just a note");
    }

    #[tokio::test]
    async fn test_blob_of_other_type_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let engine = engine();
        let op = Operation::detached("urn:random:d");
        let created = engine
            .create(&ctx, &op, ResourceKind::Random, props(json!({"length": 4})), false)
            .await
            .unwrap();

        let err = engine
            .read(&ctx, &op, ResourceKind::LocalFile, &created.state)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CorruptState(_)));
    }

    #[tokio::test]
    async fn test_guard_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:slow");
        let octx = OperationContext::new(&ctx, &op);

        op.cancel.cancel();
        let result = octx
            .guard("sleep", tokio::time::sleep(std::time::Duration::from_secs(60)))
            .await;
        assert!(matches!(result, Err(ProviderError::Cancelled(_))));
    }

    #[test]
    fn test_ensure_outputs() {
        let ty = ResourceKind::Random.resource_type();
        let err = ensure_outputs(&ty, &props(json!({"length": 1}))).unwrap_err();
        assert!(matches!(err, ProviderError::Internal(_)));
    }
}
