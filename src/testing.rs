//! Testing utilities for provider implementations.
//!
//! This module provides utilities to test `ProviderService` implementations
//! without spinning up a full gRPC server.
//!
//! # Example
//!
//! ```ignore
//! use lifecycle_provider::testing::{assert_diff_replaces, ProviderTester};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_random() {
//!     let tester = ProviderTester::new(LifecycleProvider::new()?);
//!     tester.configure(json!({"region": "us-east-1", "rootDir": "/tmp"})).await?;
//!
//!     let created = tester.create("Random", json!({"length": 24})).await?;
//!     assert_eq!(created.outputs["result"].as_str().unwrap().len(), 24);
//!
//!     let plan = tester.diff("Random", json!({"length": 24}), json!({"length": 32})).await?;
//!     assert_diff_replaces(&plan);
//! }
//! ```

use serde_json::Value;

use crate::diff::{DiffDecision, DiffResult};
use crate::error::{ErrorKind, ProviderError};
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{CheckResult, Operation, PropertyMap, ResourceOutcome};

/// A test harness for provider implementations.
///
/// Every resource call runs as an uncancelled operation on the urn
/// `urn:tester:<type>`.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn operation(resource_type: &str) -> Operation {
        Operation::detached(format!("urn:tester:{}", resource_type))
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Get the provider's schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Configure the provider.
    ///
    /// Returns the warnings, or `Err` if the configuration was refused.
    pub async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate inputs and apply defaults.
    pub async fn check(&self, resource_type: &str, inputs: Value) -> Result<CheckResult, ProviderError> {
        self.provider.check(resource_type, properties(inputs)?).await
    }

    /// Diff two input objects.
    pub async fn diff(&self, resource_type: &str, old: Value, new: Value) -> Result<DiffResult, ProviderError> {
        self.provider
            .diff(resource_type, properties(old)?, properties(new)?)
            .await
    }

    /// Create a resource.
    pub async fn create(&self, resource_type: &str, inputs: Value) -> Result<ResourceOutcome, ProviderError> {
        self.provider
            .create(&Self::operation(resource_type), resource_type, properties(inputs)?, false)
            .await
    }

    /// Preview a create. No side effects.
    pub async fn preview(&self, resource_type: &str, inputs: Value) -> Result<PropertyMap, ProviderError> {
        let outcome = self
            .provider
            .create(&Self::operation(resource_type), resource_type, properties(inputs)?, true)
            .await?;
        Ok(outcome.outputs)
    }

    /// Read a resource from its state blob.
    pub async fn read(&self, resource_type: &str, state: &[u8]) -> Result<PropertyMap, ProviderError> {
        self.provider
            .read(&Self::operation(resource_type), resource_type, state)
            .await
    }

    /// Update a resource.
    pub async fn update(
        &self,
        resource_type: &str,
        state: &[u8],
        new_inputs: Value,
    ) -> Result<ResourceOutcome, ProviderError> {
        self.provider
            .update(
                &Self::operation(resource_type),
                resource_type,
                state,
                properties(new_inputs)?,
            )
            .await
    }

    /// Delete a resource.
    pub async fn delete(&self, resource_type: &str, state: &[u8]) -> Result<(), ProviderError> {
        self.provider
            .delete(&Self::operation(resource_type), resource_type, state)
            .await
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Create, then read, and require the read to return the created outputs.
    pub async fn lifecycle_create(&self, resource_type: &str, inputs: Value) -> Result<ResourceOutcome, TestError> {
        let created = self.create(resource_type, inputs).await?;
        let read = self.read(resource_type, &created.state).await?;
        if read != created.outputs {
            return Err(TestError::Mismatch(format!(
                "{}: read returned {:?}, create returned {:?}",
                resource_type, read, created.outputs
            )));
        }
        Ok(created)
    }

    /// Run a full CRUD lifecycle: create → read → update → read → delete → delete.
    ///
    /// Returns the outputs after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_inputs: Value,
        updated_inputs: Value,
    ) -> Result<PropertyMap, TestError> {
        let created = self.lifecycle_create(resource_type, initial_inputs).await?;

        let updated = self
            .update(resource_type, &created.state, updated_inputs)
            .await?;
        let read = self.read(resource_type, &updated.state).await?;
        if read != updated.outputs {
            return Err(TestError::Mismatch(format!(
                "{}: read after update returned {:?}, update returned {:?}",
                resource_type, read, updated.outputs
            )));
        }

        self.delete(resource_type, &updated.state).await?;
        // Deleting what is already gone must succeed.
        self.delete(resource_type, &updated.state).await?;

        Ok(updated.outputs)
    }
}

fn properties(value: Value) -> Result<PropertyMap, ProviderError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ProviderError::validation(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation failed with diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    Provider(ProviderError),
    /// Two calls that must agree did not.
    Mismatch(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.message())?;
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
            TestError::Mismatch(msg) => write!(f, "Mismatch: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

/// Pass warnings through, fail on any error.
fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<Vec<Diagnostic>, TestError> {
    if diagnostics.iter().any(Diagnostic::is_error) {
        Err(TestError::Diagnostics(
            diagnostics.into_iter().filter(Diagnostic::is_error).collect(),
        ))
    } else {
        Ok(diagnostics)
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a diff decides nothing needs doing.
///
/// # Panics
///
/// Panics if the decision is not `None`.
pub fn assert_diff_none(diff: &DiffResult) {
    assert_eq!(
        diff.decision,
        DiffDecision::None,
        "Expected no changes, but got {:?} for {:?}",
        diff.decision,
        diff.changed_properties()
    );
}

/// Assert that a diff requires resource replacement.
///
/// # Panics
///
/// Panics if the diff does not require replacement.
pub fn assert_diff_replaces(diff: &DiffResult) {
    assert!(
        diff.requires_replacement(),
        "Expected diff to require replacement, but got {:?} for {:?}",
        diff.decision,
        diff.changed_properties()
    );
}

/// Assert that a diff updates in place.
///
/// # Panics
///
/// Panics if the decision is not `Update`.
pub fn assert_diff_updates_in_place(diff: &DiffResult) {
    assert_eq!(
        diff.decision,
        DiffDecision::Update,
        "Expected diff to update in place, but got {:?} for {:?}",
        diff.decision,
        diff.changed_properties()
    );
}

/// Assert that a diff has a change for a specific property.
///
/// # Panics
///
/// Panics if the property did not change.
pub fn assert_diff_changes_property(diff: &DiffResult, property: &str) {
    assert!(
        diff.changes.iter().any(|c| c.property == property),
        "Expected diff to change property '{}', but it was not changed. Changed properties: {:?}",
        property,
        diff.changed_properties()
    );
}

/// Assert that an error is a validation error pointing at `path`.
///
/// # Panics
///
/// Panics on any other error or path.
pub fn assert_validation_error_at(err: &ProviderError, path: &str) {
    assert_eq!(
        err.kind(),
        ErrorKind::Validation,
        "Expected a validation error, got: {}",
        err
    );
    assert_eq!(
        err.property_path(),
        Some(path),
        "Expected validation error at '{}', got: {}",
        path,
        err
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffKind, PropertyChange};
    use serde_json::json;

    fn replace_diff() -> DiffResult {
        DiffResult {
            changes: vec![PropertyChange::new(
                "length",
                DiffKind::RequiresReplacement,
                Some(json!(24)),
                Some(json!(32)),
            )],
            decision: DiffDecision::Replace,
            delete_before_replace: false,
        }
    }

    #[test]
    fn test_diff_assertions() {
        let diff = replace_diff();
        assert_diff_replaces(&diff);
        assert_diff_changes_property(&diff, "length");
        assert_diff_none(&DiffResult::default());
    }

    #[test]
    #[should_panic(expected = "Expected diff to update in place")]
    fn test_assert_updates_in_place_fails_on_replace() {
        assert_diff_updates_in_place(&replace_diff());
    }

    #[test]
    #[should_panic(expected = "Expected diff to change property 'charset'")]
    fn test_assert_changes_property_fails() {
        assert_diff_changes_property(&replace_diff(), "charset");
    }

    #[test]
    fn test_assert_validation_error_at() {
        assert_validation_error_at(&ProviderError::validation_at("tags.1", "bad"), "tags.1");
    }

    #[test]
    #[should_panic(expected = "Expected a validation error")]
    fn test_assert_validation_error_at_wrong_kind() {
        assert_validation_error_at(&ProviderError::NotFound("x".into()), "x");
    }

    #[test]
    fn test_assert_no_errors() {
        assert_no_errors(&[Diagnostic::warning("Just a warning")]);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        assert_no_errors(&[Diagnostic::error("An error")]);
    }

    #[test]
    fn test_check_diagnostics_passes_warnings() {
        let warnings = check_diagnostics(vec![Diagnostic::warning("w")]).unwrap();
        assert_eq!(warnings.len(), 1);

        let err = check_diagnostics(vec![Diagnostic::warning("w"), Diagnostic::error("e")]).unwrap_err();
        assert!(matches!(err, TestError::Diagnostics(d) if d.len() == 1));
    }

    #[test]
    fn test_properties_requires_object() {
        assert!(properties(json!({"a": 1})).is_ok());
        assert!(properties(json!([1])).is_err());
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute("field1"),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }
}
