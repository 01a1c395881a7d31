//! Input diffing.
//!
//! Compares two input maps of one resource type and classifies every changed
//! property through the type's [`ChangePolicy`] table. The diff is pure: it
//! never touches the live resource.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::generated as proto;
use crate::schema::{ChangePolicy, ResourceType};
use crate::types::PropertyMap;
use crate::validation::{apply_defaults, normalize_integers};

/// How one property change affects the live resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    /// The change does not reach the resource.
    NoOp,
    /// The resource can absorb the change.
    UpdateInPlace,
    /// The resource must be recreated.
    RequiresReplacement,
}

/// What the engine should do about the diff as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DiffDecision {
    /// Nothing to do.
    #[default]
    None,
    /// Call update.
    Update,
    /// Delete and create.
    Replace,
}

/// A change to a single property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Name of the property.
    pub property: String,
    /// Classification under the type's policy table.
    pub kind: DiffKind,
    /// The old value, `None` if it was unset.
    pub before: Option<Value>,
    /// The new value, `None` if it is being unset.
    pub after: Option<Value>,
}

impl PropertyChange {
    /// Create a new property change.
    pub fn new(
        property: impl Into<String>,
        kind: DiffKind,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Self {
        Self {
            property: property.into(),
            kind,
            before,
            after,
        }
    }
}

/// The outcome of diffing two input maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiffResult {
    /// Every property whose value differs, ordered by name.
    pub changes: Vec<PropertyChange>,
    /// Overall decision.
    pub decision: DiffDecision,
    /// A replacement must delete the old resource first.
    pub delete_before_replace: bool,
}

impl DiffResult {
    /// Names of every changed property.
    pub fn changed_properties(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.property.as_str()).collect()
    }

    /// Whether any property differs, including ignored ones.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Whether the resource must be recreated.
    pub fn requires_replacement(&self) -> bool {
        self.decision == DiffDecision::Replace
    }

    /// The first change forcing replacement.
    pub fn first_replacement(&self) -> Option<&PropertyChange> {
        self.changes
            .iter()
            .find(|c| c.kind == DiffKind::RequiresReplacement)
    }
}

/// Diff `old` against `new` inputs of resource type `ty`.
///
/// Both sides are normalized and defaulted first, so an unset property and
/// one set to its default compare equal, as do `24` and `24.0`. Properties the schema does not declare
/// are treated as requiring replacement.
pub fn diff(ty: &ResourceType, old: &PropertyMap, new: &PropertyMap) -> DiffResult {
    let mut old = old.clone();
    let mut new = new.clone();
    for side in [&mut old, &mut new] {
        normalize_integers(&ty.inputs, side);
        apply_defaults(&ty.inputs, side);
    }

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    let changes: Vec<PropertyChange> = keys
        .into_iter()
        .filter_map(|key| {
            let before = old.get(key).filter(|v| !v.is_null());
            let after = new.get(key).filter(|v| !v.is_null());
            if before == after {
                return None;
            }
            let kind = match ty.inputs.attribute(key).map(|a| a.policy) {
                Some(ChangePolicy::Immutable) | None => DiffKind::RequiresReplacement,
                Some(ChangePolicy::Mutable) => DiffKind::UpdateInPlace,
                Some(ChangePolicy::Ignored) => DiffKind::NoOp,
            };
            Some(PropertyChange::new(key.as_str(), kind, before.cloned(), after.cloned()))
        })
        .collect();

    let decision = if changes.iter().any(|c| c.kind == DiffKind::RequiresReplacement) {
        DiffDecision::Replace
    } else if changes.iter().any(|c| c.kind == DiffKind::UpdateInPlace) {
        DiffDecision::Update
    } else {
        DiffDecision::None
    };

    DiffResult {
        changes,
        decision,
        delete_before_replace: ty.delete_before_replace && decision == DiffDecision::Replace,
    }
}

impl From<DiffKind> for proto::DiffKind {
    fn from(kind: DiffKind) -> Self {
        match kind {
            DiffKind::NoOp => proto::DiffKind::NoOp,
            DiffKind::UpdateInPlace => proto::DiffKind::UpdateInPlace,
            DiffKind::RequiresReplacement => proto::DiffKind::RequiresReplacement,
        }
    }
}

impl From<DiffDecision> for proto::DiffDecision {
    fn from(decision: DiffDecision) -> Self {
        match decision {
            DiffDecision::None => proto::DiffDecision::None,
            DiffDecision::Update => proto::DiffDecision::Update,
            DiffDecision::Replace => proto::DiffDecision::Replace,
        }
    }
}

impl From<&PropertyChange> for proto::PropertyDiff {
    fn from(change: &PropertyChange) -> Self {
        Self {
            property: change.property.clone(),
            kind: proto::DiffKind::from(change.kind) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeType};
    use serde_json::json;

    fn ty() -> ResourceType {
        ResourceType::new("Example")
            .with_input("size", Attribute::required(AttributeType::Int64).immutable())
            .with_input(
                "mode",
                Attribute::optional(AttributeType::String)
                    .with_default(json!("fast"))
                    .immutable(),
            )
            .with_input("labels", Attribute::optional(AttributeType::map(AttributeType::String)))
            .with_input("note", Attribute::optional(AttributeType::String).ignored())
    }

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identical_inputs() {
        let inputs = props(json!({"size": 1, "labels": {"a": "b"}}));
        let result = diff(&ty(), &inputs, &inputs);
        assert_eq!(result.decision, DiffDecision::None);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_default_equals_unset() {
        let result = diff(
            &ty(),
            &props(json!({"size": 1})),
            &props(json!({"size": 1, "mode": "fast"})),
        );
        assert_eq!(result.decision, DiffDecision::None);

        let result = diff(
            &ty(),
            &props(json!({"size": 1, "note": null})),
            &props(json!({"size": 1})),
        );
        assert!(!result.has_changes());
    }

    #[test]
    fn test_whole_float_equals_integer() {
        let result = diff(&ty(), &props(json!({"size": 24})), &props(json!({"size": 24.0})));
        assert_eq!(result.decision, DiffDecision::None);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_immutable_change_replaces() {
        let result = diff(
            &ty(),
            &props(json!({"size": 1, "labels": {"a": "b"}})),
            &props(json!({"size": 2, "labels": {"a": "c"}})),
        );
        assert_eq!(result.decision, DiffDecision::Replace);
        assert_eq!(result.changed_properties(), vec!["labels", "size"]);
        assert_eq!(result.first_replacement().unwrap().property, "size");
        assert!(!result.delete_before_replace);
    }

    #[test]
    fn test_mutable_change_updates() {
        let result = diff(
            &ty(),
            &props(json!({"size": 1})),
            &props(json!({"size": 1, "labels": {"a": "b"}})),
        );
        assert_eq!(result.decision, DiffDecision::Update);
        let change = &result.changes[0];
        assert_eq!(change.kind, DiffKind::UpdateInPlace);
        assert_eq!(change.before, None);
        assert_eq!(change.after, Some(json!({"a": "b"})));
    }

    #[test]
    fn test_ignored_change_is_noop() {
        let result = diff(
            &ty(),
            &props(json!({"size": 1, "note": "x"})),
            &props(json!({"size": 1, "note": "y"})),
        );
        assert_eq!(result.decision, DiffDecision::None);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].kind, DiffKind::NoOp);
    }

    #[test]
    fn test_unknown_property_replaces() {
        let result = diff(
            &ty(),
            &props(json!({"size": 1})),
            &props(json!({"size": 1, "mystery": true})),
        );
        assert_eq!(result.decision, DiffDecision::Replace);
    }

    #[test]
    fn test_delete_before_replace_only_on_replace() {
        let ty = ty().with_delete_before_replace();
        let replace = diff(&ty, &props(json!({"size": 1})), &props(json!({"size": 2})));
        assert!(replace.delete_before_replace);

        let update = diff(
            &ty,
            &props(json!({"size": 1})),
            &props(json!({"size": 1, "labels": {}})),
        );
        assert!(!update.delete_before_replace);
    }

    #[test]
    fn test_proto_conversion() {
        let change = PropertyChange::new("size", DiffKind::RequiresReplacement, None, None);
        let wire = proto::PropertyDiff::from(&change);
        assert_eq!(wire.kind(), proto::DiffKind::RequiresReplacement);
        assert_eq!(
            proto::DiffDecision::from(DiffDecision::Update),
            proto::DiffDecision::Update
        );
    }
}
