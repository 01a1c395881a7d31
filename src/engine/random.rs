//! The `Random` resource: a generated string that never changes once created.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use super::{OperationContext, Produced, ResourceLifecycle};
use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeType, Diagnostic, ResourceType};
use crate::state::ResourceState;
use crate::types::PropertyMap;

const MIN_LENGTH: i64 = 1;
const MAX_LENGTH: i64 = 1024;

/// Characters a generated value may be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// `A-Za-z0-9`
    Alphanumeric,
    /// `A-Za-z`
    Alphabetic,
    /// `0-9`
    Numeric,
    /// `0-9a-f`
    Hex,
}

impl Charset {
    const NAMES: [&'static str; 4] = ["alphanumeric", "alphabetic", "numeric", "hex"];

    /// Parse a charset name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "alphanumeric" => Some(Self::Alphanumeric),
            "alphabetic" => Some(Self::Alphabetic),
            "numeric" => Some(Self::Numeric),
            "hex" => Some(Self::Hex),
            _ => None,
        }
    }

    /// The characters in this set.
    pub fn chars(self) -> &'static [u8] {
        match self {
            Self::Alphanumeric => b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789",
            Self::Alphabetic => b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz",
            Self::Numeric => b"0123456789",
            Self::Hex => b"0123456789abcdef",
        }
    }

    fn contains(self, c: char) -> bool {
        c.is_ascii() && self.chars().contains(&(c as u8))
    }
}

/// Handler for `Random`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomResource;

struct Spec {
    length: usize,
    charset: Charset,
}

impl Spec {
    fn from_inputs(inputs: &PropertyMap) -> Result<Self, ProviderError> {
        let length = inputs
            .get("length")
            .and_then(Value::as_i64)
            .filter(|l| (MIN_LENGTH..=MAX_LENGTH).contains(l))
            .ok_or_else(|| ProviderError::validation_at("length", "length is out of range"))?;
        let charset = inputs
            .get("charset")
            .and_then(Value::as_str)
            .and_then(Charset::parse)
            .ok_or_else(|| ProviderError::validation_at("charset", "unknown charset"))?;
        Ok(Self {
            length: length as usize,
            charset,
        })
    }
}

fn generate(spec: &Spec, seed: Option<u64>, urn: &str) -> String {
    let mut rng = match seed {
        Some(seed) => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&seed.to_le_bytes());
            hasher.update(urn.as_bytes());
            StdRng::from_seed(*hasher.finalize().as_bytes())
        },
        None => StdRng::from_entropy(),
    };
    let chars = spec.charset.chars();
    (0..spec.length)
        .map(|_| chars[rng.gen_range(0..chars.len())] as char)
        .collect()
}

fn outputs(inputs: &PropertyMap, result: Option<&str>) -> PropertyMap {
    let mut outputs = PropertyMap::new();
    if let Some(result) = result {
        outputs.insert("result".into(), json!(result));
    }
    for key in ["length", "charset", "labels"] {
        if let Some(value) = inputs.get(key).filter(|v| !v.is_null()) {
            outputs.insert(key.into(), value.clone());
        }
    }
    outputs
}

fn stored_result(state: &ResourceState) -> Result<&str, ProviderError> {
    state
        .private_str("result")
        .ok_or_else(|| ProviderError::CorruptState("Random state has no generated value".into()))
}

#[async_trait]
impl ResourceLifecycle for RandomResource {
    fn resource_type(&self) -> ResourceType {
        ResourceType::new("Random")
            .with_description("A random string generated once and kept for the life of the resource")
            .with_input(
                "length",
                Attribute::required(AttributeType::Int64)
                    .with_description("Number of characters, 1 to 1024")
                    .immutable(),
            )
            .with_input(
                "charset",
                Attribute::optional(AttributeType::String)
                    .with_description("One of alphanumeric, alphabetic, numeric, hex")
                    .with_default(json!("alphanumeric"))
                    .immutable(),
            )
            .with_input(
                "labels",
                Attribute::optional(AttributeType::map(AttributeType::String))
                    .with_description("Free-form labels"),
            )
            .with_input(
                "note",
                Attribute::optional(AttributeType::String)
                    .with_description("Comment for humans, never sent anywhere")
                    .ignored(),
            )
            .with_output(
                "result",
                Attribute::computed(AttributeType::String).sensitive(),
            )
            .with_output("length", Attribute::computed(AttributeType::Int64))
            .with_output("charset", Attribute::computed(AttributeType::String))
            .with_output(
                "labels",
                Attribute::optional(AttributeType::map(AttributeType::String)),
            )
    }

    fn validate(&self, inputs: &PropertyMap) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if let Some(length) = inputs.get("length").and_then(Value::as_i64) {
            if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
                diagnostics.push(
                    Diagnostic::error("Invalid value for attribute 'length'")
                        .with_detail(format!(
                            "must be between {} and {}, got {}",
                            MIN_LENGTH, MAX_LENGTH, length
                        ))
                        .with_attribute("length"),
                );
            }
        }
        if let Some(charset) = inputs.get("charset").and_then(Value::as_str) {
            if Charset::parse(charset).is_none() {
                diagnostics.push(
                    Diagnostic::error("Invalid value for attribute 'charset'")
                        .with_detail(format!(
                            "must be one of {}, got '{}'",
                            Charset::NAMES.join(", "),
                            charset
                        ))
                        .with_attribute("charset"),
                );
            }
        }
        diagnostics
    }

    fn preview(&self, _ctx: &OperationContext<'_>, inputs: &PropertyMap) -> PropertyMap {
        outputs(inputs, None)
    }

    async fn create(
        &self,
        ctx: &OperationContext<'_>,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError> {
        let spec = Spec::from_inputs(inputs)?;
        let result = generate(&spec, ctx.provider.seed(), ctx.urn);
        Ok(Produced {
            outputs: outputs(inputs, Some(&result)),
            private: json!({ "result": result }),
        })
    }

    async fn read(
        &self,
        _ctx: &OperationContext<'_>,
        state: &ResourceState,
    ) -> Result<PropertyMap, ProviderError> {
        let spec = Spec::from_inputs(&state.inputs)
            .map_err(|e| ProviderError::CorruptState(format!("Random state inputs: {}", e)))?;
        let result = stored_result(state)?;

        if result.chars().count() != spec.length {
            return Err(ProviderError::CorruptState(format!(
                "stored value has {} characters, expected {}",
                result.chars().count(),
                spec.length
            )));
        }
        if !result.chars().all(|c| spec.charset.contains(c)) {
            return Err(ProviderError::CorruptState(
                "stored value has characters outside its charset".into(),
            ));
        }

        Ok(outputs(&state.inputs, Some(result)))
    }

    async fn update(
        &self,
        _ctx: &OperationContext<'_>,
        state: &ResourceState,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError> {
        let result = stored_result(state)?;
        Ok(Produced {
            outputs: outputs(inputs, Some(result)),
            private: state.private.clone(),
        })
    }

    async fn delete(&self, _ctx: &OperationContext<'_>, _state: &ResourceState) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{context, props};
    use crate::types::Operation;
    use tokio_test::assert_ok;

    fn inputs(length: i64, charset: &str) -> PropertyMap {
        props(json!({"length": length, "charset": charset}))
    }

    #[test]
    fn test_generate_respects_charset() {
        for name in Charset::NAMES {
            let charset = Charset::parse(name).unwrap();
            let value = generate(&Spec { length: 64, charset }, None, "urn:x");
            assert_eq!(value.len(), 64);
            assert!(value.chars().all(|c| charset.contains(c)), "{name}: {value}");
        }
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let spec = Spec {
            length: 24,
            charset: Charset::Alphanumeric,
        };
        let a = generate(&spec, Some(42), "urn:a");
        assert_eq!(a, generate(&spec, Some(42), "urn:a"));
        assert_ne!(a, generate(&spec, Some(42), "urn:b"));
        assert_ne!(a, generate(&spec, Some(43), "urn:a"));
    }

    #[test]
    fn test_validate_ranges() {
        let random = RandomResource;
        assert!(random.validate(&inputs(24, "hex")).is_empty());
        assert_eq!(random.validate(&inputs(0, "hex")).len(), 1);
        assert_eq!(random.validate(&inputs(1025, "hex")).len(), 1);

        let diagnostics = random.validate(&inputs(24, "emoji"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("charset"));
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some(7));
        let op = Operation::detached("urn:random");
        let octx = OperationContext::new(&ctx, &op);
        let inputs = props(json!({"length": 24, "charset": "numeric", "labels": {"env": "dev"}}));

        let produced = RandomResource.create(&octx, &inputs).await.unwrap();
        let result = produced.outputs["result"].as_str().unwrap();
        assert_eq!(result.len(), 24);
        assert!(result.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(produced.outputs["labels"]["env"], "dev");

        let state = ResourceState::new("Random", inputs, produced.outputs.clone())
            .with_private(produced.private);
        let read = assert_ok!(RandomResource.read(&octx, &state).await);
        assert_eq!(read, produced.outputs);
    }

    #[tokio::test]
    async fn test_read_detects_tampered_value() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:random");
        let octx = OperationContext::new(&ctx, &op);

        let state = ResourceState::new("Random", inputs(4, "hex"), PropertyMap::new())
            .with_private(json!({"result": "zzzz"}));
        let err = RandomResource.read(&octx, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::CorruptState(_)));

        let state = ResourceState::new("Random", inputs(4, "hex"), PropertyMap::new())
            .with_private(json!({"result": "abc"}));
        let err = RandomResource.read(&octx, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::CorruptState(_)));
    }

    #[tokio::test]
    async fn test_update_keeps_value() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:random");
        let octx = OperationContext::new(&ctx, &op);

        let state = ResourceState::new("Random", inputs(4, "hex"), PropertyMap::new())
            .with_private(json!({"result": "beef"}));
        let mut new_inputs = inputs(4, "hex");
        new_inputs.insert("labels".into(), json!({"team": "core"}));

        let produced = RandomResource.update(&octx, &state, &new_inputs).await.unwrap();
        assert_eq!(produced.outputs["result"], "beef");
        assert_eq!(produced.outputs["labels"]["team"], "core");
        assert_eq!(produced.private, state.private);
    }
}
