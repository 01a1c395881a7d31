//! The state blob codec.
//!
//! Everything the provider needs to remember about a live resource is
//! encoded into an opaque blob the engine stores for us. The blob is JSON
//! carrying a `version`; blobs from another major version are refused,
//! newer minor versions are accepted.
//!
//! Top-level fields this version does not know are carried through
//! untouched, unless a writer listed them in `critical`, meaning a reader
//! that does not understand them must not use the blob.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::types::PropertyMap;

/// Major version of the blob layout. Readers refuse other majors.
pub const STATE_MAJOR_VERSION: u32 = 1;

/// Minor version of the blob layout. Additive changes only.
pub const STATE_MINOR_VERSION: u32 = 0;

const KNOWN_FIELDS: &[&str] = &["version", "type", "inputs", "outputs", "private", "critical"];

/// Version stamp carried by every blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    /// Incompatible layout changes.
    pub major: u32,
    /// Backwards-compatible additions.
    pub minor: u32,
}

impl StateVersion {
    /// The version this build writes.
    pub const CURRENT: StateVersion = StateVersion {
        major: STATE_MAJOR_VERSION,
        minor: STATE_MINOR_VERSION,
    };
}

impl Default for StateVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// The decoded content of a state blob: one live resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Layout version.
    pub version: StateVersion,
    /// Resource type name.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Inputs the resource was last created or updated with, defaults applied.
    pub inputs: PropertyMap,
    /// Outputs last reported to the caller.
    pub outputs: PropertyMap,
    /// Provider-private data, never shown to the caller.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub private: Value,
    /// Unknown fields a reader must understand to use this blob.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critical: Vec<String>,
    /// Top-level fields from newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extensions: PropertyMap,
}

impl ResourceState {
    /// A state at the current version.
    pub fn new(resource_type: impl Into<String>, inputs: PropertyMap, outputs: PropertyMap) -> Self {
        Self {
            version: StateVersion::CURRENT,
            resource_type: resource_type.into(),
            inputs,
            outputs,
            private: Value::Null,
            critical: Vec::new(),
            extensions: PropertyMap::new(),
        }
    }

    /// Attach provider-private data.
    pub fn with_private(mut self, private: Value) -> Self {
        self.private = private;
        self
    }

    /// Look up a string in the private data.
    pub fn private_str(&self, key: &str) -> Option<&str> {
        self.private.get(key).and_then(Value::as_str)
    }
}

/// Encode a state into a blob.
pub fn encode(state: &ResourceState) -> Result<Vec<u8>, ProviderError> {
    Ok(serde_json::to_vec(state)?)
}

/// Decode a blob.
///
/// Empty or malformed bytes, another major version, and unknown critical
/// fields are all [`ProviderError::CorruptState`].
pub fn decode(bytes: &[u8]) -> Result<ResourceState, ProviderError> {
    if bytes.is_empty() {
        return Err(ProviderError::CorruptState("state blob is empty".into()));
    }

    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProviderError::CorruptState(format!("state blob is not valid JSON: {}", e)))?;
    let Value::Object(ref obj) = value else {
        return Err(ProviderError::CorruptState(
            "state blob is not a JSON object".into(),
        ));
    };

    let version: StateVersion = obj
        .get("version")
        .cloned()
        .ok_or_else(|| ProviderError::CorruptState("state blob has no version".into()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| ProviderError::CorruptState(format!("bad state version: {}", e)))
        })?;
    if version.major != STATE_MAJOR_VERSION {
        return Err(ProviderError::CorruptState(format!(
            "state version {}.{} is not readable by this provider (major {})",
            version.major, version.minor, STATE_MAJOR_VERSION
        )));
    }

    let state: ResourceState = serde_json::from_value(value)
        .map_err(|e| ProviderError::CorruptState(format!("malformed state blob: {}", e)))?;

    if let Some(field) = state
        .critical
        .iter()
        .find(|f| !KNOWN_FIELDS.contains(&f.as_str()))
    {
        return Err(ProviderError::CorruptState(format!(
            "state blob requires unsupported field '{}'",
            field
        )));
    }

    Ok(state)
}
