//! Convenience types shared by the server, the provider and the engine.
//!
//! These types provide a more ergonomic API over the raw protobuf types.

use tokio_util::sync::CancellationToken;

use crate::schema::Diagnostic;

/// Protocol version advertised in the handshake line.
pub const PROTOCOL_VERSION: u32 = 1;

/// Prefix of the handshake line printed on stdout.
pub const HANDSHAKE_PREFIX: &str = "LIFECYCLE_PROVIDER";

/// Property values keyed by property name, as carried on the wire.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Identity and cancellation of one in-flight resource operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Engine-assigned resource identifier.
    pub urn: String,
    /// Cancelled when the caller goes away or the server shuts down.
    pub cancel: CancellationToken,
}

impl Operation {
    /// Create an operation for `urn` observing `cancel`.
    pub fn new(urn: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            urn: urn.into(),
            cancel,
        }
    }

    /// An operation with its own token, not tied to any server.
    pub fn detached(urn: impl Into<String>) -> Self {
        Self::new(urn, CancellationToken::new())
    }
}

/// What a successful create or update hands back to the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceOutcome {
    /// Output property values.
    pub outputs: PropertyMap,
    /// The encoded state blob. Empty for previews.
    pub state: Vec<u8>,
}

impl ResourceOutcome {
    /// Create a new outcome.
    pub fn new(outputs: PropertyMap, state: Vec<u8>) -> Self {
        Self { outputs, state }
    }
}

/// The result of checking resource inputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckResult {
    /// Inputs with schema defaults applied.
    pub inputs: PropertyMap,
    /// Every problem found, empty when the inputs are valid.
    pub failures: Vec<Diagnostic>,
}

impl CheckResult {
    /// Whether the inputs passed validation.
    pub fn is_valid(&self) -> bool {
        !self.failures.iter().any(Diagnostic::is_error)
    }
}
