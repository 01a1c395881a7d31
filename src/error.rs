//! Error types for the lifecycle provider.
//!
//! Every failure a resource operation can produce is a [`ProviderError`].
//! Errors are grouped into an [`ErrorKind`] which decides how the caller is
//! told about them: a protocol-level [`ErrorEnvelope`](crate::generated::ErrorEnvelope)
//! inside the RPC response, or a [`tonic::Status`] when the RPC itself fails.

use std::fmt;

use thiserror::Error;

use crate::generated::{ErrorCode, ErrorEnvelope};

/// A single problem found while validating provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// The configuration key the problem is attached to.
    pub key: String,
    /// What is wrong with it.
    pub problem: String,
}

impl ConfigIssue {
    /// Create a new configuration issue.
    pub fn new(key: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.problem)
    }
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while serving resource operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Inputs have the wrong shape; the caller can fix them and retry.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable description.
        message: String,
        /// Dotted path of the offending property, if there is one.
        property_path: Option<String>,
    },

    /// Provider configuration is missing keys or has malformed values.
    #[error("Invalid provider configuration: {}", join_issues(.0))]
    InvalidConfig(Vec<ConfigIssue>),

    /// The provider was already configured with different values.
    #[error("Provider configuration is immutable for the lifetime of the process")]
    ConfigurationImmutable,

    /// A resource operation arrived before `Configure` succeeded.
    #[error("Provider has not been configured")]
    NotConfigured,

    /// A resource type with this name is already registered.
    #[error("Resource type already registered: {0}")]
    DuplicateType(String),

    /// The requested resource type is not registered.
    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    /// The resource no longer exists.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The downstream system rejected a create.
    #[error("Create failed: {reason}")]
    CreateFailed {
        /// Why the create was rejected.
        reason: String,
    },

    /// Live state could not be read for a reason other than absence.
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// Why the read failed.
        reason: String,
    },

    /// The downstream system rejected an update.
    #[error("Update failed: {reason}")]
    UpdateFailed {
        /// Why the update was rejected.
        reason: String,
    },

    /// The downstream system rejected a delete.
    #[error("Delete failed: {reason}")]
    DeleteFailed {
        /// Why the delete was rejected.
        reason: String,
    },

    /// A state blob could not be decoded or is internally inconsistent.
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// The caller cancelled the operation. Whether the external side effect
    /// happened is unknown.
    #[error("Operation cancelled, outcome unknown: {0}")]
    Cancelled(String),

    /// Another operation on the same resource is still in flight.
    #[error("Conflicting operation in flight for {0}")]
    Conflict(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bug or broken invariant inside the provider.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ProviderError`], telling the caller what to
/// do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fix the inputs.
    Validation,
    /// Forget the resource.
    NotFound,
    /// The downstream system refused; may be retried.
    ExternalFailure,
    /// The state blob needs manual intervention.
    CorruptState,
    /// The provider process cannot serve this run.
    Configuration,
    /// Outcome unknown; re-read before deciding.
    Cancelled,
    /// The caller broke the one-operation-per-urn contract.
    Conflict,
    /// Provider bug.
    Internal,
}

impl ProviderError {
    /// Create a validation error attached to a property.
    pub fn validation_at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            property_path: Some(path.into()),
        }
    }

    /// Create a validation error that is not tied to a single property.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            property_path: None,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::UnknownType(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CreateFailed { .. }
            | Self::ReadFailed { .. }
            | Self::UpdateFailed { .. }
            | Self::DeleteFailed { .. } => ErrorKind::ExternalFailure,
            Self::CorruptState(_) => ErrorKind::CorruptState,
            Self::InvalidConfig(_) | Self::ConfigurationImmutable | Self::NotConfigured => {
                ErrorKind::Configuration
            },
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::DuplicateType(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            },
        }
    }

    /// The property path this error points at, if any.
    pub fn property_path(&self) -> Option<&str> {
        match self {
            Self::Validation { property_path, .. } => property_path.as_deref(),
            _ => None,
        }
    }
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => ErrorCode::Validation,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::ExternalFailure => ErrorCode::ExternalFailure,
            ErrorKind::CorruptState => ErrorCode::CorruptState,
            ErrorKind::Configuration => ErrorCode::Configuration,
            ErrorKind::Cancelled => ErrorCode::Cancelled,
            ErrorKind::Conflict => ErrorCode::Conflict,
            ErrorKind::Internal => ErrorCode::Internal,
        }
    }
}

impl From<&ProviderError> for ErrorEnvelope {
    fn from(err: &ProviderError) -> Self {
        ErrorEnvelope {
            code: ErrorCode::from(err.kind()) as i32,
            message: err.to_string(),
            property_path: err.property_path().unwrap_or_default().to_string(),
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => tonic::Status::invalid_argument(message),
            ErrorKind::NotFound => tonic::Status::not_found(message),
            ErrorKind::ExternalFailure => tonic::Status::unavailable(message),
            ErrorKind::CorruptState => tonic::Status::data_loss(message),
            ErrorKind::Configuration => tonic::Status::failed_precondition(message),
            ErrorKind::Cancelled => tonic::Status::cancelled(message),
            ErrorKind::Conflict => tonic::Status::aborted(message),
            ErrorKind::Internal => tonic::Status::internal(message),
        }
    }
}
