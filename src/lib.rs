//! Lifecycle Provider
//!
//! A resource-provider plugin: the orchestration engine spawns this process,
//! reads a handshake line from stdout, and drives create/read/update/delete
//! and diff for the provider's resource types over gRPC. Every bit of durable
//! state is handed back to the engine as an opaque, versioned state blob.
//!
//! # Overview
//!
//! - **Schema registry** ([`registry`], [`schema`], [`validation`]): static
//!   descriptions of every resource type, input validation and defaults
//! - **Configuration negotiator** ([`config`]): validates provider
//!   configuration once per process and hands it out as a [`ProviderContext`]
//! - **Lifecycle engine** ([`engine`], [`diff`]): CRUD and diff per resource type
//! - **State codec** ([`state`]): the versioned state blob
//! - **RPC server** ([`server`]): the gRPC surface with cancellation and the
//!   error envelope
//!
//! # Resource types
//!
//! - `Random`: a generated string that never changes once created
//! - `LocalFile`: a file under the configured `rootDir`
//!
//! # Handshake Protocol
//!
//! When the provider starts via [`serve`], it outputs a handshake string to stdout:
//!
//! ```text
//! LIFECYCLE_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! Format: `LIFECYCLE_PROVIDER|<protocol_version>|<address>`
//!
//! # Provider Protocol
//!
//! - **GetSchema**: Returns the configuration schema and every resource type
//! - **Configure**: Accepts provider configuration, once per process
//! - **Check**: Validates resource inputs and applies defaults
//! - **Diff**: Classifies input changes as no-op, update or replace
//! - **Create/Read/Update/Delete**: CRUD operations for resources
//! - **Stop**: Cancels in-flight operations and shuts the server down

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod logging;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod server;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use config::{ConfigNegotiator, ProviderConfig, ProviderContext};
pub use diff::{DiffDecision, DiffKind, DiffResult, PropertyChange};
pub use engine::{LifecycleEngine, ResourceKind, ResourceLifecycle};
pub use error::{ErrorKind, ProviderError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::LifecycleProvider;
pub use registry::SchemaRegistry;
pub use schema::{ProviderSchema, ResourceType};
pub use server::{
    serve, serve_on, serve_on_with_options, serve_with_options, ProviderService, ServeOptions,
};
pub use types::{
    CheckResult, Operation, PropertyMap, ResourceOutcome, HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
pub use validation::{apply_defaults, is_valid, validate, validate_result};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
