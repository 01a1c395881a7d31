//! Server helpers for running providers.
//!
//! This module provides the `ProviderService` trait that providers implement,
//! and the `serve` function to start a gRPC server with the handshake protocol.
//!
//! Every failure reaches the caller as an `ErrorEnvelope` inside the response;
//! a `tonic::Status` is only returned when the response itself cannot be built.
//!
//! # Cancellation
//!
//! Create, read, update and delete run on their own task with a
//! [`CancellationToken`] that is a child of the server-wide shutdown token.
//! When the caller goes away (or its deadline passes) the handler future is
//! dropped, which cancels the token. The task sees the cancellation at its
//! next I/O step; whatever it did until then is "outcome unknown".
//!
//! # Signal Handling
//!
//! The server handles OS signals (SIGTERM, SIGINT) and the `Stop` RPC for
//! graceful shutdown. On shutdown the server:
//! 1. Stops accepting new connections and cancels in-flight operations
//! 2. Waits for in-flight requests to complete (with configurable timeout)
//! 3. Calls the provider's `stop()` method
//! 4. Exits cleanly

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::diff::DiffResult;
use crate::error::{ErrorKind, ProviderError};
use crate::generated::{self as proto, resource_provider_server::ResourceProvider};
use crate::schema::{Diagnostic, ProviderSchema};
use crate::types::{
    CheckResult, Operation, PropertyMap, ResourceOutcome, HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};

/// Trait that provider implementations must implement.
///
/// This provides a higher-level API than the raw gRPC trait, using
/// ergonomic Rust types instead of protobuf types.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Schema
    // =========================================================================

    /// Return the provider configuration schema and every resource type.
    fn schema(&self) -> ProviderSchema;

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Configure the provider. Returns warnings as diagnostics.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Stop the provider gracefully. May be called more than once.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate inputs and apply defaults.
    async fn check(
        &self,
        resource_type: &str,
        inputs: PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        let _ = resource_type;
        Ok(CheckResult {
            inputs,
            failures: Vec::new(),
        })
    }

    /// Diff two input maps without touching the resource.
    async fn diff(
        &self,
        resource_type: &str,
        old_inputs: PropertyMap,
        new_inputs: PropertyMap,
    ) -> Result<DiffResult, ProviderError>;

    /// Create a new resource.
    async fn create(
        &self,
        op: &Operation,
        resource_type: &str,
        inputs: PropertyMap,
        preview: bool,
    ) -> Result<ResourceOutcome, ProviderError>;

    /// Read the current outputs of a resource.
    async fn read(
        &self,
        op: &Operation,
        resource_type: &str,
        state: &[u8],
    ) -> Result<PropertyMap, ProviderError>;

    /// Update an existing resource.
    async fn update(
        &self,
        op: &Operation,
        resource_type: &str,
        old_state: &[u8],
        new_inputs: PropertyMap,
    ) -> Result<ResourceOutcome, ProviderError>;

    /// Delete a resource.
    async fn delete(
        &self,
        op: &Operation,
        resource_type: &str,
        state: &[u8],
    ) -> Result<(), ProviderError>;
}

/// The urns with an operation in flight.
#[derive(Debug, Clone, Default)]
struct InFlight {
    urns: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim `urn` until the returned guard drops. Empty urns are not tracked.
    fn claim(&self, urn: &str) -> Result<Option<UrnClaim>, ProviderError> {
        if urn.is_empty() {
            return Ok(None);
        }
        let mut urns = self.urns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !urns.insert(urn.to_string()) {
            return Err(ProviderError::Conflict(urn.to_string()));
        }
        Ok(Some(UrnClaim {
            urns: Arc::clone(&self.urns),
            urn: urn.to_string(),
        }))
    }
}

struct UrnClaim {
    urns: Arc<Mutex<HashSet<String>>>,
    urn: String,
}

impl Drop for UrnClaim {
    fn drop(&mut self) {
        let mut urns = self.urns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        urns.remove(&self.urn);
    }
}

/// Wrapper that implements the generated gRPC trait.
struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl<P: ProviderService> ProviderGrpcService<P> {
    fn new(provider: Arc<P>, shutdown: CancellationToken) -> Self {
        Self {
            provider,
            in_flight: InFlight::default(),
            shutdown,
        }
    }

    /// Run one resource operation on its own task.
    ///
    /// Dropping the returned future cancels the operation token.
    async fn run_operation<T, F, Fut>(
        &self,
        urn: &str,
        name: &'static str,
        operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnOnce(Arc<P>, Operation) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        T: Send + 'static,
    {
        let claim = self.in_flight.claim(urn)?;
        let token = self.shutdown.child_token();
        let op = Operation::new(urn, token.clone());
        let _cancel_on_drop = token.clone().drop_guard();

        let fut = operation(Arc::clone(&self.provider), op);
        let urn = urn.to_string();
        let task = tokio::spawn(async move {
            let _claim = claim;
            let result = fut.await;
            if token.is_cancelled() {
                warn!(
                    urn = %urn,
                    operation = name,
                    succeeded = result.is_ok(),
                    "Operation finished after cancellation, outcome unknown"
                );
            }
            result
        });

        task.await
            .map_err(|e| ProviderError::Internal(format!("{} task failed: {}", name, e)))?
    }
}

fn decode_properties(bytes: &[u8], field: &str) -> Result<PropertyMap, ProviderError> {
    if bytes.is_empty() {
        return Ok(PropertyMap::new());
    }
    match serde_json::from_slice(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::validation_at(
            field,
            format!("{} must be a JSON object, got {}", field, json_kind(&other)),
        )),
        Err(e) => Err(ProviderError::validation_at(
            field,
            format!("{} is not valid JSON: {}", field, e),
        )),
    }
}

fn encode_properties(map: &PropertyMap) -> Result<Vec<u8>, ProviderError> {
    serde_json::to_vec(map).map_err(|e| ProviderError::Internal(format!("encoding properties: {}", e)))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn envelope(err: &ProviderError) -> Option<proto::ErrorEnvelope> {
    Some(proto::ErrorEnvelope::from(err))
}

fn diagnostic_envelope(diagnostic: Diagnostic) -> proto::ErrorEnvelope {
    proto::ErrorEnvelope {
        code: proto::ErrorCode::Validation as i32,
        message: diagnostic.message(),
        property_path: diagnostic.attribute.unwrap_or_default(),
    }
}

fn log_failure(rpc: &str, resource_type: &str, urn: &str, err: &ProviderError) {
    match err.kind() {
        ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::Cancelled | ErrorKind::Validation => {
            warn!(resource_type = %resource_type, urn = %urn, error = %err, "{} failed", rpc)
        },
        _ => error!(resource_type = %resource_type, urn = %urn, error = %err, "{} failed", rpc),
    }
}

#[tonic::async_trait]
impl<P: ProviderService> ResourceProvider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<proto::GetSchemaRequest>,
    ) -> Result<tonic::Response<proto::GetSchemaResponse>, tonic::Status> {
        debug!("GetSchema called");
        let schema = self.provider.schema();
        let bytes = serde_json::to_vec(&schema).map_err(ProviderError::from)?;
        info!(resources = schema.resources.len(), "GetSchema completed");
        Ok(tonic::Response::new(proto::GetSchemaResponse { schema: bytes }))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<proto::ConfigureRequest>,
    ) -> Result<tonic::Response<proto::ConfigureResponse>, tonic::Status> {
        debug!("Configure called");
        let req = request.into_inner();

        let result = match decode_properties(&req.config, "config") {
            Ok(config) => self.provider.configure(Value::Object(config)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(diagnostics) => {
                info!(warnings = diagnostics.len(), "Configure completed successfully");
                Ok(tonic::Response::new(proto::ConfigureResponse {
                    errors: vec![],
                    warnings: diagnostics.into_iter().map(|d| d.message()).collect(),
                }))
            },
            Err(ProviderError::InvalidConfig(issues)) => {
                warn!(issues = issues.len(), "Configure rejected invalid configuration");
                let code = proto::ErrorCode::from(ErrorKind::Configuration) as i32;
                Ok(tonic::Response::new(proto::ConfigureResponse {
                    errors: issues
                        .into_iter()
                        .map(|issue| proto::ErrorEnvelope {
                            code,
                            message: issue.to_string(),
                            property_path: issue.key,
                        })
                        .collect(),
                    warnings: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Configure failed");
                Ok(tonic::Response::new(proto::ConfigureResponse {
                    errors: vec![proto::ErrorEnvelope::from(&e)],
                    warnings: vec![],
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.check")]
    async fn check(
        &self,
        request: tonic::Request<proto::CheckRequest>,
    ) -> Result<tonic::Response<proto::CheckResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, "Check called");

        let result = match decode_properties(&req.inputs, "inputs") {
            Ok(inputs) => self.provider.check(&req.resource_type, inputs).await,
            Err(e) => Err(e),
        };

        let response = match result.and_then(|checked| {
            let inputs = encode_properties(&checked.inputs)?;
            Ok((inputs, checked.failures))
        }) {
            Ok((inputs, failures)) => {
                let errors: Vec<_> = failures.into_iter().filter(Diagnostic::is_error).collect();
                if errors.is_empty() {
                    info!(resource_type = %req.resource_type, "Check completed successfully");
                } else {
                    warn!(
                        resource_type = %req.resource_type,
                        failures = errors.len(),
                        "Check found invalid inputs"
                    );
                }
                proto::CheckResponse {
                    inputs,
                    failures: errors.into_iter().map(diagnostic_envelope).collect(),
                }
            },
            Err(e) => {
                log_failure("Check", &req.resource_type, &req.urn, &e);
                proto::CheckResponse {
                    inputs: vec![],
                    failures: vec![proto::ErrorEnvelope::from(&e)],
                }
            },
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.diff")]
    async fn diff(
        &self,
        request: tonic::Request<proto::DiffRequest>,
    ) -> Result<tonic::Response<proto::DiffResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, "Diff called");

        let result = async {
            let old = decode_properties(&req.old_inputs, "old_inputs")?;
            let new = decode_properties(&req.new_inputs, "new_inputs")?;
            self.provider.diff(&req.resource_type, old, new).await
        }
        .await;

        match result {
            Ok(diff) => {
                info!(
                    resource_type = %req.resource_type,
                    urn = %req.urn,
                    decision = ?diff.decision,
                    changes = diff.changes.len(),
                    "Diff completed"
                );
                Ok(tonic::Response::new(proto::DiffResponse {
                    decision: proto::DiffDecision::from(diff.decision) as i32,
                    changes: diff.changes.iter().map(proto::PropertyDiff::from).collect(),
                    delete_before_replace: diff.delete_before_replace,
                    error: None,
                }))
            },
            Err(e) => {
                log_failure("Diff", &req.resource_type, &req.urn, &e);
                Ok(tonic::Response::new(proto::DiffResponse {
                    error: envelope(&e),
                    ..Default::default()
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.create")]
    async fn create(
        &self,
        request: tonic::Request<proto::CreateRequest>,
    ) -> Result<tonic::Response<proto::CreateResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, preview = req.preview, "Create called");

        let result = async {
            let inputs = decode_properties(&req.inputs, "inputs")?;
            let resource_type = req.resource_type.clone();
            let preview = req.preview;
            let outcome = self
                .run_operation(&req.urn, "create", move |provider, op| async move {
                    provider.create(&op, &resource_type, inputs, preview).await
                })
                .await?;
            Ok::<_, ProviderError>((encode_properties(&outcome.outputs)?, outcome.state))
        }
        .await;

        match result {
            Ok((outputs, state)) => {
                info!(resource_type = %req.resource_type, urn = %req.urn, preview = req.preview, "Create completed successfully");
                Ok(tonic::Response::new(proto::CreateResponse {
                    outputs,
                    state,
                    error: None,
                }))
            },
            Err(e) => {
                log_failure("Create", &req.resource_type, &req.urn, &e);
                Ok(tonic::Response::new(proto::CreateResponse {
                    error: envelope(&e),
                    ..Default::default()
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.read")]
    async fn read(
        &self,
        request: tonic::Request<proto::ReadRequest>,
    ) -> Result<tonic::Response<proto::ReadResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, "Read called");

        let resource_type = req.resource_type.clone();
        let state = req.state;
        let result = self
            .run_operation(&req.urn, "read", move |provider, op| async move {
                provider.read(&op, &resource_type, &state).await
            })
            .await
            .and_then(|outputs| encode_properties(&outputs));

        match result {
            Ok(outputs) => {
                info!(resource_type = %req.resource_type, urn = %req.urn, "Read completed successfully");
                Ok(tonic::Response::new(proto::ReadResponse {
                    outputs,
                    error: None,
                }))
            },
            Err(e) => {
                log_failure("Read", &req.resource_type, &req.urn, &e);
                Ok(tonic::Response::new(proto::ReadResponse {
                    outputs: vec![],
                    error: envelope(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.update")]
    async fn update(
        &self,
        request: tonic::Request<proto::UpdateRequest>,
    ) -> Result<tonic::Response<proto::UpdateResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, "Update called");

        let result = async {
            let new_inputs = decode_properties(&req.new_inputs, "new_inputs")?;
            let resource_type = req.resource_type.clone();
            let old_state = req.old_state.clone();
            let outcome = self
                .run_operation(&req.urn, "update", move |provider, op| async move {
                    provider.update(&op, &resource_type, &old_state, new_inputs).await
                })
                .await?;
            Ok::<_, ProviderError>((encode_properties(&outcome.outputs)?, outcome.state))
        }
        .await;

        match result {
            Ok((outputs, state)) => {
                info!(resource_type = %req.resource_type, urn = %req.urn, "Update completed successfully");
                Ok(tonic::Response::new(proto::UpdateResponse {
                    outputs,
                    state,
                    error: None,
                }))
            },
            Err(e) => {
                log_failure("Update", &req.resource_type, &req.urn, &e);
                Ok(tonic::Response::new(proto::UpdateResponse {
                    error: envelope(&e),
                    ..Default::default()
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.delete")]
    async fn delete(
        &self,
        request: tonic::Request<proto::DeleteRequest>,
    ) -> Result<tonic::Response<proto::DeleteResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, urn = %req.urn, "Delete called");

        let resource_type = req.resource_type.clone();
        let state = req.state;
        let result = self
            .run_operation(&req.urn, "delete", move |provider, op| async move {
                provider.delete(&op, &resource_type, &state).await
            })
            .await;

        match result {
            Ok(()) => {
                info!(resource_type = %req.resource_type, urn = %req.urn, "Delete completed successfully");
                Ok(tonic::Response::new(proto::DeleteResponse { error: None }))
            },
            Err(e) => {
                log_failure("Delete", &req.resource_type, &req.urn, &e);
                Ok(tonic::Response::new(proto::DeleteResponse { error: envelope(&e) }))
            },
        }
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<proto::StopRequest>,
    ) -> Result<tonic::Response<proto::StopResponse>, tonic::Status> {
        info!("Stop called");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                warn!(error = %e, "Provider stop() returned error");
                e.to_string()
            },
        };
        self.shutdown.cancel();
        Ok(tonic::Response::new(proto::StopResponse { error }))
    }
}

/// Options for configuring the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Timeout for graceful shutdown. After shutdown begins, the server will
    /// wait this long for in-flight requests to complete.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// On Unix, this waits for SIGTERM or SIGINT.
/// On Windows, this waits for CTRL+C.
/// If the handlers cannot be installed, this never returns.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, initiating graceful shutdown"),
            Err(e) => {
                warn!(error = %e, "Failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// Serve a provider implementation as a gRPC server.
///
/// This function:
/// 1. Finds an available port
/// 2. Starts the gRPC server
/// 3. Outputs the handshake string to stdout
/// 4. Handles shutdown signals (SIGTERM/SIGINT) and `Stop` gracefully
///
/// The handshake format is: `LIFECYCLE_PROVIDER|<version>|<address>`
///
/// For custom configuration, use [`serve_with_options`].
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a provider with custom options.
///
/// See [`serve`] for details. This function allows configuring
/// shutdown behavior via [`ServeOptions`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Port 0 picks a free port
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    serve_on_listener(provider, listener, addr, options).await
}

/// Serve a provider on a specific address.
///
/// Unlike [`serve`], this function binds to the specified address rather than
/// finding an available port.
pub async fn serve_on<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    serve_on_with_options(provider, addr, ServeOptions::default()).await
}

/// Serve a provider on a specific address with custom options.
pub async fn serve_on_with_options<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    serve_on_listener(provider, listener, actual_addr, options).await
}

async fn serve_on_listener<P: ProviderService>(
    provider: P,
    listener: TcpListener,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr);

    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let shutdown = CancellationToken::new();

    let grpc_service = ProviderGrpcService::new(Arc::clone(&provider), shutdown.clone());
    let server = proto::resource_provider_server::ResourceProviderServer::new(grpc_service);

    let signal_shutdown = shutdown.clone();
    let server_future = Server::builder()
        .add_service(server)
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async move {
                tokio::select! {
                    _ = wait_for_shutdown_signal() => {}
                    _ = signal_shutdown.cancelled() => {}
                }
                signal_shutdown.cancel();
            },
        );
    tokio::pin!(server_future);

    // The timeout only starts once shutdown has begun.
    let drain_deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(options.shutdown_timeout).await;
    };

    tokio::select! {
        result = &mut server_future => match result {
            Ok(()) => info!("Server shutdown complete"),
            Err(e) => {
                error!(error = %e, "Server error during shutdown");
                return Err(e.into());
            }
        },
        _ = drain_deadline => {
            warn!(
                timeout = ?options.shutdown_timeout,
                "Shutdown timeout exceeded, forcing shutdown"
            );
        }
    }

    debug!("Calling provider stop()");
    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Provider shutdown complete");
    Ok(())
}
