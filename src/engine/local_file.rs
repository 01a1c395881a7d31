//! The `LocalFile` resource: a file under the configured root directory.
//!
//! The file can be changed or removed behind the provider's back, so reads
//! report drift and absence, and deletes tolerate a file that is already gone.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{OperationContext, Produced, ResourceLifecycle};
use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeType, Diagnostic, ResourceType};
use crate::state::ResourceState;
use crate::types::PropertyMap;

/// How `content` maps to the bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Content is the file's UTF-8 text.
    Utf8,
    /// Content is the file's bytes in standard base64.
    Base64,
}

impl Encoding {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "utf8" => Some(Self::Utf8),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Base64 => "base64",
        }
    }

    fn to_bytes(self, content: &str) -> Result<Vec<u8>, String> {
        match self {
            Self::Utf8 => Ok(content.as_bytes().to_vec()),
            Self::Base64 => STANDARD.decode(content).map_err(|e| e.to_string()),
        }
    }

    fn to_content(self, bytes: Vec<u8>) -> Result<String, String> {
        match self {
            Self::Utf8 => String::from_utf8(bytes).map_err(|_| "file is not valid UTF-8".to_string()),
            Self::Base64 => Ok(STANDARD.encode(bytes)),
        }
    }
}

/// Handler for `LocalFile`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileResource;

struct FileInputs<'a> {
    path: &'a str,
    content: &'a str,
    encoding: Encoding,
}

impl<'a> FileInputs<'a> {
    fn from_inputs(inputs: &'a PropertyMap) -> Result<Self, ProviderError> {
        let path = inputs
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::validation_at("path", "path is required"))?;
        let content = inputs
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::validation_at("content", "content is required"))?;
        let encoding = inputs
            .get("encoding")
            .and_then(Value::as_str)
            .and_then(Encoding::parse)
            .ok_or_else(|| ProviderError::validation_at("encoding", "unknown encoding"))?;
        Ok(Self {
            path,
            content,
            encoding,
        })
    }

    fn bytes(&self) -> Result<Vec<u8>, ProviderError> {
        self.encoding
            .to_bytes(self.content)
            .map_err(|e| ProviderError::validation_at("content", e))
    }
}

fn path_problem(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("must not be empty");
    }
    let path = Path::new(path);
    if path.is_absolute() {
        return Some("must be relative to the provider root directory");
    }
    for component in path.components() {
        match component {
            Component::ParentDir => return Some("must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return Some("must be relative to the provider root directory")
            },
            Component::CurDir | Component::Normal(_) => {},
        }
    }
    None
}

/// Fails unless `dir`, or its nearest existing ancestor, resolves to a
/// location under the provider root. Catches symlinks leading out of it.
async fn ensure_inside_root(ctx: &OperationContext<'_>, dir: &Path) -> Result<(), ProviderError> {
    let failed = |what: &Path, e: std::io::Error| ProviderError::CreateFailed {
        reason: format!("{}: {}", what.display(), e),
    };
    let root = ctx
        .guard("resolve root directory", tokio::fs::canonicalize(ctx.provider.root_dir()))
        .await?
        .map_err(|e| failed(ctx.provider.root_dir(), e))?;

    let mut existing = dir;
    loop {
        let found = ctx
            .guard("look up directory", tokio::fs::try_exists(existing))
            .await?
            .map_err(|e| failed(existing, e))?;
        if found {
            break;
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }

    let resolved = ctx
        .guard("resolve directory", tokio::fs::canonicalize(existing))
        .await?
        .map_err(|e| failed(existing, e))?;
    if resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(ProviderError::CreateFailed {
            reason: format!(
                "{} resolves to {}, outside {}",
                dir.display(),
                resolved.display(),
                root.display()
            ),
        })
    }
}

/// Create `absolute`, which must not exist yet, holding exactly `bytes`.
///
/// `wrap` turns the opened file into the writer the bytes go through. If
/// writing fails or is cancelled, the partial file is removed so a later
/// create of the same path can succeed.
async fn write_new_file<W, F>(
    ctx: &OperationContext<'_>,
    absolute: &Path,
    bytes: &[u8],
    wrap: F,
) -> Result<(), ProviderError>
where
    F: FnOnce(tokio::fs::File) -> W + Send,
    W: AsyncWrite + Unpin + Send,
{
    let create_failed = |e: std::io::Error| ProviderError::CreateFailed {
        reason: format!("{}: {}", absolute.display(), e),
    };

    let handle = ctx
        .guard(
            "create file",
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(absolute),
        )
        .await?
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ProviderError::CreateFailed {
                reason: format!("{} already exists", absolute.display()),
            },
            _ => create_failed(e),
        })?;

    let mut writer = wrap(handle);
    let written = async {
        ctx.guard("write file", writer.write_all(bytes))
            .await?
            .map_err(create_failed)?;
        ctx.guard("flush file", writer.flush())
            .await?
            .map_err(create_failed)
    }
    .await;
    drop(writer);

    if written.is_err() {
        if let Err(e) = tokio::fs::remove_file(absolute).await {
            warn!(path = %absolute.display(), error = %e, "Could not remove partially written file");
        }
    }
    written
}

fn outputs(inputs: &FileInputs<'_>, absolute: &Path, content: &str, size: usize) -> PropertyMap {
    let mut outputs = PropertyMap::new();
    outputs.insert("path".into(), json!(inputs.path));
    outputs.insert("absolutePath".into(), json!(absolute.to_string_lossy()));
    outputs.insert("content".into(), json!(content));
    outputs.insert("encoding".into(), json!(inputs.encoding.name()));
    outputs.insert("size".into(), json!(size));
    outputs
}

fn stored_path(state: &ResourceState) -> Result<PathBuf, ProviderError> {
    state
        .private_str("absolutePath")
        .map(PathBuf::from)
        .ok_or_else(|| ProviderError::CorruptState("LocalFile state has no absolute path".into()))
}

fn state_inputs(state: &ResourceState) -> Result<FileInputs<'_>, ProviderError> {
    FileInputs::from_inputs(&state.inputs)
        .map_err(|e| ProviderError::CorruptState(format!("LocalFile state inputs: {}", e)))
}

#[async_trait]
impl ResourceLifecycle for LocalFileResource {
    fn resource_type(&self) -> ResourceType {
        ResourceType::new("LocalFile")
            .with_description("A file under the provider root directory")
            .with_input(
                "path",
                Attribute::required(AttributeType::String)
                    .with_description("Path relative to rootDir")
                    .immutable(),
            )
            .with_input(
                "content",
                Attribute::required(AttributeType::String).with_description("File content"),
            )
            .with_input(
                "encoding",
                Attribute::optional(AttributeType::String)
                    .with_description("utf8 or base64")
                    .with_default(json!("utf8"))
                    .immutable(),
            )
            .with_input(
                "description",
                Attribute::optional(AttributeType::String).ignored(),
            )
            .with_output("path", Attribute::computed(AttributeType::String))
            .with_output("absolutePath", Attribute::computed(AttributeType::String))
            .with_output("content", Attribute::computed(AttributeType::String))
            .with_output("encoding", Attribute::computed(AttributeType::String))
            .with_output("size", Attribute::computed(AttributeType::Int64))
            .with_delete_before_replace()
    }

    fn validate(&self, inputs: &PropertyMap) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if let Some(path) = inputs.get("path").and_then(Value::as_str) {
            if let Some(problem) = path_problem(path) {
                diagnostics.push(
                    Diagnostic::error("Invalid value for attribute 'path'")
                        .with_detail(problem)
                        .with_attribute("path"),
                );
            }
        }
        let encoding = inputs.get("encoding").and_then(Value::as_str);
        match encoding.map(|e| (e, Encoding::parse(e))) {
            Some((name, None)) => diagnostics.push(
                Diagnostic::error("Invalid value for attribute 'encoding'")
                    .with_detail(format!("must be utf8 or base64, got '{}'", name))
                    .with_attribute("encoding"),
            ),
            Some((_, Some(encoding))) => {
                if let Some(Err(e)) = inputs
                    .get("content")
                    .and_then(Value::as_str)
                    .map(|c| encoding.to_bytes(c))
                {
                    diagnostics.push(
                        Diagnostic::error("Invalid value for attribute 'content'")
                            .with_detail(e)
                            .with_attribute("content"),
                    );
                }
            },
            None => {},
        }
        diagnostics
    }

    fn preview(&self, ctx: &OperationContext<'_>, inputs: &PropertyMap) -> PropertyMap {
        match FileInputs::from_inputs(inputs) {
            Ok(file) => {
                let size = file.bytes().map(|b| b.len()).unwrap_or_default();
                let absolute = ctx.provider.root_dir().join(file.path);
                outputs(&file, &absolute, file.content, size)
            },
            Err(_) => PropertyMap::new(),
        }
    }

    async fn create(
        &self,
        ctx: &OperationContext<'_>,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError> {
        let file = FileInputs::from_inputs(inputs)?;
        let bytes = file.bytes()?;
        let absolute = ctx.provider.root_dir().join(file.path);
        let create_failed = |e: std::io::Error| ProviderError::CreateFailed {
            reason: format!("{}: {}", absolute.display(), e),
        };

        if let Some(parent) = absolute.parent() {
            ensure_inside_root(ctx, parent).await?;
            ctx.guard("create parent directories", tokio::fs::create_dir_all(parent))
                .await?
                .map_err(create_failed)?;
            ensure_inside_root(ctx, parent).await?;
        }

        write_new_file(ctx, &absolute, &bytes, |file| file).await?;

        debug!(path = %absolute.display(), size = bytes.len(), "File created");
        Ok(Produced {
            outputs: outputs(&file, &absolute, file.content, bytes.len()),
            private: json!({ "absolutePath": absolute.to_string_lossy() }),
        })
    }

    async fn read(
        &self,
        ctx: &OperationContext<'_>,
        state: &ResourceState,
    ) -> Result<PropertyMap, ProviderError> {
        let file = state_inputs(state)?;
        let absolute = stored_path(state)?;

        let bytes = ctx
            .guard("read file", tokio::fs::read(&absolute))
            .await?
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ProviderError::NotFound(ctx.urn.to_string()),
                _ => ProviderError::ReadFailed {
                    reason: format!("{}: {}", absolute.display(), e),
                },
            })?;
        let size = bytes.len();
        let content = file
            .encoding
            .to_content(bytes)
            .map_err(|reason| ProviderError::ReadFailed { reason })?;

        if content != file.content {
            debug!(path = %absolute.display(), "File content drifted");
        }
        Ok(outputs(&file, &absolute, &content, size))
    }

    async fn update(
        &self,
        ctx: &OperationContext<'_>,
        state: &ResourceState,
        inputs: &PropertyMap,
    ) -> Result<Produced, ProviderError> {
        let file = FileInputs::from_inputs(inputs)?;
        let bytes = file.bytes()?;
        let absolute = stored_path(state)?;
        let update_failed = |e: std::io::Error| ProviderError::UpdateFailed {
            reason: format!("{}: {}", absolute.display(), e),
        };

        ctx.guard("stat file", tokio::fs::metadata(&absolute))
            .await?
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ProviderError::UpdateFailed {
                    reason: format!("{} no longer exists", absolute.display()),
                },
                _ => update_failed(e),
            })?;
        ctx.guard("write file", tokio::fs::write(&absolute, &bytes))
            .await?
            .map_err(update_failed)?;

        debug!(path = %absolute.display(), size = bytes.len(), "File updated");
        Ok(Produced {
            outputs: outputs(&file, &absolute, file.content, bytes.len()),
            private: state.private.clone(),
        })
    }

    async fn delete(&self, ctx: &OperationContext<'_>, state: &ResourceState) -> Result<(), ProviderError> {
        let absolute = stored_path(state)?;
        ctx.guard("remove file", tokio::fs::remove_file(&absolute))
            .await?
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ProviderError::NotFound(ctx.urn.to_string()),
                _ => ProviderError::DeleteFailed {
                    reason: format!("{}: {}", absolute.display(), e),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{context, props};
    use crate::types::Operation;
    use tokio_test::{assert_err, assert_ok};

    async fn created(
        octx: &OperationContext<'_>,
        inputs: &PropertyMap,
    ) -> ResourceState {
        let produced = LocalFileResource.create(octx, inputs).await.unwrap();
        ResourceState::new("LocalFile", inputs.clone(), produced.outputs).with_private(produced.private)
    }

    fn file_inputs(path: &str, content: &str) -> PropertyMap {
        props(json!({"path": path, "content": content, "encoding": "utf8"}))
    }

    #[test]
    fn test_path_rules() {
        assert_eq!(path_problem("a/b.txt"), None);
        assert_eq!(path_problem("./a.txt"), None);
        assert!(path_problem("").is_some());
        assert!(path_problem("/etc/passwd").is_some());
        assert!(path_problem("../escape").is_some());
        assert!(path_problem("a/../../escape").is_some());
    }

    #[test]
    fn test_validate_base64_content() {
        let diagnostics = LocalFileResource.validate(&props(
            json!({"path": "a", "content": "not base64!", "encoding": "base64"}),
        ));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("content"));

        let diagnostics = LocalFileResource.validate(&props(
            json!({"path": "a", "content": "x", "encoding": "latin1"}),
        ));
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("encoding"));
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let state = created(&octx, &file_inputs("nested/hello.txt", "hello")).await;
        let on_disk = dir.path().join("nested/hello.txt");
        assert_eq!(std::fs::read_to_string(&on_disk).unwrap(), "hello");
        assert_eq!(state.outputs["size"], 5);

        let read = assert_ok!(LocalFileResource.read(&octx, &state).await);
        assert_eq!(read, state.outputs);

        assert_ok!(LocalFileResource.delete(&octx, &state).await);
        assert!(!on_disk.exists());

        let err = LocalFileResource.read(&octx, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
        let err = LocalFileResource.delete(&octx, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_base64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let encoded = STANDARD.encode([0u8, 159, 146, 150]);
        let inputs = props(json!({"path": "bin", "content": encoded, "encoding": "base64"}));
        let state = created(&octx, &inputs).await;
        assert_eq!(std::fs::read(dir.path().join("bin")).unwrap(), vec![0u8, 159, 146, 150]);

        let read = LocalFileResource.read(&octx, &state).await.unwrap();
        assert_eq!(read["content"], encoded.as_str());
        assert_eq!(read["size"], 4);
    }

    /// Accepts nothing: every write fails as if the disk were full.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::Error::new(ErrorKind::Other, "no space left on device")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);
        let target = dir.path().join("half.txt");

        let err = write_new_file(&octx, &target, b"payload", |_file| FullDisk)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CreateFailed { .. }));
        assert!(!target.exists());

        // A retry is not blocked by leftovers.
        assert_ok!(
            LocalFileResource
                .create(&octx, &file_inputs("half.txt", "payload"))
                .await
        );
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "payload");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_refuses_symlink_out_of_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        for path in ["escape/x.txt", "escape/deeper/x.txt"] {
            let err = LocalFileResource
                .create(&octx, &file_inputs(path, "x"))
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::CreateFailed { .. }), "{path}: {err}");
        }
        assert!(!outside.path().join("x.txt").exists());
        assert!(!outside.path().join("deeper").exists());
    }

    #[tokio::test]
    async fn test_create_in_new_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        assert_ok!(
            LocalFileResource
                .create(&octx, &file_inputs("a/b/c.txt", "nested"))
                .await
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(), "nested");
    }

    #[tokio::test]
    async fn test_create_existing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken.txt"), "mine").unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let err = LocalFileResource
            .create(&octx, &file_inputs("taken.txt", "yours"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CreateFailed { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join("taken.txt")).unwrap(), "mine");
    }

    #[tokio::test]
    async fn test_read_reports_drift() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let state = created(&octx, &file_inputs("drift.txt", "before")).await;
        std::fs::write(dir.path().join("drift.txt"), "changed outside").unwrap();

        let read = LocalFileResource.read(&octx, &state).await.unwrap();
        assert_eq!(read["content"], "changed outside");
        assert_eq!(read["size"], 15);
    }

    #[tokio::test]
    async fn test_update_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let state = created(&octx, &file_inputs("u.txt", "one")).await;
        let produced = LocalFileResource
            .update(&octx, &state, &file_inputs("u.txt", "two!"))
            .await
            .unwrap();
        assert_eq!(produced.outputs["size"], 4);
        assert_eq!(std::fs::read_to_string(dir.path().join("u.txt")).unwrap(), "two!");
    }

    #[tokio::test]
    async fn test_update_of_vanished_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        let octx = OperationContext::new(&ctx, &op);

        let state = created(&octx, &file_inputs("gone.txt", "one")).await;
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();

        let err = LocalFileResource
            .update(&octx, &state, &file_inputs("gone.txt", "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UpdateFailed { .. }));
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn test_cancelled_create_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None);
        let op = Operation::detached("urn:file");
        op.cancel.cancel();
        let octx = OperationContext::new(&ctx, &op);

        let result = LocalFileResource
            .create(&octx, &file_inputs("never.txt", "x"))
            .await;
        let err = assert_err!(result);
        assert!(matches!(err, ProviderError::Cancelled(_)));
        assert!(!dir.path().join("never.txt").exists());
    }
}
