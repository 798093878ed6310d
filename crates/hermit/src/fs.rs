//! Workspace file operations.
//!
//! Every path goes through [`PathGuard`] before any I/O happens. On top of the
//! lexical check, existing symlinks along the resolved host path are refused,
//! so a link planted inside the workspace cannot redirect a read or write to
//! somewhere outside it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PublicError, SandboxError};
use crate::path_guard::{PathGuard, SafePath};
use crate::workspace::Workspace;

/// What a [`FileOperation`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Read a file.
    Read,
    /// Create or replace a file.
    Write,
    /// Remove a file or directory tree.
    Delete,
    /// List a directory.
    List,
}

/// One file operation, as submitted by a caller or an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Workspace path, before sanitization.
    #[serde(default)]
    pub path: String,
    /// The action to perform.
    pub action: FileAction,
    /// New content for `write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileOperation {
    /// A `read` of `path`.
    pub fn read(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Read,
            content: None,
        }
    }

    /// A `write` of `content` to `path`.
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Write,
            content: Some(content.into()),
        }
    }

    /// A `delete` of `path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: None,
        }
    }

    /// A `list` of `path`.
    pub fn list(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::List,
            content: None,
        }
    }
}

/// A directory entry returned by [`FileStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name.
    pub name: String,
    /// Guest path.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// Metadata returned by [`FileStore::stat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Guest path.
    pub path: String,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// What a single [`FileOperation`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOpOutput {
    /// File contents.
    Read(Vec<u8>),
    /// Bytes written.
    Written(u64),
    /// The path no longer exists.
    Deleted,
    /// Directory listing.
    Listed(Vec<DirEntry>),
}

impl FileOpOutput {
    /// Render as an observation for an agent transcript.
    pub fn observation(&self) -> String {
        match self {
            FileOpOutput::Read(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            FileOpOutput::Written(n) => format!("wrote {n} bytes"),
            FileOpOutput::Deleted => "deleted".to_string(),
            FileOpOutput::Listed(entries) => entries
                .iter()
                .map(|e| {
                    if e.is_dir {
                        format!("{}/", e.name)
                    } else {
                        e.name.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Per-item outcome of [`FileStore::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// The path as submitted.
    pub path: String,
    /// Whether this item succeeded.
    pub success: bool,
    /// Why it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PublicError>,
    /// File contents for a successful `read` (lossy UTF-8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Entries for a successful `list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<DirEntry>>,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// True only when every item succeeded.
    pub succeeded: bool,
    /// One result per submitted operation, in order.
    pub results: Vec<BatchItemResult>,
}

/// Read/write/delete/list over workspace filesystems.
#[derive(Debug, Clone)]
pub struct FileStore {
    guest_root: PathBuf,
}

impl FileStore {
    /// Create a file store whose workspaces appear at `guest_root`.
    pub fn new(guest_root: impl Into<PathBuf>) -> Self {
        Self {
            guest_root: guest_root.into(),
        }
    }

    /// The guard for one workspace.
    pub fn guard(&self, workspace: &Workspace) -> PathGuard {
        PathGuard::new(&self.guest_root, &workspace.root)
    }

    /// Read a whole file.
    pub async fn read(&self, workspace: &Workspace, path: &str) -> Result<Vec<u8>, SandboxError> {
        let target = self.checked(workspace, path).await?;
        let meta = match tokio::fs::metadata(&target.host).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound("file".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Err(SandboxError::InvalidRequest("path is a directory".into()));
        }
        let limit = workspace.config.limits.max_file_bytes;
        if limit > 0 && meta.len() > limit {
            return Err(SandboxError::InvalidRequest(format!(
                "file exceeds the {limit} byte limit"
            )));
        }
        Ok(tokio::fs::read(&target.host).await?)
    }

    /// Create or replace a file, creating parent directories as needed.
    pub async fn write(
        &self,
        workspace: &Workspace,
        path: &str,
        content: &[u8],
    ) -> Result<u64, SandboxError> {
        let target = self.checked(workspace, path).await?;
        if target.is_root() {
            return Err(SandboxError::InvalidRequest(
                "cannot write to the workspace root".into(),
            ));
        }
        let limit = workspace.config.limits.max_file_bytes;
        if limit > 0 && content.len() as u64 > limit {
            return Err(SandboxError::InvalidRequest(format!(
                "content exceeds the {limit} byte limit"
            )));
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(&target.host).await
            && meta.is_dir()
        {
            return Err(SandboxError::InvalidRequest("path is a directory".into()));
        }

        if let Some(parent) = target.host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Parents may have been created concurrently; re-check before writing.
        refuse_symlinks(workspace.root.as_path(), &target.host).await?;
        tokio::fs::write(&target.host, content).await?;
        tracing::debug!(workspace = %workspace.id, bytes = content.len(), "file written");
        Ok(content.len() as u64)
    }

    /// Remove a file or directory tree. Removing a missing path succeeds.
    ///
    /// A symlink as the last component is removed itself, never followed.
    pub async fn delete(&self, workspace: &Workspace, path: &str) -> Result<(), SandboxError> {
        let target = self.resolved(workspace, path)?;
        if target.is_root() {
            return Err(SandboxError::InvalidRequest(
                "cannot delete the workspace root".into(),
            ));
        }
        if let Some(parent) = target.host.parent() {
            refuse_symlinks(&workspace.root, parent).await?;
        }
        let meta = match tokio::fs::symlink_metadata(&target.host).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target.host).await
        } else {
            tokio::fs::remove_file(&target.host).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List a directory, sorted by name.
    pub async fn list(
        &self,
        workspace: &Workspace,
        path: &str,
    ) -> Result<Vec<DirEntry>, SandboxError> {
        let target = self.checked(workspace, path).await?;
        let mut dir = match tokio::fs::read_dir(&target.host).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound("directory".into()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                return Err(SandboxError::InvalidRequest("path is not a directory".into()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Links are reported but never followed.
            let meta = tokio::fs::symlink_metadata(entry.path()).await?;
            entries.push(DirEntry {
                path: target.guest.join(&name).to_string_lossy().into_owned(),
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Metadata for a path.
    pub async fn stat(&self, workspace: &Workspace, path: &str) -> Result<FileStat, SandboxError> {
        let target = self.checked(workspace, path).await?;
        let meta = match tokio::fs::metadata(&target.host).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound("file".into()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FileStat {
            path: target.guest.to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Apply one operation.
    pub async fn apply(
        &self,
        workspace: &Workspace,
        op: &FileOperation,
    ) -> Result<FileOpOutput, SandboxError> {
        match op.action {
            FileAction::Read => self.read(workspace, &op.path).await.map(FileOpOutput::Read),
            FileAction::Write => {
                let content = op.content.as_deref().ok_or_else(|| {
                    SandboxError::InvalidRequest("write requires content".into())
                })?;
                self.write(workspace, &op.path, content.as_bytes())
                    .await
                    .map(FileOpOutput::Written)
            }
            FileAction::Delete => self
                .delete(workspace, &op.path)
                .await
                .map(|()| FileOpOutput::Deleted),
            FileAction::List => self.list(workspace, &op.path).await.map(FileOpOutput::Listed),
        }
    }

    /// Apply every operation independently. A failed item never stops or
    /// rolls back the others.
    pub async fn apply_batch(&self, workspace: &Workspace, ops: &[FileOperation]) -> BatchResult {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let item = match self.apply(workspace, op).await {
                Ok(output) => {
                    let (content, entries) = match output {
                        FileOpOutput::Read(bytes) => {
                            (Some(String::from_utf8_lossy(&bytes).into_owned()), None)
                        }
                        FileOpOutput::Listed(entries) => (None, Some(entries)),
                        FileOpOutput::Written(_) | FileOpOutput::Deleted => (None, None),
                    };
                    BatchItemResult {
                        path: op.path.clone(),
                        success: true,
                        error: None,
                        content,
                        entries,
                    }
                }
                Err(e) => BatchItemResult {
                    path: op.path.clone(),
                    success: false,
                    error: Some(e.to_public()),
                    content: None,
                    entries: None,
                },
            };
            results.push(item);
        }
        BatchResult {
            succeeded: results.iter().all(|r| r.success),
            results,
        }
    }

    fn resolved(&self, workspace: &Workspace, path: &str) -> Result<SafePath, SandboxError> {
        if !workspace.is_ready() {
            return Err(SandboxError::SandboxUnavailable(format!(
                "workspace {} is {:?}",
                workspace.id, workspace.status
            )));
        }
        self.guard(workspace).resolve(path)
    }

    async fn checked(&self, workspace: &Workspace, path: &str) -> Result<SafePath, SandboxError> {
        let target = self.resolved(workspace, path)?;
        refuse_symlinks(&workspace.root, &target.host).await?;
        Ok(target)
    }
}

/// Refuse `target` if it, or any existing ancestor below `root`, is a symlink.
pub(crate) async fn refuse_symlinks(root: &Path, target: &Path) -> Result<(), SandboxError> {
    let Ok(relative) = target.strip_prefix(root) else {
        return Err(SandboxError::PathTraversal);
    };
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                tracing::debug!("refusing to follow a symlink inside a workspace");
                return Err(SandboxError::PathTraversal);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
