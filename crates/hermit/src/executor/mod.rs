//! Shell command execution inside a workspace.
//!
//! [`SandboxExecutor::execute`] resolves the working directory through
//! [`PathGuard`](crate::PathGuard), checks the workspace's command policy,
//! takes one of the workspace's command slots (or fails with `SandboxBusy`),
//! then runs the script through the configured [`Launcher`] in its own process
//! group with rlimits applied.
//!
//! A non-zero exit code is a normal result. So is a timeout: the process
//! group is killed, and the partial output comes back with `timed_out` set.
//! Every execution is appended to the store as a [`ShellCommandRecord`].

mod launcher;
mod process;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::{Semaphore, TryAcquireError, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use launcher::{BubblewrapLauncher, DEFAULT_ENV_ALLOWLIST, HostLauncher, Launcher};
pub use process::{CANCELLED_EXIT_CODE, TIMEOUT_EXIT_CODE};

use crate::error::{SandboxError, log_safe};
use crate::fs::refuse_symlinks;
use crate::limits::opt_duration_ms;
use crate::path_guard::PathGuard;
use crate::policy::policy_for_workspace;
use crate::store::{ShellCommandRecord, Store};
use crate::workspace::{Workspace, WorkspaceId};

/// One shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The command line, run with `sh -c`.
    pub command: String,
    /// Working directory in the guest namespace; defaults to the root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Wall-clock bound, clamped to the workspace's `max_timeout`.
    #[serde(default, rename = "timeout_ms", with = "opt_duration_ms")]
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// A request for `command` with default cwd and timeout.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A chunk of live output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Bytes written to stdout.
    Stdout(Vec<u8>),
    /// Bytes written to stderr.
    Stderr(Vec<u8>),
}

/// Where live output goes while a command runs.
///
/// Unbounded so a slow consumer can never stall the deadline; the volume is
/// bounded by the output cap.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

fn lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The outcome of one command. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Captured standard output.
    #[serde(serialize_with = "lossy")]
    pub stdout: Vec<u8>,
    /// Captured standard error.
    #[serde(serialize_with = "lossy")]
    pub stderr: Vec<u8>,
    /// Exit code; see [`TIMEOUT_EXIT_CODE`] and [`CANCELLED_EXIT_CODE`].
    pub exit_code: i32,
    /// Wall-clock duration.
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Killed at the deadline.
    pub timed_out: bool,
    /// Killed because the caller cancelled.
    pub cancelled: bool,
    /// Output exceeded the cap.
    pub truncated: bool,
}

impl ExecutionResult {
    /// Standard output as text.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as text.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exited normally with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// Stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout_str();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr_str());
        }
        out
    }
}

/// Runs shell commands inside workspaces.
pub struct SandboxExecutor {
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn Store>,
    guest_root: PathBuf,
    term_grace: Duration,
    slots: Mutex<HashMap<WorkspaceId, Arc<Semaphore>>>,
}

impl fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("launcher", &self.launcher.name())
            .field("guest_root", &self.guest_root)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Create an executor.
    pub fn new(
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn Store>,
        guest_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            store,
            guest_root: guest_root.into(),
            term_grace: Duration::from_secs(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// How long a killed command gets between SIGTERM and SIGKILL.
    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    /// Run `request` in `workspace`.
    ///
    /// When `sink` is given, output chunks are sent to it as they are read.
    /// Cancelling `cancel` kills the process group and returns the partial
    /// result with `cancelled` set.
    pub async fn execute(
        &self,
        workspace: &Workspace,
        request: ExecutionRequest,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if !workspace.is_ready() {
            return Err(SandboxError::SandboxUnavailable(format!(
                "workspace {} is {:?}",
                workspace.id, workspace.status
            )));
        }
        if request.command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("command is empty".into()));
        }

        let guard = PathGuard::new(&self.guest_root, &workspace.root);
        let cwd = guard.resolve(request.cwd.as_deref().unwrap_or_default())?;
        match tokio::fs::metadata(guard.host_root()).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(SandboxError::SandboxUnavailable(format!(
                    "workspace {} root is missing",
                    workspace.id
                )));
            }
        }
        refuse_symlinks(guard.host_root(), &cwd.host).await?;
        match tokio::fs::metadata(&cwd.host).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(SandboxError::InvalidRequest(
                    "working directory does not exist".into(),
                ));
            }
        }

        let decision = policy_for_workspace(&workspace.config).check_script(&request.command);
        if let Some(reason) = decision.denial_reason() {
            tracing::info!(workspace = %workspace.id, "command rejected by policy: {}", reason);
            return Err(SandboxError::InvalidRequest(reason.to_string()));
        }

        let _permit = self.acquire_slot(workspace)?;

        let limits = &workspace.config.limits;
        let timeout = limits.effective_timeout(request.timeout);
        let command = self.launcher.command(&guard, &cwd, &request.command)?;

        tracing::debug!(
            workspace = %workspace.id,
            launcher = self.launcher.name(),
            timeout_ms = timeout.as_millis() as u64,
            command = %log_safe(&request.command),
            "executing command"
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let outcome = process::run(
            command,
            process::RunOptions {
                timeout,
                grace: self.term_grace,
                max_output_bytes: usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX),
                cpu_seconds: limits.cpu_seconds(),
                max_memory_bytes: limits.max_memory_bytes,
                sink: sink.as_ref(),
                cancel,
            },
        )
        .await?;

        let result = ExecutionResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            duration: started.elapsed(),
            timed_out: outcome.timed_out,
            cancelled: outcome.cancelled,
            truncated: outcome.truncated,
        };

        if result.timed_out {
            tracing::info!(
                workspace = %workspace.id,
                timeout_ms = timeout.as_millis() as u64,
                "command timed out"
            );
        }

        self.record(
            workspace.id,
            &request.command,
            &cwd.guest.to_string_lossy(),
            &result,
            started_at,
        )
        .await;
        Ok(result)
    }

    /// Drop the concurrency slots of a workspace that no longer exists.
    pub fn forget_workspace(&self, id: WorkspaceId) {
        if let Ok(mut slots) = self.slots.lock()
            && let Some(semaphore) = slots.remove(&id)
        {
            semaphore.close();
        }
    }

    fn acquire_slot(
        &self,
        workspace: &Workspace,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, SandboxError> {
        let permits = workspace.config.concurrent_commands.max(1);
        let semaphore = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| SandboxError::Internal("slot table poisoned".into()))?;
            slots
                .entry(workspace.id)
                .or_insert_with(|| Arc::new(Semaphore::new(permits)))
                .clone()
        };
        semaphore.try_acquire_owned().map_err(|e| match e {
            TryAcquireError::NoPermits => SandboxError::SandboxBusy(permits),
            TryAcquireError::Closed => {
                let message = format!("workspace {} was terminated", workspace.id);
                SandboxError::SandboxUnavailable(message)
            }
        })
    }

    async fn record(
        &self,
        workspace_id: WorkspaceId,
        command: &str,
        cwd: &str,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
    ) {
        let record = ShellCommandRecord {
            id: Uuid::new_v4(),
            workspace_id,
            command: command.to_string(),
            cwd: cwd.to_string(),
            output: result.combined_output(),
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            timed_out: result.timed_out,
            cancelled: result.cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_command(record).await {
            tracing::warn!(workspace = %workspace_id, "failed to persist command record: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::InMemoryStore;
    use crate::workspace::{WorkspaceConfig, WorkspaceStatus};

    fn setup(root: &std::path::Path) -> (SandboxExecutor, Arc<InMemoryStore>, Workspace) {
        let store = Arc::new(InMemoryStore::new());
        let executor = SandboxExecutor::new(Arc::new(HostLauncher::new()), store.clone(), "/workspace")
            .with_term_grace(Duration::from_millis(200));
        let workspace = Workspace {
            id: WorkspaceId::new(),
            owner_id: "alice".into(),
            root: root.to_path_buf(),
            status: WorkspaceStatus::Ready,
            config: WorkspaceConfig::default(),
            created_at: Utc::now(),
        };
        (executor, store, workspace)
    }

    #[tokio::test]
    async fn test_echo_hi() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, ws) = setup(dir.path());

        let result = executor
            .execute(
                &ws,
                ExecutionRequest::new("echo hi").with_timeout(Duration::from_secs(5)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, b"hi\n");
        assert!(result.stderr.is_empty());
        assert_eq!(result.exit_code, 0);

        let history = store.list_commands(ws.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "echo hi");
        assert_eq!(history[0].output, "hi\n");
    }

    #[tokio::test]
    async fn test_cwd_is_confined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (executor, _, ws) = setup(dir.path());
        let cancel = CancellationToken::new();

        let result = executor
            .execute(&ws, ExecutionRequest::new("pwd").with_cwd("sub"), None, &cancel)
            .await
            .unwrap();
        assert!(result.stdout_str().trim_end().ends_with("/sub"));

        let err = executor
            .execute(&ws, ExecutionRequest::new("pwd").with_cwd("../.."), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);

        let err = executor
            .execute(&ws, ExecutionRequest::new("pwd").with_cwd("missing"), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_data() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, ws) = setup(dir.path());

        let started = Instant::now();
        let result = executor
            .execute(
                &ws,
                ExecutionRequest::new("echo before; sleep 20").with_timeout(Duration::from_millis(300)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout_str(), "before\n");
        assert!(started.elapsed() < Duration::from_secs(3));

        let history = store.list_commands(ws.id, 1).await.unwrap();
        assert!(history[0].timed_out);
    }

    #[tokio::test]
    async fn test_busy_workspace_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _, mut ws) = setup(dir.path());
        ws.config.concurrent_commands = 1;
        let executor = Arc::new(executor);

        let cancel = CancellationToken::new();
        let first = {
            let executor = executor.clone();
            let ws = ws.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .execute(&ws, ExecutionRequest::new("sleep 5"), None, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = executor
            .execute(&ws, ExecutionRequest::new("echo second"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxBusy);

        cancel.cancel();
        let first = first.await.unwrap().unwrap();
        assert!(first.cancelled);

        // the slot is free again
        executor
            .execute(&ws, ExecutionRequest::new("true"), None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_policy_rejects_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, mut ws) = setup(dir.path());
        ws.config.allowed_binaries = Some(vec!["echo".into(), "ls".into()]);

        let err = executor
            .execute(
                &ws,
                ExecutionRequest::new("touch pwned"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(!dir.path().join("pwned").exists());
        assert!(store.list_commands(ws.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unready_workspace_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _, mut ws) = setup(dir.path());
        ws.status = WorkspaceStatus::Provisioning;

        let err = executor
            .execute(&ws, ExecutionRequest::new("true"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxUnavailable);

        ws.status = WorkspaceStatus::Ready;
        ws.root = dir.path().join("vanished");
        let err = executor
            .execute(&ws, ExecutionRequest::new("true"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxUnavailable);
    }

    #[tokio::test]
    async fn test_streaming_sink_sees_output_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _, ws) = setup(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = executor
            .execute(
                &ws,
                ExecutionRequest::new("echo one; sleep 0.1; echo two"),
                Some(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut streamed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            if let OutputChunk::Stdout(bytes) = chunk {
                streamed.extend(bytes);
            }
        }
        assert_eq!(streamed, result.stdout);
        assert_eq!(result.stdout_str(), "one\ntwo\n");
    }

    #[test]
    fn test_request_wire_format() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"command": "ls", "cwd": "src", "timeout_ms": 1500}"#).unwrap();
        assert_eq!(request.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(request.cwd.as_deref(), Some("src"));
    }
}
