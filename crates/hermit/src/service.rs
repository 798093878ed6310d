//! The [`Hermit`] facade: every operation a remote caller can invoke, with
//! ownership checks in front.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentLoop, AgentMode, AgentOutcome, AgentSource, AgentTaskRecord, DecisionCollaborator,
    TaskSummary,
};
use crate::config::HermitConfig;
use crate::error::SandboxError;
use crate::executor::{ExecutionRequest, ExecutionResult, SandboxExecutor};
use crate::fs::{BatchResult, DirEntry, FileOperation, FileStat, FileStore};
use crate::store::{ShellCommandRecord, Store};
use crate::stream::{CommandSource, EventChannel, StreamBroker, WorkspaceSubscription};
use crate::workspace::{
    Principal, TaskId, Workspace, WorkspaceConfig, WorkspaceId, WorkspaceStatus,
};

/// A request to start an agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// What the agent should do.
    pub prompt: String,
    /// Interaction mode.
    #[serde(default = "default_mode")]
    pub mode: AgentMode,
    /// Model id forwarded to the decision collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_mode() -> AgentMode {
    AgentMode::Interactive
}

impl AgentRequest {
    /// An interactive request.
    pub fn interactive(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: AgentMode::Interactive,
            model: None,
        }
    }

    /// An autonomous request with the given iteration ceiling.
    pub fn autonomous(prompt: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            prompt: prompt.into(),
            mode: AgentMode::Autonomous { max_iterations },
            model: None,
        }
    }
}

/// Workspace sandboxes, their commands, files and agents.
#[derive(Debug)]
pub struct Hermit {
    store: Arc<dyn Store>,
    executor: Arc<SandboxExecutor>,
    files: FileStore,
    agent: Arc<AgentLoop>,
    broker: StreamBroker,
    data_dir: PathBuf,
    workspace_defaults: WorkspaceConfig,
    poll_interval: Duration,
}

impl Hermit {
    /// Wire up the core from configuration and the two collaborators.
    pub fn new(
        config: &HermitConfig,
        store: Arc<dyn Store>,
        decider: Arc<dyn DecisionCollaborator>,
    ) -> Self {
        let guest_root = config.sandbox.guest_root.clone();
        let executor = Arc::new(
            SandboxExecutor::new(config.launcher(), store.clone(), &guest_root)
                .with_term_grace(config.sandbox.term_grace),
        );
        let files = FileStore::new(&guest_root);
        let agent = Arc::new(AgentLoop::new(
            executor.clone(),
            files.clone(),
            store.clone(),
            decider,
            config.agent_config(),
        ));
        Self {
            store,
            executor,
            files,
            agent,
            broker: StreamBroker::new(config.broker_config()),
            data_dir: config.sandbox.data_dir.clone(),
            workspace_defaults: config.workspace_config(),
            poll_interval: config.stream.poll_interval,
        }
    }

    /// The persistence collaborator.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Provision a new workspace owned by `principal`.
    pub async fn create_workspace(
        &self,
        principal: &Principal,
        config: Option<WorkspaceConfig>,
    ) -> Result<Workspace, SandboxError> {
        let config = config.unwrap_or_else(|| self.workspace_defaults.clone());
        let mut workspace = Workspace::new(principal.id.clone(), PathBuf::new(), config);
        workspace.root = self.data_dir.join(workspace.id.to_string());
        self.store.insert_workspace(workspace.clone()).await?;

        if let Err(e) = tokio::fs::create_dir_all(&workspace.root).await {
            tracing::error!(workspace = %workspace.id, "failed to provision workspace root: {}", e);
            self.store
                .set_workspace_status(workspace.id, WorkspaceStatus::Terminated)
                .await?;
            return Err(SandboxError::SandboxUnavailable(format!(
                "provisioning workspace {} failed",
                workspace.id
            )));
        }
        self.store
            .set_workspace_status(workspace.id, WorkspaceStatus::Ready)
            .await?;
        workspace.status = WorkspaceStatus::Ready;
        tracing::info!(workspace = %workspace.id, owner = %principal.id, "workspace ready");
        Ok(workspace)
    }

    /// Terminate a workspace: stop its agents, refuse further work and remove
    /// its files. Terminating twice succeeds.
    pub async fn terminate_workspace(
        &self,
        principal: &Principal,
        id: WorkspaceId,
    ) -> Result<(), SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.store
            .set_workspace_status(id, WorkspaceStatus::Terminated)
            .await?;
        self.agent.cancel_workspace(id);
        self.executor.forget_workspace(id);
        match tokio::fs::remove_dir_all(&workspace.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(workspace = %id, "failed to remove workspace root: {}", e),
        }
        tracing::info!(workspace = %id, "workspace terminated");
        Ok(())
    }

    /// Look up a workspace the caller owns. Missing and foreign workspaces are
    /// indistinguishable.
    pub async fn workspace(
        &self,
        principal: &Principal,
        id: WorkspaceId,
    ) -> Result<Workspace, SandboxError> {
        match self.store.get_workspace(id).await? {
            Some(workspace) if workspace.is_owned_by(principal) => Ok(workspace),
            Some(_) => {
                tracing::debug!(workspace = %id, principal = %principal.id, "foreign workspace");
                Err(SandboxError::NotFound("workspace".into()))
            }
            None => Err(SandboxError::NotFound("workspace".into())),
        }
    }

    async fn ready_workspace(
        &self,
        principal: &Principal,
        id: WorkspaceId,
    ) -> Result<Workspace, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        if !workspace.is_ready() {
            return Err(SandboxError::SandboxUnavailable(format!(
                "workspace {id} is {:?}",
                workspace.status
            )));
        }
        Ok(workspace)
    }

    /// Run a command and wait for its result.
    pub async fn run_command(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.executor.execute(&workspace, request, None, cancel).await
    }

    /// Run a command, streaming its output. Dropping the channel kills it.
    pub async fn stream_command(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: ExecutionRequest,
    ) -> Result<EventChannel, SandboxError> {
        let workspace = self.ready_workspace(principal, id).await?;
        if request.command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("command is empty".into()));
        }
        Ok(self.broker.open(CommandSource::new(
            self.executor.clone(),
            workspace,
            request,
        )))
    }

    /// Recent commands, newest first.
    pub async fn command_history(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        limit: usize,
    ) -> Result<Vec<ShellCommandRecord>, SandboxError> {
        self.workspace(principal, id).await?;
        Ok(self.store.list_commands(id, limit).await?)
    }

    /// Read a file.
    pub async fn read_file(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        path: &str,
    ) -> Result<Vec<u8>, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.files.read(&workspace, path).await
    }

    /// Create or replace a file. Returns the bytes written.
    pub async fn write_file(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        path: &str,
        content: &[u8],
    ) -> Result<u64, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.files.write(&workspace, path, content).await
    }

    /// Delete a file or directory tree. Deleting a missing path succeeds.
    pub async fn delete_file(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        path: &str,
    ) -> Result<(), SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.files.delete(&workspace, path).await
    }

    /// List a directory.
    pub async fn list_dir(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        path: &str,
    ) -> Result<Vec<DirEntry>, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.files.list(&workspace, path).await
    }

    /// Metadata for a path.
    pub async fn stat(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        path: &str,
    ) -> Result<FileStat, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        self.files.stat(&workspace, path).await
    }

    /// Apply file operations independently.
    pub async fn apply_batch(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        ops: &[FileOperation],
    ) -> Result<BatchResult, SandboxError> {
        let workspace = self.workspace(principal, id).await?;
        Ok(self.files.apply_batch(&workspace, ops).await)
    }

    async fn new_task(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: AgentRequest,
    ) -> Result<(Workspace, AgentTaskRecord), SandboxError> {
        let workspace = self.ready_workspace(principal, id).await?;
        if request.prompt.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("prompt is empty".into()));
        }
        let task = AgentTaskRecord::new(
            id,
            principal.id.clone(),
            request.prompt,
            request.mode,
            request.model,
        );
        self.store.insert_task(task.clone()).await?;
        tracing::info!(task = %task.id, workspace = %id, mode = %task.mode, "agent task created");
        Ok((workspace, task))
    }

    /// Start an agent run and stream its updates. Dropping the channel
    /// cancels the run.
    pub async fn run_agent(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: AgentRequest,
    ) -> Result<EventChannel, SandboxError> {
        let (workspace, task) = self.new_task(principal, id, request).await?;
        Ok(self
            .broker
            .open(AgentSource::new(self.agent.clone(), workspace, task)))
    }

    /// Start an agent run in the background and return its task id.
    ///
    /// Progress is persisted; follow it with [`Hermit::subscribe`] or
    /// [`Hermit::agent_task`].
    pub async fn spawn_agent(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: AgentRequest,
    ) -> Result<TaskId, SandboxError> {
        let (workspace, task) = self.new_task(principal, id, request).await?;
        let task_id = task.id;
        let agent = self.agent.clone();
        tokio::spawn(async move {
            let outcome: AgentOutcome = agent
                .run(&workspace, &task, None, CancellationToken::new())
                .await;
            tracing::debug!(
                task = %outcome.task_id,
                state = ?outcome.state,
                "background agent finished"
            );
        });
        Ok(task_id)
    }

    /// Run an agent to completion in the caller's task.
    pub async fn run_agent_to_completion(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, SandboxError> {
        let (workspace, task) = self.new_task(principal, id, request).await?;
        Ok(self.agent.run(&workspace, &task, None, cancel).await)
    }

    /// A task with all of its updates.
    pub async fn agent_task(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        task: TaskId,
    ) -> Result<AgentTaskRecord, SandboxError> {
        self.workspace(principal, id).await?;
        match self.store.get_task(task).await? {
            Some(record) if record.workspace_id == id => Ok(record),
            _ => Err(SandboxError::NotFound("task".into())),
        }
    }

    /// Summaries of a workspace's tasks, oldest first.
    pub async fn agent_tasks(
        &self,
        principal: &Principal,
        id: WorkspaceId,
    ) -> Result<Vec<TaskSummary>, SandboxError> {
        self.workspace(principal, id).await?;
        Ok(self.store.list_tasks(id).await?)
    }

    /// Cancel a task. Cancelling a finished task succeeds and changes nothing.
    pub async fn cancel_agent(
        &self,
        principal: &Principal,
        id: WorkspaceId,
        task: TaskId,
    ) -> Result<(), SandboxError> {
        let record = self.agent_task(principal, id, task).await?;
        if self.agent.cancel(task) {
            tracing::info!(task = %task, "agent task cancelled");
        } else if record.state.is_active() {
            tracing::debug!(task = %task, "cancel requested for a task that is not running here");
        }
        Ok(())
    }

    /// Live updates of the workspace's background agent tasks.
    pub async fn subscribe(
        &self,
        principal: &Principal,
        id: WorkspaceId,
    ) -> Result<EventChannel, SandboxError> {
        self.workspace(principal, id).await?;
        Ok(self.broker.open(WorkspaceSubscription::new(
            self.store.clone(),
            id,
            self.poll_interval,
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::ScriptedDecider;
    use crate::store::InMemoryStore;

    fn hermit(dir: &std::path::Path) -> Hermit {
        let mut config = HermitConfig::default();
        config.sandbox.data_dir = dir.to_path_buf();
        Hermit::new(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedDecider::default()),
        )
    }

    #[tokio::test]
    async fn test_workspace_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let hermit = hermit(dir.path());
        let alice = Principal::new("alice");

        let ws = hermit.create_workspace(&alice, None).await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Ready);
        assert!(ws.root.is_dir());

        hermit.terminate_workspace(&alice, ws.id).await.unwrap();
        assert!(!ws.root.exists());
        let err = hermit
            .run_command(&alice, ws.id, ExecutionRequest::new("true"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxUnavailable(_)));
        hermit.terminate_workspace(&alice, ws.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_workspace_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let hermit = hermit(dir.path());
        let ws = hermit
            .create_workspace(&Principal::new("alice"), None)
            .await
            .unwrap();

        let mallory = Principal::new("mallory");
        let err = hermit.read_file(&mallory, ws.id, "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        let err = hermit
            .terminate_workspace(&mallory, ws.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        let err = hermit
            .workspace(&mallory, WorkspaceId::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_public().message, "workspace not found");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hermit = hermit(dir.path());
        let alice = Principal::new("alice");
        let ws = hermit.create_workspace(&alice, None).await.unwrap();
        let err = hermit
            .spawn_agent(&alice, ws.id, AgentRequest::interactive("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }
}
