//! Persistence collaborator.
//!
//! The core only needs keyed inserts and reads over workspaces, shell command
//! records and agent tasks. [`Store`] captures exactly that; [`InMemoryStore`]
//! is the implementation used by the bundled binaries and the tests.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::{AgentTaskRecord, TaskState, TaskSummary};
use crate::error::{PersistenceError, PublicError};
use crate::event::{AgentUpdate, RecordedUpdate};
use crate::workspace::{TaskId, Workspace, WorkspaceId, WorkspaceStatus};

/// Append-only audit record of one command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCommandRecord {
    /// Record id.
    pub id: Uuid,
    /// Workspace the command ran in.
    pub workspace_id: WorkspaceId,
    /// The command line as submitted.
    pub command: String,
    /// Guest working directory.
    pub cwd: String,
    /// Stdout followed by stderr (lossy UTF-8).
    pub output: String,
    /// Exit code (124 on timeout).
    pub exit_code: i32,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Killed at its deadline.
    pub timed_out: bool,
    /// Killed because the caller went away.
    pub cancelled: bool,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
    /// When the result was assembled.
    pub finished_at: DateTime<Utc>,
}

/// Keyed storage for workspace, command and task rows.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Insert a new workspace row.
    async fn insert_workspace(&self, workspace: Workspace) -> Result<(), PersistenceError>;

    /// Fetch a workspace by id.
    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, PersistenceError>;

    /// Change a workspace's lifecycle status.
    async fn set_workspace_status(
        &self,
        id: WorkspaceId,
        status: WorkspaceStatus,
    ) -> Result<(), PersistenceError>;

    /// Append a command record.
    async fn insert_command(&self, record: ShellCommandRecord) -> Result<(), PersistenceError>;

    /// The most recent command records of a workspace, newest first.
    async fn list_commands(
        &self,
        workspace: WorkspaceId,
        limit: usize,
    ) -> Result<Vec<ShellCommandRecord>, PersistenceError>;

    /// Insert a new agent task row.
    async fn insert_task(&self, task: AgentTaskRecord) -> Result<(), PersistenceError>;

    /// Append an update to a task, returning its sequence number.
    async fn append_update(
        &self,
        task: TaskId,
        update: AgentUpdate,
    ) -> Result<u64, PersistenceError>;

    /// Updates of a task with `seq >= from`, in order.
    async fn updates_since(
        &self,
        task: TaskId,
        from: u64,
    ) -> Result<Vec<RecordedUpdate>, PersistenceError>;

    /// Record a task's state; terminal states also stamp `finished_at`.
    async fn finish_task(
        &self,
        task: TaskId,
        state: TaskState,
        result: Option<String>,
        error: Option<PublicError>,
    ) -> Result<(), PersistenceError>;

    /// Fetch a task with all of its updates.
    async fn get_task(&self, task: TaskId) -> Result<Option<AgentTaskRecord>, PersistenceError>;

    /// Summaries of a workspace's tasks, oldest first.
    async fn list_tasks(&self, workspace: WorkspaceId)
    -> Result<Vec<TaskSummary>, PersistenceError>;
}

#[derive(Default)]
struct Tables {
    workspaces: HashMap<WorkspaceId, Workspace>,
    commands: HashMap<WorkspaceId, Vec<ShellCommandRecord>>,
    tasks: HashMap<TaskId, AgentTaskRecord>,
}

/// A [`Store`] that keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_task(task: TaskId) -> PersistenceError {
    PersistenceError::NotFound(format!("task {task}"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_workspace(&self, workspace: Workspace) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        if tables.workspaces.contains_key(&workspace.id) {
            return Err(PersistenceError::Backend(format!(
                "duplicate workspace {}",
                workspace.id
            )));
        }
        tables.workspaces.insert(workspace.id, workspace);
        Ok(())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, PersistenceError> {
        Ok(self.tables.read().await.workspaces.get(&id).cloned())
    }

    async fn set_workspace_status(
        &self,
        id: WorkspaceId,
        status: WorkspaceStatus,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        let workspace = tables
            .workspaces
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound(format!("workspace {id}")))?;
        workspace.status = status;
        Ok(())
    }

    async fn insert_command(&self, record: ShellCommandRecord) -> Result<(), PersistenceError> {
        self.tables
            .write()
            .await
            .commands
            .entry(record.workspace_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn list_commands(
        &self,
        workspace: WorkspaceId,
        limit: usize,
    ) -> Result<Vec<ShellCommandRecord>, PersistenceError> {
        let tables = self.tables.read().await;
        Ok(tables
            .commands
            .get(&workspace)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_task(&self, task: AgentTaskRecord) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(PersistenceError::Backend(format!("duplicate task {}", task.id)));
        }
        tables.tasks.insert(task.id, task);
        Ok(())
    }

    async fn append_update(
        &self,
        task: TaskId,
        update: AgentUpdate,
    ) -> Result<u64, PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables.tasks.get_mut(&task).ok_or_else(|| missing_task(task))?;
        let seq = record.updates.len() as u64;
        record.updates.push(RecordedUpdate {
            seq,
            at: Utc::now(),
            update,
        });
        Ok(seq)
    }

    async fn updates_since(
        &self,
        task: TaskId,
        from: u64,
    ) -> Result<Vec<RecordedUpdate>, PersistenceError> {
        let tables = self.tables.read().await;
        let record = tables.tasks.get(&task).ok_or_else(|| missing_task(task))?;
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        Ok(record.updates.iter().skip(start).cloned().collect())
    }

    async fn finish_task(
        &self,
        task: TaskId,
        state: TaskState,
        result: Option<String>,
        error: Option<PublicError>,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables.tasks.get_mut(&task).ok_or_else(|| missing_task(task))?;
        record.state = state;
        record.result = result;
        record.error = error;
        record.finished_at = (!state.is_active()).then(Utc::now);
        Ok(())
    }

    async fn get_task(&self, task: TaskId) -> Result<Option<AgentTaskRecord>, PersistenceError> {
        Ok(self.tables.read().await.tasks.get(&task).cloned())
    }

    async fn list_tasks(
        &self,
        workspace: WorkspaceId,
    ) -> Result<Vec<TaskSummary>, PersistenceError> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<TaskSummary> = tables
            .tasks
            .values()
            .filter(|t| t.workspace_id == workspace)
            .map(AgentTaskRecord::summary)
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::agent::AgentMode;
    use crate::workspace::WorkspaceConfig;

    fn workspace() -> Workspace {
        Workspace {
            id: WorkspaceId::new(),
            owner_id: "alice".into(),
            root: PathBuf::from("/tmp/ws"),
            status: WorkspaceStatus::Provisioning,
            config: WorkspaceConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn record(workspace_id: WorkspaceId, command: &str) -> ShellCommandRecord {
        let now = Utc::now();
        ShellCommandRecord {
            id: Uuid::new_v4(),
            workspace_id,
            command: command.into(),
            cwd: "/workspace".into(),
            output: String::new(),
            exit_code: 0,
            duration_ms: 1,
            timed_out: false,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn test_workspace_rows() {
        let store = InMemoryStore::new();
        let ws = workspace();
        store.insert_workspace(ws.clone()).await.unwrap();
        assert!(store.insert_workspace(ws.clone()).await.is_err());

        store
            .set_workspace_status(ws.id, WorkspaceStatus::Ready)
            .await
            .unwrap();
        let fetched = store.get_workspace(ws.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkspaceStatus::Ready);
        assert!(store.get_workspace(WorkspaceId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_command_history_is_newest_first() {
        let store = InMemoryStore::new();
        let ws = WorkspaceId::new();
        for cmd in ["one", "two", "three"] {
            store.insert_command(record(ws, cmd)).await.unwrap();
        }
        let recent = store.list_commands(ws, 2).await.unwrap();
        let commands: Vec<_> = recent.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["three", "two"]);
        assert!(store.list_commands(WorkspaceId::new(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_updates_are_sequenced() {
        let store = InMemoryStore::new();
        let task = AgentTaskRecord::new(
            WorkspaceId::new(),
            "alice",
            "do things",
            AgentMode::Interactive,
            None,
        );
        let id = task.id;
        store.insert_task(task).await.unwrap();

        for data in ["a", "b", "c"] {
            store
                .append_update(id, AgentUpdate::Stdout { data: data.into() })
                .await
                .unwrap();
        }
        let tail = store.updates_since(id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 1);
        assert_eq!(tail[1].seq, 2);

        store
            .finish_task(id, TaskState::Done, Some("ok".into()), None)
            .await
            .unwrap();
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Done);
        assert!(record.finished_at.is_some());
        assert_eq!(record.updates.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = InMemoryStore::new();
        let err = store
            .append_update(TaskId::new(), AgentUpdate::heartbeat())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
