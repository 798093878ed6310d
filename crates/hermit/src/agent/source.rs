use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::runner::AgentLoop;
use super::task::AgentTaskRecord;
use crate::event::SourceKind;
use crate::stream::{Emitter, EventSource};
use crate::workspace::Workspace;

/// Streams one agent run over an event channel.
///
/// Every update is tagged with the task id. Dropping the channel cancels the
/// run, including any command it is executing.
#[derive(Debug)]
pub struct AgentSource {
    agent: Arc<AgentLoop>,
    workspace: Workspace,
    task: AgentTaskRecord,
}

impl AgentSource {
    /// Run `task` (already persisted) in `workspace` when the channel opens.
    pub fn new(agent: Arc<AgentLoop>, workspace: Workspace, task: AgentTaskRecord) -> Self {
        Self {
            agent,
            workspace,
            task,
        }
    }
}

#[async_trait]
impl EventSource for AgentSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Agent
    }

    fn heartbeats(&self) -> bool {
        true
    }

    async fn run(self: Box<Self>, emitter: Emitter, cancel: CancellationToken) {
        let emitter = emitter.for_task(self.task.id);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Cancelling only the run must leave the channel open for its final update.
        let run_cancel = cancel.child_token();
        let run = self
            .agent
            .run(&self.workspace, &self.task, Some(tx), run_cancel.clone());
        let forward = async {
            while let Some(update) = rx.recv().await {
                if emitter.emit(update).await.is_err() {
                    // Consumer gone: stop the run, keep draining so it can finish.
                    run_cancel.cancel();
                }
            }
        };
        let (outcome, ()) = tokio::join!(run, forward);
        tracing::debug!(task = %outcome.task_id, state = ?outcome.state, "agent stream finished");
    }
}
