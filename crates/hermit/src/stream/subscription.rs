use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Emitter, EventSource};
use crate::event::{AgentUpdate, SourceKind};
use crate::store::Store;
use crate::workspace::{TaskId, WorkspaceId, WorkspaceStatus};

/// Live view of a workspace's background agent tasks.
///
/// Polls the store on a fixed interval and relays every update newly
/// persisted by a task that was running while the subscription was open.
/// Ends with `complete` once the workspace is terminated.
#[derive(Debug)]
pub struct WorkspaceSubscription {
    store: Arc<dyn Store>,
    workspace: WorkspaceId,
    poll_interval: Duration,
}

impl WorkspaceSubscription {
    /// Subscribe to `workspace`, polling every `poll_interval`.
    pub fn new(store: Arc<dyn Store>, workspace: WorkspaceId, poll_interval: Duration) -> Self {
        Self {
            store,
            workspace,
            poll_interval,
        }
    }

    /// One polling pass. Returns false when the workspace is gone.
    async fn poll(
        &self,
        emitter: &Emitter,
        cursors: &mut HashMap<TaskId, u64>,
        opened_at: chrono::DateTime<Utc>,
    ) -> bool {
        match self.store.get_workspace(self.workspace).await {
            Ok(Some(ws)) if ws.status != WorkspaceStatus::Terminated => {}
            Ok(_) => return false,
            Err(e) => {
                tracing::warn!(workspace = %self.workspace, "subscription poll failed: {}", e);
                return true;
            }
        }

        let tasks = match self.store.list_tasks(self.workspace).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(workspace = %self.workspace, "subscription poll failed: {}", e);
                return true;
            }
        };

        for task in tasks {
            let tracked = cursors.contains_key(&task.id);
            if !tracked && !task.state.is_active() && task.created_at < opened_at {
                continue;
            }
            let cursor = cursors.entry(task.id).or_insert(0);
            let updates = match self.store.updates_since(task.id, *cursor).await {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!(task = %task.id, "reading task updates failed: {}", e);
                    continue;
                }
            };
            for recorded in updates {
                *cursor = recorded.seq + 1;
                if emitter.relay(task.id, recorded.update).await.is_err() {
                    return false;
                }
            }
            if !task.state.is_active() {
                // Everything up to the terminal update has been relayed.
                cursors.insert(task.id, u64::MAX);
            }
        }
        true
    }
}

#[async_trait]
impl EventSource for WorkspaceSubscription {
    fn kind(&self) -> SourceKind {
        SourceKind::Subscription
    }

    fn heartbeats(&self) -> bool {
        true
    }

    async fn run(self: Box<Self>, emitter: Emitter, cancel: CancellationToken) {
        let opened_at = Utc::now();
        let start = AgentUpdate::Start {
            source: SourceKind::Subscription,
            detail: json!({ "workspace_id": self.workspace }),
        };
        if emitter.emit(start).await.is_err() {
            return;
        }

        let mut cursors: HashMap<TaskId, u64> = HashMap::new();
        let mut interval = tokio::time::interval(self.poll_interval.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if !self.poll(&emitter, &mut cursors, opened_at).await {
                break;
            }
        }

        if !emitter.is_closed() {
            let _ = emitter
                .emit(AgentUpdate::Complete {
                    result: json!({ "reason": "workspace terminated" }),
                })
                .await;
        }
    }
}
