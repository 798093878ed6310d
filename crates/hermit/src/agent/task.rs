//! Agent task records, modes and lifecycle states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PublicError;
use crate::event::RecordedUpdate;
use crate::workspace::{TaskId, WorkspaceId};

fn default_max_iterations() -> u32 {
    50
}

/// How an agent run interacts with its caller, and when it must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMode {
    /// One user turn: every update is streamed as it happens, small
    /// iteration ceiling.
    Interactive,
    /// Runs on its own: narration may be batched, much larger ceiling.
    Autonomous {
        /// Tool dispatches allowed before the run is aborted.
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
}

impl AgentMode {
    /// Autonomous mode with the default ceiling.
    pub fn autonomous() -> Self {
        AgentMode::Autonomous {
            max_iterations: default_max_iterations(),
        }
    }

    /// Whether this is autonomous mode.
    pub fn is_autonomous(&self) -> bool {
        matches!(self, AgentMode::Autonomous { .. })
    }

    /// The termination policy for this mode under `config`.
    ///
    /// A requested autonomous ceiling is honoured but never exceeds the
    /// configured one.
    pub fn limits(&self, config: &AgentLimitsConfig) -> AgentLimits {
        match self {
            AgentMode::Interactive => AgentLimits {
                max_iterations: config.interactive_max_iterations.max(1),
                max_wall_time: config.interactive_max_wall_time,
            },
            AgentMode::Autonomous { max_iterations } => AgentLimits {
                max_iterations: (*max_iterations)
                    .clamp(1, config.autonomous_max_iterations.max(1)),
                max_wall_time: config.autonomous_max_wall_time,
            },
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Interactive => f.write_str("interactive"),
            AgentMode::Autonomous { .. } => f.write_str("autonomous"),
        }
    }
}

/// Ceilings that guarantee a run terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLimits {
    /// Planning rounds before the run is aborted.
    pub max_iterations: u32,
    /// Wall-clock budget; `None` means unbounded.
    pub max_wall_time: Option<Duration>,
}

/// Configured ceilings per mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLimitsConfig {
    /// Iteration ceiling for interactive runs.
    pub interactive_max_iterations: u32,
    /// Upper bound for autonomous iteration ceilings.
    pub autonomous_max_iterations: u32,
    /// Wall-clock budget for interactive runs.
    pub interactive_max_wall_time: Option<Duration>,
    /// Wall-clock budget for autonomous runs.
    pub autonomous_max_wall_time: Option<Duration>,
}

impl Default for AgentLimitsConfig {
    fn default() -> Self {
        Self {
            interactive_max_iterations: 10,
            autonomous_max_iterations: 50,
            interactive_max_wall_time: None,
            autonomous_max_wall_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

/// Lifecycle of an agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not started yet.
    Pending,
    /// The loop is driving it.
    Running,
    /// The decision collaborator produced a final answer.
    Done,
    /// A tool failed in a way retrying cannot fix.
    Failed,
    /// A ceiling was hit.
    Aborted,
    /// The caller cancelled it.
    Cancelled,
}

impl TaskState {
    /// Whether the task may still produce updates.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// A running or completed agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskRecord {
    /// Task id.
    pub id: TaskId,
    /// Workspace the task acts on.
    pub workspace_id: WorkspaceId,
    /// Principal that started it.
    pub owner_id: String,
    /// The task prompt.
    pub prompt: String,
    /// Interaction mode.
    pub mode: AgentMode,
    /// Model identifier passed to the decision collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Every update, in order.
    #[serde(default)]
    pub updates: Vec<RecordedUpdate>,
    /// Final answer, when done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Why it stopped, when not done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PublicError>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When it reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentTaskRecord {
    /// A fresh pending task.
    pub fn new(
        workspace_id: WorkspaceId,
        owner_id: impl Into<String>,
        prompt: impl Into<String>,
        mode: AgentMode,
        model: Option<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            workspace_id,
            owner_id: owner_id.into(),
            prompt: prompt.into(),
            mode,
            model,
            state: TaskState::Pending,
            updates: Vec::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// The record without its updates.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            workspace_id: self.workspace_id,
            prompt: self.prompt.clone(),
            mode: self.mode,
            state: self.state,
            update_count: self.updates.len(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// A task listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task id.
    pub id: TaskId,
    /// Workspace.
    pub workspace_id: WorkspaceId,
    /// The prompt.
    pub prompt: String,
    /// Interaction mode.
    pub mode: AgentMode,
    /// Lifecycle state.
    pub state: TaskState,
    /// Number of persisted updates.
    pub update_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_limits() {
        let config = AgentLimitsConfig::default();
        let interactive = AgentMode::Interactive.limits(&config);
        assert_eq!(interactive.max_iterations, 10);
        assert_eq!(interactive.max_wall_time, None);

        let autonomous = AgentMode::Autonomous { max_iterations: 3 }.limits(&config);
        assert_eq!(autonomous.max_iterations, 3);
        assert_eq!(autonomous.max_wall_time, Some(Duration::from_secs(900)));

        let greedy = AgentMode::Autonomous {
            max_iterations: 10_000,
        }
        .limits(&config);
        assert_eq!(greedy.max_iterations, 50);

        let zero = AgentMode::Autonomous { max_iterations: 0 }.limits(&config);
        assert_eq!(zero.max_iterations, 1);
    }

    #[test]
    fn test_mode_wire_format() {
        let mode: AgentMode = serde_json::from_str(r#"{"type": "autonomous"}"#).unwrap();
        assert_eq!(mode, AgentMode::autonomous());
        let mode: AgentMode = serde_json::from_str(r#"{"type": "interactive"}"#).unwrap();
        assert_eq!(mode, AgentMode::Interactive);
        assert_eq!(
            serde_json::to_value(AgentMode::Autonomous { max_iterations: 7 }).unwrap(),
            serde_json::json!({"type": "autonomous", "max_iterations": 7})
        );
    }

    #[test]
    fn test_active_states() {
        assert!(TaskState::Pending.is_active());
        assert!(TaskState::Running.is_active());
        for state in [
            TaskState::Done,
            TaskState::Failed,
            TaskState::Aborted,
            TaskState::Cancelled,
        ] {
            assert!(!state.is_active());
        }
    }
}
