//! The decision collaborator contract and test doubles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::transcript::Transcript;
use crate::error::DecisionError;
use crate::fs::{FileAction, FileOperation};

/// A tool the agent can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    /// Run a shell command in the workspace.
    Shell {
        /// Command line.
        command: String,
        /// Guest working directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Timeout in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Read, write, delete or list a path.
    FileOp(FileOperation),
}

impl ToolCall {
    /// A shell call with default cwd and timeout.
    pub fn shell(command: impl Into<String>) -> Self {
        ToolCall::Shell {
            command: command.into(),
            cwd: None,
            timeout_ms: None,
        }
    }

    /// Tool name, as it appears in transcripts.
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Shell { .. } => "shell",
            ToolCall::FileOp(_) => "file_op",
        }
    }

    /// Reject calls that cannot possibly be carried out.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ToolCall::Shell { command, .. } if command.trim().is_empty() => {
                Err("shell command is empty".to_string())
            }
            ToolCall::FileOp(FileOperation {
                action: FileAction::Write,
                content: None,
                ..
            }) => Err("write requires content".to_string()),
            ToolCall::FileOp(FileOperation {
                action: FileAction::Read | FileAction::Write | FileAction::Delete,
                path,
                ..
            }) if path.trim().is_empty() => Err("file operation requires a path".to_string()),
            _ => Ok(()),
        }
    }

    /// Parameters as JSON, without the tool tag.
    pub fn params(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("tool");
        }
        value
    }
}

/// What the decision collaborator wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Invoke a tool.
    ToolCall {
        /// The invocation.
        call: ToolCall,
        /// Narration accompanying it.
        thought: Option<String>,
    },
    /// The task is complete.
    FinalAnswer(String),
    /// The collaborator answered something that is not a usable decision.
    Invalid {
        /// What it said.
        raw: String,
        /// Why it cannot be used.
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDecision {
    ToolCall {
        call: ToolCall,
        #[serde(default)]
        thought: Option<String>,
    },
    FinalAnswer {
        answer: String,
    },
}

impl Decision {
    /// A tool call without narration.
    pub fn tool(call: ToolCall) -> Self {
        Decision::ToolCall {
            call,
            thought: None,
        }
    }

    /// Interpret a JSON reply:
    /// `{"type": "tool_call", "call": {"tool": "shell", ...}, "thought": "..."}` or
    /// `{"type": "final_answer", "answer": "..."}`. Anything else is
    /// [`Decision::Invalid`].
    pub fn from_json(raw: &str) -> Self {
        match serde_json::from_str::<WireDecision>(raw) {
            Ok(WireDecision::ToolCall { call, thought }) => Decision::ToolCall { call, thought },
            Ok(WireDecision::FinalAnswer { answer }) => Decision::FinalAnswer(answer),
            Err(e) => Decision::Invalid {
                raw: raw.chars().take(2000).collect(),
                reason: e.to_string(),
            },
        }
    }
}

/// Decides the agent's next action from the transcript so far.
///
/// Treated as slow and occasionally wrong: errors and [`Decision::Invalid`]
/// answers become failed observations, not crashes.
#[async_trait]
pub trait DecisionCollaborator: Send + Sync + fmt::Debug {
    /// Produce the next decision.
    async fn next_action(&self, transcript: &Transcript) -> Result<Decision, DecisionError>;
}

/// Replays a fixed list of decisions, then gives a final answer.
#[derive(Debug, Default)]
pub struct ScriptedDecider {
    script: Mutex<VecDeque<Result<Decision, DecisionError>>>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedDecider {
    /// Replay `decisions` in order.
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            script: Mutex::new(decisions.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Append a collaborator failure to the script.
    pub fn then_fail(self, error: DecisionError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
        self
    }

    /// Transcript lengths seen on each call, for assertions.
    pub fn observed_transcript_lengths(&self) -> Vec<usize> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DecisionCollaborator for ScriptedDecider {
    async fn next_action(&self, transcript: &Transcript) -> Result<Decision, DecisionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(transcript.len());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(Decision::FinalAnswer("done".to_string())))
    }
}

/// Never finishes: always asks for another shell command.
#[derive(Debug, Clone)]
pub struct LoopingDecider {
    command: String,
}

impl LoopingDecider {
    /// Keep asking to run `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl DecisionCollaborator for LoopingDecider {
    async fn next_action(&self, _transcript: &Transcript) -> Result<Decision, DecisionError> {
        Ok(Decision::tool(ToolCall::shell(self.command.clone())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_wire_format() {
        let call: ToolCall =
            serde_json::from_str(r#"{"tool": "shell", "command": "ls", "timeout_ms": 500}"#).unwrap();
        assert_eq!(
            call,
            ToolCall::Shell {
                command: "ls".into(),
                cwd: None,
                timeout_ms: Some(500)
            }
        );

        let call: ToolCall = serde_json::from_str(
            r#"{"tool": "file_op", "path": "a.txt", "action": "write", "content": "x"}"#,
        )
        .unwrap();
        assert_eq!(call, ToolCall::FileOp(FileOperation::write("a.txt", "x")));
        assert_eq!(call.params()["action"], "write");
        assert!(call.params().get("tool").is_none());
    }

    #[test]
    fn test_unknown_tool_is_rejected_at_parse_time() {
        assert!(serde_json::from_str::<ToolCall>(r#"{"tool": "browser", "url": "x"}"#).is_err());
    }

    #[test]
    fn test_decision_from_json() {
        let d = Decision::from_json(
            r#"{"type": "tool_call", "call": {"tool": "shell", "command": "pwd"}, "thought": "where am I"}"#,
        );
        assert_eq!(
            d,
            Decision::ToolCall {
                call: ToolCall::shell("pwd"),
                thought: Some("where am I".into())
            }
        );
        assert_eq!(
            Decision::from_json(r#"{"type": "final_answer", "answer": "42"}"#),
            Decision::FinalAnswer("42".into())
        );
        assert!(matches!(
            Decision::from_json("I think we should run ls"),
            Decision::Invalid { .. }
        ));
        assert!(matches!(
            Decision::from_json(r#"{"type": "tool_call", "call": {"tool": "teleport"}}"#),
            Decision::Invalid { .. }
        ));
    }

    #[test]
    fn test_validate() {
        assert!(ToolCall::shell("  ").validate().is_err());
        assert!(ToolCall::shell("ls").validate().is_ok());
        let bad_write = ToolCall::FileOp(FileOperation {
            path: "a".into(),
            action: FileAction::Write,
            content: None,
        });
        assert!(bad_write.validate().is_err());
        assert!(ToolCall::FileOp(FileOperation::list("")).validate().is_ok());
        assert!(ToolCall::FileOp(FileOperation::read("")).validate().is_err());
    }

    #[tokio::test]
    async fn test_scripted_decider_replays_then_finishes() {
        let decider = ScriptedDecider::new([Decision::tool(ToolCall::shell("ls"))])
            .then_fail(DecisionError::Timeout);
        let transcript = Transcript::new("list things");

        assert!(matches!(
            decider.next_action(&transcript).await.unwrap(),
            Decision::ToolCall { .. }
        ));
        assert!(decider.next_action(&transcript).await.is_err());
        assert_eq!(
            decider.next_action(&transcript).await.unwrap(),
            Decision::FinalAnswer("done".into())
        );
        assert_eq!(decider.observed_transcript_lengths(), vec![1, 1, 1]);
    }
}
