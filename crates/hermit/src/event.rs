//! Typed progress events.
//!
//! [`AgentUpdate`] is the single event vocabulary for command streams, agent
//! runs and workspace subscriptions. Consumers dispatch on [`AgentUpdate::name`]
//! (the SSE `event:` field), never on payload shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::ToolCall;
use crate::error::{ErrorKind, PublicError};
use crate::workspace::TaskId;

/// What a stream was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One shell command.
    Command,
    /// One agent run.
    Agent,
    /// Live view of a workspace's background tasks.
    Subscription,
}

/// One event in a command, agent or subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentUpdate {
    /// Always the first event of a stream.
    Start {
        /// What produced the stream.
        source: SourceKind,
        /// Source-specific description (command line, prompt, ...).
        #[serde(default)]
        detail: serde_json::Value,
    },
    /// The agent decided to invoke a tool.
    ToolCall {
        /// 1-based iteration number.
        iteration: u32,
        /// The invocation.
        call: ToolCall,
        /// Narration the decision collaborator attached, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    /// Outcome of a tool invocation, as fed back to the agent.
    ToolResult {
        /// 1-based iteration number.
        iteration: u32,
        /// Whether the tool did what was asked.
        success: bool,
        /// Observation text.
        output: String,
        /// Structured failure, if the tool failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<PublicError>,
    },
    /// A chunk of standard output.
    Stdout {
        /// Chunk text (lossy UTF-8).
        data: String,
    },
    /// A chunk of standard error.
    Stderr {
        /// Chunk text (lossy UTF-8).
        data: String,
    },
    /// A process finished.
    Exit {
        /// Exit code (124 on timeout, 130 on cancellation, 128+n on signal n).
        exit_code: i32,
        /// The process was killed at its deadline.
        timed_out: bool,
        /// The process was killed because the caller went away.
        cancelled: bool,
        /// Output was cut at the configured limit.
        truncated: bool,
        /// Wall-clock duration.
        duration_ms: u64,
    },
    /// Always the last event of a successful stream.
    Complete {
        /// Final answer or result summary.
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Always the last event of a failed stream.
    Error {
        /// Failure classification.
        kind: ErrorKind,
        /// Safe message.
        message: String,
    },
    /// Keep-alive for long-lived channels.
    Heartbeat {
        /// When the heartbeat was produced.
        at: DateTime<Utc>,
    },
}

impl AgentUpdate {
    /// The event name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            AgentUpdate::Start { .. } => "start",
            AgentUpdate::ToolCall { .. } => "tool_call",
            AgentUpdate::ToolResult { .. } => "tool_result",
            AgentUpdate::Stdout { .. } => "stdout",
            AgentUpdate::Stderr { .. } => "stderr",
            AgentUpdate::Exit { .. } => "exit",
            AgentUpdate::Complete { .. } => "complete",
            AgentUpdate::Error { .. } => "error",
            AgentUpdate::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Whether this event ends a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentUpdate::Complete { .. } | AgentUpdate::Error { .. })
    }

    /// Build an `error` event from a public error.
    pub fn error(err: PublicError) -> Self {
        AgentUpdate::Error {
            kind: err.kind,
            message: err.message,
        }
    }

    /// Build a `heartbeat` stamped now.
    pub fn heartbeat() -> Self {
        AgentUpdate::Heartbeat { at: Utc::now() }
    }
}

/// An update as persisted for an agent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedUpdate {
    /// Position within the task, starting at 0.
    pub seq: u64,
    /// When it was produced.
    pub at: DateTime<Utc>,
    /// The update.
    pub update: AgentUpdate,
}

/// An update as delivered on a stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Strictly increasing per channel, starting at 0.
    pub seq: u64,
    /// The agent task this update belongs to, for subscriptions and agent runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// The update.
    #[serde(flatten)]
    pub update: AgentUpdate,
}

impl StreamEvent {
    /// The event name (see [`AgentUpdate::name`]).
    pub fn name(&self) -> &'static str {
        self.update.name()
    }

    /// JSON payload for the wire.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Render as a Server-Sent-Events frame.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload())
    }
}

/// Decodes byte chunks into text without splitting multi-byte characters
/// across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Feed bytes, returning the longest decodable prefix.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Genuinely invalid bytes: decode lossily rather than stall.
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    /// Flush whatever is left.
    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(AgentUpdate::heartbeat().name(), "heartbeat");
        assert_eq!(
            AgentUpdate::Stdout {
                data: "x".into()
            }
            .name(),
            "stdout"
        );
        assert!(
            AgentUpdate::Complete {
                result: serde_json::Value::Null
            }
            .is_terminal()
        );
        assert!(!AgentUpdate::heartbeat().is_terminal());
    }

    #[test]
    fn test_stream_event_sse_frame() {
        let event = StreamEvent {
            seq: 3,
            task_id: None,
            update: AgentUpdate::Stdout {
                data: "hi\n".into(),
            },
        };
        let frame = event.to_sse();
        assert!(frame.starts_with("event: stdout\ndata: {"));
        assert!(frame.ends_with("\n\n"));

        let data = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(value["seq"], 3);
        assert_eq!(value["type"], "stdout");
        assert_eq!(value["data"], "hi\n");
    }

    #[test]
    fn test_error_update_from_public_error() {
        let update = AgentUpdate::error(PublicError {
            kind: ErrorKind::SandboxUnavailable,
            message: "gone".into(),
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "sandbox_unavailable");
    }

    #[test]
    fn test_utf8_chunker_keeps_split_characters_together() {
        let bytes = "héllo".as_bytes();
        let mut chunker = Utf8Chunker::default();
        // split inside the two-byte 'é'
        let first = chunker.push(&bytes[..2]);
        let second = chunker.push(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_utf8_chunker_invalid_bytes_do_not_stall() {
        let mut chunker = Utf8Chunker::default();
        let text = chunker.push(&[0xff, b'a']);
        assert!(text.ends_with('a'));
    }
}
