//! The conversation state handed to the decision collaborator.
//!
//! Rendered in a compact, markdown-friendly form:
//!
//! ```text
//! U> Fix the failing test
//!
//! A> Let me look at the test output first.
//!
//! T[shell] {"command":"cargo test"}
//! R> {"success":false,"output":"..."}
//! ```
//!
//! - `U>` the task prompt
//! - `A>` assistant narration and the final answer
//! - `T[tool]` a tool invocation with its JSON parameters
//! - `R>` the observation fed back (JSON)

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::decision::ToolCall;

/// Observations longer than this are cut before they reach the collaborator.
pub const MAX_OBSERVATION_CHARS: usize = 16 * 1024;

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// The task prompt.
    User {
        /// Text.
        content: String,
    },
    /// Narration or final answer.
    Assistant {
        /// Text.
        content: String,
    },
    /// A tool invocation.
    ToolCall {
        /// The call.
        call: ToolCall,
    },
    /// What the tool produced.
    ToolResult {
        /// Whether the tool did what was asked.
        success: bool,
        /// Observation text.
        output: String,
    },
}

/// Ordered record of an agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Start a transcript with the task prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            entries: vec![TranscriptEntry::User {
                content: prompt.into(),
            }],
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in order.
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// The task prompt.
    pub fn prompt(&self) -> Option<&str> {
        self.entries.iter().find_map(|e| match e {
            TranscriptEntry::User { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Record narration.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.entries.push(TranscriptEntry::Assistant {
            content: content.into(),
        });
    }

    /// Record a tool invocation.
    pub fn push_tool_call(&mut self, call: &ToolCall) {
        self.entries.push(TranscriptEntry::ToolCall { call: call.clone() });
    }

    /// Record an observation, cut to [`MAX_OBSERVATION_CHARS`].
    pub fn push_tool_result(&mut self, success: bool, output: &str) {
        self.entries.push(TranscriptEntry::ToolResult {
            success,
            output: clip(output, MAX_OBSERVATION_CHARS),
        });
    }

    /// Number of tool invocations recorded.
    pub fn tool_calls(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, TranscriptEntry::ToolCall { .. }))
            .count()
    }

    /// Render in the compact `U>`/`A>`/`T[..]`/`R>` form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                TranscriptEntry::User { content } => out.push_str(&prefixed("U> ", content)),
                TranscriptEntry::Assistant { content } => out.push_str(&prefixed("A> ", content)),
                TranscriptEntry::ToolCall { call } => {
                    let params = serde_json::to_string(&call.params())
                        .unwrap_or_else(|_| "{}".to_string());
                    out.push_str(&format!("T[{}] {params}\n", call.name()));
                }
                TranscriptEntry::ToolResult { success, output } => {
                    let result = json!({ "success": success, "output": output });
                    let rendered = serde_json::to_string(&result).unwrap_or_default();
                    out.push_str(&format!("R> {rendered}\n\n"));
                }
            }
        }
        out
    }

    /// Chat-style messages (`role`/`content`) for HTTP collaborators.
    pub fn to_messages(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .map(|entry| match entry {
                TranscriptEntry::User { content } => json!({ "role": "user", "content": content }),
                TranscriptEntry::Assistant { content } => {
                    json!({ "role": "assistant", "content": content })
                }
                TranscriptEntry::ToolCall { call } => json!({
                    "role": "assistant",
                    "tool_call": call,
                }),
                TranscriptEntry::ToolResult { success, output } => json!({
                    "role": "tool",
                    "success": success,
                    "content": output,
                }),
            })
            .collect()
    }
}

fn prefixed(prefix: &str, message: &str) -> String {
    let mut out = String::from(prefix);
    for (i, line) in message.lines().enumerate() {
        if i > 0 {
            out.push_str("\n   ");
        }
        out.push_str(line);
    }
    out.push_str("\n\n");
    out
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("\n... [observation truncated] ...");
    clipped
}
