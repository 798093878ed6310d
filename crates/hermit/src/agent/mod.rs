//! The agent loop: plan → act → observe.
//!
//! An [`AgentLoop`] asks a [`DecisionCollaborator`] for the next action,
//! carries out exactly one tool call per decision through the sandbox, feeds
//! the observation back into the [`Transcript`], and repeats until a final
//! answer, a ceiling, a fatal failure or cancellation.

mod decision;
#[cfg(feature = "http-decider")]
mod http;
mod runner;
mod source;
mod task;
mod transcript;

pub use decision::{Decision, DecisionCollaborator, LoopingDecider, ScriptedDecider, ToolCall};
#[cfg(feature = "http-decider")]
pub use http::HttpDecider;
pub use runner::{AgentConfig, AgentLoop, AgentOutcome};
pub use source::AgentSource;
pub use task::{AgentLimits, AgentLimitsConfig, AgentMode, AgentTaskRecord, TaskState, TaskSummary};
pub use transcript::{MAX_OBSERVATION_CHARS, Transcript, TranscriptEntry};
