use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Emitter, EventSource};
use crate::error::{ErrorKind, SandboxError};
use crate::event::{AgentUpdate, SourceKind, Utf8Chunker};
use crate::executor::{ExecutionRequest, OutputChunk, SandboxExecutor};
use crate::workspace::Workspace;

/// Streams one command: `start`, `stdout`/`stderr` chunks as they are
/// produced, `exit`, then `complete` (or `error` on timeout or failure).
#[derive(Debug)]
pub struct CommandSource {
    executor: Arc<SandboxExecutor>,
    workspace: Workspace,
    request: ExecutionRequest,
}

impl CommandSource {
    /// Stream `request` in `workspace`.
    pub fn new(
        executor: Arc<SandboxExecutor>,
        workspace: Workspace,
        request: ExecutionRequest,
    ) -> Self {
        Self {
            executor,
            workspace,
            request,
        }
    }
}

#[async_trait]
impl EventSource for CommandSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Command
    }

    async fn run(self: Box<Self>, emitter: Emitter, cancel: CancellationToken) {
        let CommandSource {
            executor,
            workspace,
            request,
        } = *self;

        let start = AgentUpdate::Start {
            source: SourceKind::Command,
            detail: json!({
                "workspace_id": workspace.id,
                "command": request.command,
                "cwd": request.cwd,
            }),
        };
        if emitter.emit(start).await.is_err() {
            return;
        }

        let (sink, mut chunks) = mpsc::unbounded_channel();
        let execution = executor.execute(&workspace, request, Some(sink), &cancel);
        let forward = async {
            let mut out = Utf8Chunker::default();
            let mut err = Utf8Chunker::default();
            while let Some(chunk) = chunks.recv().await {
                let update = match chunk {
                    OutputChunk::Stdout(bytes) => AgentUpdate::Stdout {
                        data: out.push(&bytes),
                    },
                    OutputChunk::Stderr(bytes) => AgentUpdate::Stderr {
                        data: err.push(&bytes),
                    },
                };
                let empty = matches!(
                    &update,
                    AgentUpdate::Stdout { data } | AgentUpdate::Stderr { data } if data.is_empty()
                );
                if !empty {
                    let _ = emitter.emit(update).await;
                }
            }
            for (data, is_err) in [(out.finish(), false), (err.finish(), true)] {
                if data.is_empty() {
                    continue;
                }
                let update = if is_err {
                    AgentUpdate::Stderr { data }
                } else {
                    AgentUpdate::Stdout { data }
                };
                let _ = emitter.emit(update).await;
            }
        };
        // The sink is dropped when `execute` returns, which ends `forward`
        // after the last chunk.
        let (result, ()) = tokio::join!(execution, forward);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                log_failure(&e);
                let _ = emitter.emit(AgentUpdate::error(e.to_public())).await;
                return;
            }
        };

        let _ = emitter
            .emit(AgentUpdate::Exit {
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                cancelled: result.cancelled,
                truncated: result.truncated,
                duration_ms: result.duration.as_millis() as u64,
            })
            .await;

        let last = if result.timed_out {
            AgentUpdate::error(
                SandboxError::Timeout(result.duration.as_millis() as u64).to_public(),
            )
        } else if result.cancelled {
            AgentUpdate::Error {
                kind: ErrorKind::Cancelled,
                message: "command cancelled".into(),
            }
        } else {
            AgentUpdate::Complete {
                result: json!({
                    "exit_code": result.exit_code,
                    "duration_ms": result.duration.as_millis() as u64,
                    "truncated": result.truncated,
                }),
            }
        };
        let _ = emitter.emit(last).await;
    }
}

fn log_failure(e: &SandboxError) {
    match e.kind() {
        ErrorKind::Internal | ErrorKind::SandboxUnavailable => {
            tracing::warn!("streamed command failed: {}", e);
        }
        _ => tracing::debug!("streamed command rejected: {}", e),
    }
}
