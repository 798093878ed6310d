//! The plan → act → observe loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::decision::{Decision, DecisionCollaborator, ToolCall};
use super::task::{AgentLimitsConfig, AgentTaskRecord, TaskState};
use super::transcript::Transcript;
use crate::error::{DecisionError, ErrorKind, PublicError, SandboxError};
use crate::event::{AgentUpdate, SourceKind, Utf8Chunker};
use crate::executor::{ExecutionRequest, OutputChunk, SandboxExecutor};
use crate::fs::FileStore;
use crate::store::Store;
use crate::workspace::{TaskId, Workspace, WorkspaceId};

/// Agent loop settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Iteration and wall-clock ceilings per mode.
    pub limits: AgentLimitsConfig,
    /// How long one decision may take.
    pub decision_timeout: Duration,
    /// Autonomous runs deliver narration in batches of this many updates.
    pub narration_batch: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            limits: AgentLimitsConfig::default(),
            decision_timeout: Duration::from_secs(120),
            narration_batch: 16,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    /// The task.
    pub task_id: TaskId,
    /// Terminal state.
    pub state: TaskState,
    /// Final answer, when done.
    pub result: Option<String>,
    /// Why it stopped otherwise.
    pub error: Option<PublicError>,
    /// Planning rounds used.
    pub iterations: u32,
}

enum Planned {
    Decided(Result<Decision, DecisionError>),
    Cancelled,
    OutOfTime,
}

struct Observation {
    success: bool,
    output: String,
    error: Option<SandboxError>,
}

/// Persists every update and forwards it to the caller: immediately in
/// interactive mode, in batches in autonomous mode. Delivery failures are
/// ignored; they never affect the actions already taken.
struct Reporter<'a> {
    store: &'a dyn Store,
    task_id: TaskId,
    tx: Option<mpsc::UnboundedSender<AgentUpdate>>,
    batch: usize,
    pending: Vec<AgentUpdate>,
}

impl Reporter<'_> {
    async fn report(&mut self, update: AgentUpdate) {
        if let Err(e) = self.store.append_update(self.task_id, update.clone()).await {
            tracing::warn!(task = %self.task_id, "failed to persist agent update: {}", e);
        }
        if self.tx.is_none() {
            return;
        }
        let terminal = update.is_terminal();
        self.pending.push(update);
        if terminal || self.pending.len() >= self.batch {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        for update in std::mem::take(&mut self.pending) {
            if tx.send(update).is_err() {
                // Receiver gone; keep running, the run is persisted regardless.
                return;
            }
        }
        self.tx = Some(tx);
    }
}

/// Drives agent tasks against one set of collaborators.
#[derive(Debug)]
pub struct AgentLoop {
    executor: Arc<SandboxExecutor>,
    files: FileStore,
    store: Arc<dyn Store>,
    decider: Arc<dyn DecisionCollaborator>,
    config: AgentConfig,
    running: Mutex<HashMap<TaskId, (WorkspaceId, CancellationToken)>>,
}

impl AgentLoop {
    /// Create a loop.
    pub fn new(
        executor: Arc<SandboxExecutor>,
        files: FileStore,
        store: Arc<dyn Store>,
        decider: Arc<dyn DecisionCollaborator>,
        config: AgentConfig,
    ) -> Self {
        Self {
            executor,
            files,
            store,
            decider,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// The loop's settings.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancel a running task. Returns false when it is not running here.
    pub fn cancel(&self, task: TaskId) -> bool {
        let token = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(&task).map(|(_, token)| token.clone()));
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running task of a workspace.
    pub fn cancel_workspace(&self, workspace: WorkspaceId) {
        if let Ok(running) = self.running.lock() {
            for (ws, token) in running.values() {
                if *ws == workspace {
                    token.cancel();
                }
            }
        }
    }

    /// Whether `task` is currently being driven by this loop.
    pub fn is_running(&self, task: TaskId) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(&task))
            .unwrap_or(false)
    }

    /// Run `task` to completion in `workspace`.
    ///
    /// The task row must already exist in the store. Updates go to `updates`
    /// when given; they are persisted either way. Cancelling `cancel` (or
    /// calling [`AgentLoop::cancel`]) stops the run, and any command it is
    /// running, with state `Cancelled`.
    pub async fn run(
        &self,
        workspace: &Workspace,
        task: &AgentTaskRecord,
        updates: Option<mpsc::UnboundedSender<AgentUpdate>>,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        if let Ok(mut running) = self.running.lock() {
            running.insert(task.id, (workspace.id, cancel.clone()));
        }
        let outcome = self.drive(workspace, task, updates, cancel).await;
        if let Ok(mut running) = self.running.lock() {
            running.remove(&task.id);
        }
        outcome
    }

    async fn drive(
        &self,
        workspace: &Workspace,
        task: &AgentTaskRecord,
        updates: Option<mpsc::UnboundedSender<AgentUpdate>>,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        let limits = task.mode.limits(&self.config.limits);
        let batch = if task.mode.is_autonomous() {
            self.config.narration_batch.max(1)
        } else {
            1
        };
        let mut reporter = Reporter {
            store: self.store.as_ref(),
            task_id: task.id,
            tx: updates,
            batch,
            pending: Vec::new(),
        };
        let started = Instant::now();
        let deadline = limits.max_wall_time.map(|d| started + d);

        tracing::info!(
            task = %task.id,
            workspace = %workspace.id,
            mode = %task.mode,
            max_iterations = limits.max_iterations,
            "agent run started"
        );
        if let Err(e) = self
            .store
            .finish_task(task.id, TaskState::Running, None, None)
            .await
        {
            tracing::warn!(task = %task.id, "failed to mark task running: {}", e);
        }

        reporter
            .report(AgentUpdate::Start {
                source: SourceKind::Agent,
                detail: json!({
                    "task_id": task.id,
                    "workspace_id": workspace.id,
                    "prompt": task.prompt,
                    "mode": task.mode,
                    "model": task.model,
                }),
            })
            .await;

        let mut transcript = Transcript::new(task.prompt.clone());
        let mut iteration: u32 = 0;

        let (state, result, error) = loop {
            if cancel.is_cancelled() {
                break cancelled();
            }
            if iteration >= limits.max_iterations {
                break aborted(format!(
                    "iteration limit of {} reached without a final answer",
                    limits.max_iterations
                ));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break out_of_time(limits.max_wall_time);
            }
            iteration += 1;

            let decide = tokio::time::timeout(
                self.config.decision_timeout,
                self.decider.next_action(&transcript),
            );
            let planned = tokio::select! {
                biased;
                _ = cancel.cancelled() => Planned::Cancelled,
                _ = sleep_until(deadline) => Planned::OutOfTime,
                decided = decide => Planned::Decided(decided.unwrap_or(Err(DecisionError::Timeout))),
            };
            let decision = match planned {
                Planned::Cancelled => break cancelled(),
                Planned::OutOfTime => break out_of_time(limits.max_wall_time),
                Planned::Decided(decision) => decision,
            };

            match decision {
                Ok(Decision::FinalAnswer(answer)) => {
                    transcript.push_assistant(answer.clone());
                    break (TaskState::Done, Some(answer), None);
                }
                Ok(Decision::ToolCall { call, thought }) => {
                    if let Some(thought) = &thought {
                        transcript.push_assistant(thought.clone());
                    }
                    transcript.push_tool_call(&call);
                    reporter
                        .report(AgentUpdate::ToolCall {
                            iteration,
                            call: call.clone(),
                            thought,
                        })
                        .await;

                    let observation = match call.validate() {
                        Ok(()) => {
                            self.dispatch(workspace, &call, &mut reporter, &cancel)
                                .await
                        }
                        Err(reason) => Observation {
                            success: false,
                            output: format!("invalid tool call: {reason}"),
                            error: Some(SandboxError::InvalidRequest(reason)),
                        },
                    };
                    transcript.push_tool_result(observation.success, &observation.output);
                    let fatal = observation.error.as_ref().and_then(fatal_error);
                    reporter
                        .report(AgentUpdate::ToolResult {
                            iteration,
                            success: observation.success,
                            output: observation.output,
                            error: observation.error.as_ref().map(SandboxError::to_public),
                        })
                        .await;

                    if cancel.is_cancelled() {
                        break cancelled();
                    }
                    if let Some(fatal) = fatal {
                        tracing::warn!(task = %task.id, kind = %fatal.kind, "agent run failed");
                        break (TaskState::Failed, None, Some(fatal));
                    }
                }
                Ok(Decision::Invalid { raw, reason }) => {
                    tracing::debug!(task = %task.id, reason = %reason, "unusable decision");
                    let output = format!("could not understand the decision ({reason}): {raw}");
                    transcript.push_tool_result(false, &output);
                    reporter
                        .report(AgentUpdate::ToolResult {
                            iteration,
                            success: false,
                            output,
                            error: Some(PublicError {
                                kind: ErrorKind::Decision,
                                message: "decision could not be understood".into(),
                            }),
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, "decision collaborator failed: {}", e);
                    let output = format!("decision failed: {e}");
                    transcript.push_tool_result(false, &output);
                    reporter
                        .report(AgentUpdate::ToolResult {
                            iteration,
                            success: false,
                            output,
                            error: Some(SandboxError::from(e).to_public()),
                        })
                        .await;
                }
            }
        };

        let last = match (&state, &result, &error) {
            (TaskState::Done, Some(answer), _) => AgentUpdate::Complete {
                result: json!({ "answer": answer, "iterations": iteration }),
            },
            (_, _, Some(err)) => AgentUpdate::error(err.clone()),
            _ => AgentUpdate::error(PublicError {
                kind: ErrorKind::Internal,
                message: "agent run ended without a result".into(),
            }),
        };
        reporter.report(last).await;
        reporter.flush();

        if let Err(e) = self
            .store
            .finish_task(task.id, state, result.clone(), error.clone())
            .await
        {
            tracing::warn!(task = %task.id, "failed to persist task outcome: {}", e);
        }
        tracing::info!(
            task = %task.id,
            state = ?state,
            iterations = iteration,
            "agent run finished"
        );

        AgentOutcome {
            task_id: task.id,
            state,
            result,
            error,
            iterations: iteration,
        }
    }

    /// Carry out one tool call. Runs exactly once.
    async fn dispatch(
        &self,
        workspace: &Workspace,
        call: &ToolCall,
        reporter: &mut Reporter<'_>,
        cancel: &CancellationToken,
    ) -> Observation {
        match call {
            ToolCall::Shell {
                command,
                cwd,
                timeout_ms,
            } => {
                let request = ExecutionRequest {
                    command: command.clone(),
                    cwd: cwd.clone(),
                    timeout: timeout_ms.map(Duration::from_millis),
                };
                self.run_shell(workspace, request, reporter, cancel).await
            }
            ToolCall::FileOp(op) => match self.files.apply(workspace, op).await {
                Ok(output) => Observation {
                    success: true,
                    output: output.observation(),
                    error: None,
                },
                Err(e) => Observation {
                    success: false,
                    output: e.safe_message(),
                    error: Some(e),
                },
            },
        }
    }

    async fn run_shell(
        &self,
        workspace: &Workspace,
        request: ExecutionRequest,
        reporter: &mut Reporter<'_>,
        cancel: &CancellationToken,
    ) -> Observation {
        let (sink, mut chunks) = mpsc::unbounded_channel();
        let execution = self.executor.execute(workspace, request, Some(sink), cancel);
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
                if let AgentUpdate::Stdout { data } | AgentUpdate::Stderr { data } = &update
                    && data.is_empty()
                {
                    continue;
                }
                reporter.report(update).await;
            }
            let (rest_out, rest_err) = (out.finish(), err.finish());
            if !rest_out.is_empty() {
                reporter.report(AgentUpdate::Stdout { data: rest_out }).await;
            }
            if !rest_err.is_empty() {
                reporter.report(AgentUpdate::Stderr { data: rest_err }).await;
            }
        };
        let (executed, ()) = tokio::join!(execution, forward);

        match executed {
            Ok(result) => {
                reporter
                    .report(AgentUpdate::Exit {
                        exit_code: result.exit_code,
                        timed_out: result.timed_out,
                        cancelled: result.cancelled,
                        truncated: result.truncated,
                        duration_ms: result.duration.as_millis() as u64,
                    })
                    .await;
                let mut output = result.combined_output();
                if result.timed_out {
                    output.push_str(&format!(
                        "\n[timed out after {} ms]",
                        result.duration.as_millis()
                    ));
                } else {
                    output.push_str(&format!("\n[exit code {}]", result.exit_code));
                }
                Observation {
                    success: result.success(),
                    output,
                    error: result
                        .timed_out
                        .then(|| SandboxError::Timeout(result.duration.as_millis() as u64)),
                }
            }
            Err(e) => Observation {
                success: false,
                output: e.safe_message(),
                error: Some(e),
            },
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Tool failures that retrying inside the same run cannot fix.
fn fatal_error(error: &SandboxError) -> Option<PublicError> {
    matches!(
        error,
        SandboxError::SandboxUnavailable(_) | SandboxError::Internal(_)
    )
    .then(|| error.to_public())
}

fn cancelled() -> (TaskState, Option<String>, Option<PublicError>) {
    (
        TaskState::Cancelled,
        None,
        Some(PublicError {
            kind: ErrorKind::Cancelled,
            message: "agent run cancelled".into(),
        }),
    )
}

fn aborted(message: String) -> (TaskState, Option<String>, Option<PublicError>) {
    (
        TaskState::Aborted,
        None,
        Some(PublicError {
            kind: ErrorKind::Aborted,
            message,
        }),
    )
}

fn out_of_time(limit: Option<Duration>) -> (TaskState, Option<String>, Option<PublicError>) {
    let ms = limit.map(|d| d.as_millis()).unwrap_or_default();
    aborted(format!("wall-clock limit of {ms} ms reached"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::decision::ScriptedDecider;
    use crate::agent::task::AgentMode;
    use crate::executor::HostLauncher;
    use crate::store::InMemoryStore;
    use crate::workspace::WorkspaceConfig;

    fn unusable() -> Decision {
        Decision::Invalid {
            raw: "hmm".into(),
            reason: "not json".into(),
        }
    }

    /// Takes `delay` per decision and never produces a usable one.
    #[derive(Debug)]
    struct Dawdler {
        delay: Duration,
    }

    #[async_trait]
    impl DecisionCollaborator for Dawdler {
        async fn next_action(&self, _transcript: &Transcript) -> Result<Decision, DecisionError> {
            tokio::time::sleep(self.delay).await;
            Ok(unusable())
        }
    }

    /// Hangs on the first call, answers on every later one.
    #[derive(Debug, Default)]
    struct HangsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DecisionCollaborator for HangsOnce {
        async fn next_action(&self, _transcript: &Transcript) -> Result<Decision, DecisionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(Decision::FinalAnswer("recovered".into()))
        }
    }

    struct Harness {
        agent: AgentLoop,
        store: Arc<InMemoryStore>,
        workspace: Workspace,
    }

    fn harness(decider: Arc<dyn DecisionCollaborator>, config: AgentConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let launcher = Arc::new(HostLauncher::new());
        let executor = SandboxExecutor::new(launcher, store.clone(), "/workspace");
        let agent = AgentLoop::new(
            Arc::new(executor),
            FileStore::new("/workspace"),
            store.clone(),
            decider,
            config,
        );
        let workspace = Workspace::local(std::env::temp_dir(), WorkspaceConfig::default());
        Harness {
            agent,
            store,
            workspace,
        }
    }

    impl Harness {
        async fn task(&self, mode: AgentMode) -> AgentTaskRecord {
            let task = AgentTaskRecord::new(self.workspace.id, "alice", "do it", mode, None);
            self.store.insert_task(task.clone()).await.unwrap();
            task
        }

        async fn persisted(&self, task: TaskId) -> Vec<AgentUpdate> {
            let record = self.store.get_task(task).await.unwrap().unwrap();
            record.updates.into_iter().map(|r| r.update).collect()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentUpdate>) -> Vec<AgentUpdate> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn stdout(data: &str) -> AgentUpdate {
        AgentUpdate::Stdout { data: data.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_autonomous_wall_clock_ceiling_aborts() {
        let mut config = AgentConfig::default();
        config.limits.autonomous_max_wall_time = Some(Duration::from_millis(300));
        let h = harness(
            Arc::new(Dawdler {
                delay: Duration::from_millis(100),
            }),
            config,
        );
        let task = h.task(AgentMode::Autonomous { max_iterations: 50 }).await;

        let outcome = h
            .agent
            .run(&h.workspace, &task, None, CancellationToken::new())
            .await;
        assert_eq!(outcome.state, TaskState::Aborted);
        assert_eq!(outcome.iterations, 3);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Aborted);
        assert_eq!(error.message, "wall-clock limit of 300 ms reached");

        let record = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Aborted);
        assert!(matches!(
            record.updates.last().map(|r| &r.update),
            Some(AgentUpdate::Error {
                kind: ErrorKind::Aborted,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_runs_have_no_wall_clock_by_default() {
        let h = harness(
            Arc::new(Dawdler {
                delay: Duration::from_secs(60),
            }),
            AgentConfig::default(),
        );
        let task = h.task(AgentMode::Interactive).await;

        let outcome = h
            .agent
            .run(&h.workspace, &task, None, CancellationToken::new())
            .await;
        // Only the iteration ceiling stops it.
        assert_eq!(outcome.state, TaskState::Aborted);
        assert_eq!(outcome.iterations, 10);
        assert!(outcome.error.unwrap().message.contains("iteration limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_timeout_is_an_observation() {
        let config = AgentConfig {
            decision_timeout: Duration::from_secs(1),
            ..AgentConfig::default()
        };
        let decider = Arc::new(HangsOnce::default());
        let h = harness(decider.clone(), config);
        let task = h.task(AgentMode::Interactive).await;

        let outcome = h
            .agent
            .run(&h.workspace, &task, None, CancellationToken::new())
            .await;
        assert_eq!(outcome.state, TaskState::Done);
        assert_eq!(outcome.result.as_deref(), Some("recovered"));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(decider.calls.load(Ordering::SeqCst), 2);

        let updates = h.persisted(task.id).await;
        let failed = updates
            .iter()
            .find_map(|u| match u {
                AgentUpdate::ToolResult {
                    success: false,
                    output,
                    error: Some(error),
                    ..
                } => Some((output.clone(), error.kind)),
                _ => None,
            })
            .unwrap();
        assert!(failed.0.contains("decision timed out"), "{}", failed.0);
        assert_eq!(failed.1, ErrorKind::Decision);
        assert!(matches!(updates.last(), Some(AgentUpdate::Complete { .. })));
    }

    #[tokio::test]
    async fn test_narration_is_delivered_in_batches() {
        let store = InMemoryStore::new();
        let mode = AgentMode::autonomous();
        let task = AgentTaskRecord::new(WorkspaceId::new(), "alice", "p", mode, None);
        store.insert_task(task.clone()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = Reporter {
            store: &store,
            task_id: task.id,
            tx: Some(tx),
            batch: 3,
            pending: Vec::new(),
        };

        reporter.report(stdout("a")).await;
        reporter.report(stdout("b")).await;
        assert!(drain(&mut rx).is_empty());
        reporter.report(stdout("c")).await;
        assert_eq!(drain(&mut rx), vec![stdout("a"), stdout("b"), stdout("c")]);

        // The terminal update flushes a partial batch.
        reporter.report(stdout("d")).await;
        let done = AgentUpdate::Complete {
            result: json!({ "answer": "ok" }),
        };
        reporter.report(done.clone()).await;
        assert_eq!(drain(&mut rx), vec![stdout("d"), done]);

        let record = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(record.updates.len(), 5);
    }

    #[tokio::test]
    async fn test_gone_receiver_does_not_stop_persistence() {
        let store = InMemoryStore::new();
        let mode = AgentMode::Interactive;
        let task = AgentTaskRecord::new(WorkspaceId::new(), "alice", "p", mode, None);
        store.insert_task(task.clone()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reporter = Reporter {
            store: &store,
            task_id: task.id,
            tx: Some(tx),
            batch: 1,
            pending: Vec::new(),
        };

        reporter.report(stdout("seen")).await;
        drop(rx);
        reporter.report(stdout("lost")).await;
        reporter.report(stdout("also lost")).await;
        assert!(reporter.tx.is_none());
        assert!(reporter.pending.is_empty());

        let record = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(record.updates.len(), 3);
    }

    #[tokio::test]
    async fn test_autonomous_run_delivers_every_update_in_order() {
        let config = AgentConfig {
            narration_batch: 4,
            ..AgentConfig::default()
        };
        let decider = ScriptedDecider::new([unusable(), unusable(), unusable()]);
        let h = harness(Arc::new(decider), config);
        let task = h.task(AgentMode::autonomous()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .agent
            .run(&h.workspace, &task, Some(tx), CancellationToken::new())
            .await;
        assert_eq!(outcome.state, TaskState::Done);

        let delivered = drain(&mut rx);
        assert_eq!(delivered, h.persisted(task.id).await);
        assert_eq!(delivered.len(), 5);
        assert!(matches!(delivered[0], AgentUpdate::Start { .. }));
        assert!(delivered[4].is_terminal());
    }
}
